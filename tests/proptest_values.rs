//! Property-based tests for number scanning, value equality and arithmetic.

mod common;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use blox::scanner::{Scanner, Token};
use common::*;
use proptest::prelude::*;

fn hash_of(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn tokens(source: &str) -> Vec<Token> {
    Scanner::new(source)
        .map(|lexeme| lexeme.token())
        .take_while(|&token| token != Token::Eof)
        .collect()
}

proptest! {
    #[test]
    fn digits_scan_as_ints(literal in "[0-9]{1,18}") {
        prop_assert_eq!(vec![Token::Int], tokens(&literal));
    }

    #[test]
    fn digits_with_a_fraction_scan_as_floats(literal in "[0-9]{1,12}\\.[0-9]{1,6}") {
        prop_assert_eq!(vec![Token::Float], tokens(&literal));
    }

    #[test]
    fn a_trailing_dot_is_not_part_of_the_number(literal in "[0-9]{1,12}") {
        let source = format!("{literal}.");
        prop_assert_eq!(vec![Token::Int, Token::Dot], tokens(&source));
    }

    #[test]
    fn int_literals_print_back_unchanged(n in 0..i64::MAX) {
        let output = run(&format!("print {n}")).unwrap();
        prop_assert_eq!(format!("{n}\n"), output);
    }

    #[test]
    fn equal_ints_hash_alike(a in any::<i64>(), b in any::<i64>()) {
        let (x, y) = (Value::Int(a), Value::Int(b));
        prop_assert_eq!(a == b, x == y);
        if x == y {
            prop_assert_eq!(hash_of(&x), hash_of(&y));
        }
    }

    #[test]
    fn equal_floats_hash_alike(a in any::<f64>(), b in prop_oneof![Just(0.0), Just(-0.0), any::<f64>()]) {
        let (x, y) = (Value::Float(a), Value::Float(b));
        if x == y {
            prop_assert_eq!(hash_of(&x), hash_of(&y));
        }
        prop_assert_eq!(x.clone(), x);
    }

    #[test]
    fn strings_compare_by_contents(contents in ".*") {
        let (x, y) = (Value::from(contents.as_str()), Value::from(contents.clone()));
        prop_assert_eq!(&x, &y);
        prop_assert_eq!(hash_of(&x), hash_of(&y));
    }

    #[test]
    fn ints_and_floats_are_only_loosely_equal(n in -1_000_000_i64..1_000_000) {
        let (int, float) = (Value::Int(n), Value::Float(n as f64));
        prop_assert_ne!(&int, &float);
        prop_assert!(int.equal(&float));
    }

    #[test]
    fn int_arithmetic_matches_rust(a in -1_000_000_i64..1_000_000, b in -1_000_000_i64..1_000_000) {
        let output = run(&format!("var a = {a}\nvar b = {b}\nprint a + b\nprint a - b\nprint a * b")).unwrap();
        prop_assert_eq!(format!("{}\n{}\n{}\n", a + b, a - b, a * b), output);
    }

    #[test]
    fn appending_grows_a_list(n in 0_usize..50) {
        let output = run(&format!("var l = []\nfor (var i = 0; i < {n}; i = i + 1) append(l, i)\nprint len(l)")).unwrap();
        prop_assert_eq!(format!("{n}\n"), output);
    }
}
