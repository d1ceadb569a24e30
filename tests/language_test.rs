//! Integration tests for the core language: variables, closures, classes, control flow and the
//! builtin collections.

#[macro_use]
mod common;

use common::*;

#[test]
fn statements_end_at_newlines_or_semicolons() {
    assert_prints!("print 1; print 2\nprint 3", "1\n2\n3\n");
    assert_prints!("var x = 1 +\n  2\nprint x", "3\n");
}

#[test]
fn closures_keep_their_variables_alive() {
    let source = r#"
        func counter() {
            var n = 0
            func bump() {
                n = n + 1
                print n
            }
            return bump
        }
        var c = counter()
        c()
        c()
    "#;
    assert_prints!(source, "1\n2\n");
}

#[test]
fn closures_share_a_captured_variable() {
    let source = r#"
        var get
        var set
        {
            var x = 1
            func g() { return x }
            func s(value) { x = value }
            get = g
            set = s
        }
        set(2)
        print get()
    "#;
    assert_prints!(source, "2\n");
}

#[test]
fn closures_in_a_loop_capture_each_iteration() {
    let source = r#"
        var fs = []
        for (var i = 0; i < 3; i = i + 1) {
            var j = i
            append(fs, func () { return j })
        }
        print fs[0]() + fs[1]() + fs[2]()
    "#;
    assert_prints!(source, "3\n");
}

#[test]
fn constants_cannot_be_reassigned() {
    assert_runtime_error!("const x = 1\nx = 2", "Cannot assign to const 'x'.");
    assert_runtime_error!(
        "func f() {\n  const y = 1\n  y = 2\n}\nf()",
        "Cannot assign to const 'y'."
    );
    assert_prints!("const x = 1\nprint x + 1", "2\n");
}

#[test]
fn undefined_variables_are_runtime_errors() {
    assert_runtime_error!("print nope", "Undefined variable 'nope'.");
    assert_runtime_error!("nope = 1", "Undefined variable 'nope'.");
}

#[test]
fn subscripts_wrap_negative_indices_once() {
    assert_prints!("var l = [1, 2, 3]\nprint l[-1]\nprint l[0]", "3\n1\n");
    assert_runtime_error!("var l = [1, 2, 3]\nprint l[3]", "Subscript out of range.");
    assert_runtime_error!("var l = [1, 2, 3]\nprint l[-4]", "Subscript out of range.");
    assert_runtime_error!("print [1][\"0\"]", "Subscript must be an integer.");
    assert_prints!("print \"blox\"[1]", "l\n");
}

#[test]
fn lists_are_mutable_through_subscripts() {
    assert_prints!("var l = [1, 2, 3]\nl[1] = 20\nprint l", "[1, 20, 3]\n");
    assert_prints!("var l = [1]\nprint l[0] = 5", "5\n");
}

#[test]
fn inheritance_and_super() {
    let source = r#"
        class Animal {
            init(name) { this.name = name }
            speak() { return this.name + " makes a sound" }
        }
        class Dog < Animal {
            speak() { return super.speak() + ", woof" }
        }
        var d = Dog("Rex")
        print d.speak()
        print d
    "#;
    assert_prints!(source, "Rex makes a sound, woof\nDog instance\n");
}

#[test]
fn methods_can_be_stored_and_called_later() {
    let source = r#"
        class Greeter {
            init(greeting) { this.greeting = greeting }
            func greet(who) { return this.greeting + ", " + who }
        }
        var greet = Greeter("hello").greet
        print greet("world")
    "#;
    assert_prints!(source, "hello, world\n");
}

#[test]
fn properties_need_instances() {
    assert_runtime_error!("var x = 1\nprint x.y", "Only instances have properties.");
    assert_runtime_error!("var x = 1\nx.y = 2", "Only instances have fields.");
    assert_runtime_error!("class A {}\nprint A().missing", "Undefined property 'missing'.");
    assert_runtime_error!("var NotAClass = 1\nclass A < NotAClass {}", "Superclass must be a class.");
}

#[test]
fn break_and_continue_in_nested_loops() {
    let source = r#"
        for (var i = 0; i < 3; i = i + 1) {
            for (var j = 0; j < 3; j = j + 1) {
                if (j == 1) continue
                if (j == 2) break
                print i * 10 + j
            }
            if (i == 1) break
        }
        var n = 0
        while (true) {
            n = n + 1
            if (n < 5) continue
            break
        }
        print n
    "#;
    assert_prints!(source, "0\n10\n5\n");
}

#[test]
fn break_and_continue_discard_locals_of_the_loop_body() {
    let source = r#"
        func run() {
            var before = "before"
            for (var i = 0; i < 3; i = i + 1) {
                var x = i
                if (i == 1) continue
                print x
            }
            var n = 0
            while (true) {
                var y = n
                n = n + 1
                if (y == 2) break
            }
            var after = "after"
            print before + " " + after + " " + str(n)
        }
        run()
        for (var i = 0; i < 3; i = i + 1) {
            var x = i * 10
            if (i == 1) continue
            print x
        }
        {
            var later = "later"
            print later
        }
    "#;
    assert_prints!(source, "0\n2\nbefore after 3\n0\n20\nlater\n");
}

#[test]
fn comparisons_with_nan_are_false() {
    let source = r#"
        var nan = 0.0 / 0.0
        print nan < 1
        print nan <= 1
        print nan > 1
        print nan >= 1
        print 1 >= nan
        print 1 <= nan
        print nan == nan
    "#;
    assert_prints!(source, "false\nfalse\nfalse\nfalse\nfalse\nfalse\nfalse\n");
    assert_prints!("print 2 >= 2\nprint 2 <= 1.5\nprint \"a\" <= \"b\"", "true\nfalse\ntrue\n");
}

#[test]
fn self_containing_lists_print_and_compare() {
    let source = r#"
        var l = [1]
        append(l, l)
        print l
        print l == l
        var d = {"k": 0}
        d["k"] = d
        print d
    "#;
    assert_prints!(source, "[1, [...]]\ntrue\n{\"k\": {...}}\n");
}

#[test]
fn len_of_every_collection() {
    assert_prints!("print len([1, 2, 3])", "3\n");
    assert_prints!("print len(\"\")", "0\n");
    assert_prints!("print len(\"héllo\")", "5\n");
    assert_prints!("print len((1, 2))", "2\n");
    assert_prints!("print len({\"a\": 1, \"b\": 2})", "2\n");
    assert_runtime_error!("len(42)", "len() expects a list or string but got int.");
}

#[test]
fn strings_repeat_by_ints() {
    assert_prints!("print \"ab\" * 3", "ababab\n");
    assert_prints!("print 2 * \"xy\"", "xyxy\n");
    assert_prints!("print len(\"ab\" * 0)", "0\n");
    assert_runtime_error!(
        "print \"ab\" * -1",
        "Cannot repeat a string a negative number of times."
    );
    assert_runtime_error!(
        "print \"abc\" * 9223372036854775807",
        "String repetition too large."
    );
    assert_runtime_error!("print \"a\" * 2000000000", "String repetition too large.");
}

#[test]
fn dicts_map_strings_to_values() {
    let source = r#"
        var d = {"b": 2, "a": 1}
        d["c"] = 3
        print d
        print d["a"] + d["c"]
        print keys(d)
    "#;
    assert_prints!(source, "{\"a\": 1, \"b\": 2, \"c\": 3}\n4\n[\"a\", \"b\", \"c\"]\n");
    assert_runtime_error!("var d = {}\nprint d[\"zz\"]", "Key 'zz' not found.");
    assert_runtime_error!("var d = {}\nd[1] = 2", "Dict keys must be strings.");
}

#[test]
fn tuples_are_immutable() {
    assert_prints!("var t = (1, \"two\")\nprint t\nprint t[1]", "(1, \"two\")\ntwo\n");
    assert_runtime_error!("var t = (1, 2)\nt[0] = 5", "Tuples are immutable.");
    assert_runtime_error!("var t = (1, 2)\nt[0:1] = [5]", "Tuples are immutable.");
    assert_runtime_error!("append((1, 2), 3)", "append() expects a list but got tuple.");
}

#[test]
fn slices_copy_and_clamp() {
    let source = r#"
        var l = [0, 1, 2, 3, 4]
        print l[1:3]
        print l[:2]
        print l[-2:]
        print l[3:99]
        print "hello"[1:3]
    "#;
    assert_prints!(source, "[1, 2]\n[0, 1]\n[3, 4]\n[3, 4]\nel\n");
}

#[test]
fn slice_assignment_splices() {
    assert_prints!(
        "var l = [0, 1, 2, 3, 4]\nl[1:3] = [\"a\"]\nprint l",
        "[0, \"a\", 3, 4]\n"
    );
    assert_prints!("var l = [1, 2]\nl[:] = l + l\nprint l", "[1, 2, 1, 2]\n");
}

#[test]
fn lists_and_tuples_concatenate() {
    assert_prints!("print [1] + [2, 3]", "[1, 2, 3]\n");
    assert_prints!("print (1, 2) + (3, 4)", "(1, 2, 3, 4)\n");
    assert_runtime_error!(
        "print [1] + 1",
        "Operands must be two numbers, two strings or two lists."
    );
}

#[test]
fn lambdas_are_expressions() {
    let source = r#"
        var square = func (x) { return x * x }
        func twice(f, x) { return f(f(x)) }
        print twice(square, 3)
        print square
    "#;
    assert_prints!(source, "81\n<fn lambda>\n");
}

#[test]
fn builtin_natives() {
    assert_prints!("print join([\"a\", \"b\", \"c\"], \"-\")", "a-b-c\n");
    assert_prints!("print int(\"12\") + 1", "13\n");
    assert_prints!("print float(1)", "1.0\n");
    assert_prints!("print str(1.5) + \"!\"", "1.5!\n");
    assert_prints!("print type(nil)\nprint type([])", "nil\nlist\n");
    assert_prints!("print clock() >= 0", "true\n");
    assert_prints!("print len", "<native fn len>\n");
}

#[test]
fn script_arguments_come_from_the_config() {
    let config = VmConfig::default().with_script_args(vec!["a".to_owned(), "b".to_owned()]);
    let mut vm = VM::new(config, Vec::new());
    vm.interpret("print args()").unwrap();
    assert_eq!("[\"a\", \"b\"]\n", printed(&vm));
}

#[test]
fn calls_check_their_arity() {
    assert_runtime_error!("func f(a, b) {}\nf(1)", "Expected 2 arguments but got 1.");
    assert_runtime_error!("class A {}\nA(1)", "Expected 0 arguments but got 1.");
    assert_runtime_error!("var x = 1\nx()", "Can only call functions and classes.");
}

#[test]
fn compile_errors_are_all_reported() {
    let errors = compile_errors("print\nvar = 1\nreturn 1");
    assert_eq!(3, errors.len(), "{errors:?}");
    assert_eq!("Can't return from top-level code.", errors[2]);
}

#[test]
fn the_library_entry_point_reports_a_status() {
    assert_eq!(
        (InterpretStatus::Ok, "hi\n".to_owned()),
        blox::interpret("print \"hi\"")
    );
    assert_eq!(InterpretStatus::CompileError, blox::interpret("print (").0);
    let (status, output) = blox::interpret("print 1\nprint nil + 1");
    assert_eq!(InterpretStatus::RuntimeError, status);
    assert_eq!("1\n", output);
}
