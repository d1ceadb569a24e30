//! Integration tests for try, except, finally and raise.

#[macro_use]
mod common;

use common::*;

#[test]
fn except_catches_raised_values() {
    let source = r#"
        try {
            raise "boom"
            print "unreachable"
        } except (e) {
            print "caught " + e
        }
        print "after"
    "#;
    assert_prints!(source, "caught boom\nafter\n");
}

#[test]
fn any_value_can_be_raised() {
    let source = r#"
        class Problem {
            init(code) { this.code = code }
        }
        try { raise Problem(7) } except (p) { print p.code }
        try { raise [1, 2] } except (l) { print len(l) }
    "#;
    assert_prints!(source, "7\n2\n");
}

#[test]
fn runtime_errors_are_catchable_as_messages() {
    let source = r#"
        try {
            print 1 + nil
        } except (e) {
            print e
        }
        try { [1][5] } except (e) { print e }
    "#;
    assert_prints!(
        source,
        "Operands must be two numbers, two strings or two lists.\nSubscript out of range.\n"
    );
}

#[test]
fn exceptions_unwind_through_calls() {
    let source = r#"
        func inner() { raise "deep" }
        func middle() {
            inner()
            print "never"
        }
        try { middle() } except (e) { print e }
        print "still running"
    "#;
    assert_prints!(source, "deep\nstill running\n");
}

#[test]
fn the_innermost_handler_wins() {
    let source = r#"
        try {
            try { raise "inner" } except (e) { print "first " + e }
            raise "outer"
        } except (e) {
            print "second " + e
        }
    "#;
    assert_prints!(source, "first inner\nsecond outer\n");
}

#[test]
fn handlers_can_reraise() {
    let source = r#"
        try {
            try { raise "again" } except (e) { raise e }
        } except (e) {
            print "outer saw " + e
        }
    "#;
    assert_prints!(source, "outer saw again\n");
}

#[test]
fn finally_runs_on_both_paths() {
    let source = r#"
        try { print "ok" } except (e) { print "no" } finally { print "cleanup 1" }
        try { raise "x" } except (e) { print "handled" } finally { print "cleanup 2" }
        try { print "bare" } finally { print "cleanup 3" }
    "#;
    assert_prints!(
        source,
        "ok\ncleanup 1\nhandled\ncleanup 2\nbare\ncleanup 3\n"
    );
}

#[test]
fn finally_without_except_reraises() {
    let source = r#"
        try {
            try { raise "escapes" } finally { print "cleanup" }
            print "skipped"
        } except (e) {
            print "caught " + e
        }
    "#;
    assert_prints!(source, "cleanup\ncaught escapes\n");
}

#[test]
fn a_return_inside_try_drops_the_handler() {
    let source = r#"
        func f() {
            try { return 1 } except (e) { print "wrong handler" }
        }
        print f()
        try { raise "later" } except (e) { print e }
    "#;
    assert_prints!(source, "1\nlater\n");
}

#[test]
fn break_inside_try_drops_the_handler() {
    let source = r#"
        while (true) {
            try { break } except (e) { print "wrong handler" }
        }
        try { raise "after loop" } except (e) { print e }
    "#;
    assert_prints!(source, "after loop\n");
}

#[test]
fn finally_runs_when_the_except_body_raises() {
    let source = r#"
        try {
            try { raise "first" } except (e) { raise e + " again" } finally { print "cleanup" }
        } except (e) {
            print e
        }
    "#;
    assert_prints!(source, "cleanup\nfirst again\n");
}

#[test]
fn the_exception_variable_outlives_a_raising_except_body() {
    let source = r#"
        var saved = nil
        try {
            try {
                raise "kept"
            } except (e) {
                saved = func () { return e }
                raise "replaced"
            } finally {
                print "cleanup"
            }
        } except (e) {
            print e
        }
        print saved()
    "#;
    assert_prints!(source, "cleanup\nreplaced\nkept\n");
}

#[test]
fn break_inside_an_except_body_leaves_no_handler_behind() {
    let source = r#"
        for (var i = 0; i < 3; i = i + 1) {
            try { raise i } except (e) {
                if (i == 1) break
                print e
            }
        }
        try { raise "after" } except (e) { print e }
    "#;
    assert_prints!(source, "0\nafter\n");
}

#[test]
fn locals_of_the_try_block_are_discarded() {
    let source = r#"
        func f() {
            var before = "before"
            try {
                var a = 1
                var b = 2
                raise a + b
            } except (e) {
                print before + " " + str(e)
            }
            var after = "after"
            print after
        }
        f()
    "#;
    assert_prints!(source, "before 3\nafter\n");
}

#[test]
fn uncaught_exceptions_are_runtime_errors() {
    assert_runtime_error!("raise \"nobody catches this\"", "nobody catches this");
    assert_runtime_error!("raise 42", "42");
    assert_runtime_error!("raise nil", "Cannot raise nil.");
}

#[test]
fn uncaught_exceptions_carry_a_backtrace() {
    let mut vm = new_vm();
    let Err(InterpretationError::RuntimeError(fault)) =
        vm.interpret("func fail() {\n  raise \"bad\"\n}\nfail()")
    else {
        panic!("the raise must escape");
    };
    assert_eq!("bad", fault.message);
    let trace: Vec<String> = fault.backtrace.iter().map(ToString::to_string).collect();
    assert_eq!(vec!["[line 2] in fail()", "[line 4] in script"], trace);
}

#[test]
fn try_needs_a_handler() {
    let errors = compile_errors("try { print 1 }");
    assert_eq!(
        vec!["Expect 'except' or 'finally' after try block."],
        errors
    );
}
