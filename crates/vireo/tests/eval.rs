//! End-to-end evaluation tests: source text in, host values out.

use pretty_assertions::assert_eq;
use vireo::{Context, ExcKind, LimitedTracker, Object, Runtime};

fn run(source: &str) -> Object {
    Runtime::new()
        .run(source)
        .unwrap_or_else(|err| panic!("{source} failed: {err}"))
}

fn run_err(source: &str) -> vireo::Exception {
    Runtime::new()
        .run(source)
        .expect_err("expected an error")
}

// ----------------------------------------------------------------------
// literals and quoting
// ----------------------------------------------------------------------

#[test]
fn self_evaluating_literals() {
    assert_eq!(run("42"), Object::Int(42));
    assert_eq!(run("-5"), Object::Int(-5));
    assert_eq!(run("1.5"), Object::Float(1.5));
    assert_eq!(run("#t"), Object::Bool(true));
    assert_eq!(run("#f"), Object::Bool(false));
    assert_eq!(run("#\\a"), Object::Char('a'));
    assert_eq!(run("\"hi\""), Object::Str("hi".to_owned()));
}

#[test]
fn quote_returns_the_datum_unchanged() {
    assert_eq!(run("(quote 42)"), Object::Int(42));
    assert_eq!(run("'sym"), Object::symbol("sym"));
    assert_eq!(run("'()"), Object::Nil);
    assert_eq!(
        run("'(1 2 3)"),
        Object::list([Object::Int(1), Object::Int(2), Object::Int(3)])
    );
    assert_eq!(
        run("'(a . b)"),
        Object::Pair(Box::new(Object::symbol("a")), Box::new(Object::symbol("b")))
    );
}

// ----------------------------------------------------------------------
// arithmetic and comparison
// ----------------------------------------------------------------------

#[test]
fn addition_folds_left() {
    assert_eq!(run("(+ 1 2 3)"), Object::Int(6));
    assert_eq!(run("(+)"), Object::Int(0));
    assert_eq!(run("(+ 7)"), Object::Int(7));
    assert_eq!(run("(*)"), Object::Int(1));
    assert_eq!(run("(* 2 3 4)"), Object::Int(24));
}

#[test]
fn subtraction_is_left_associative_in_source_order() {
    assert_eq!(run("(- 10 3)"), Object::Int(7));
    assert_eq!(run("(- 10 3 2)"), Object::Int(5));
    assert_eq!(run("(- 5)"), Object::Int(-5));
}

#[test]
fn division_is_exact_when_it_divides_evenly() {
    assert_eq!(run("(/ 6 3)"), Object::Int(2));
    assert_eq!(run("(/ 16 2 2)"), Object::Int(4));
    // a non-integer result from two integers is a float
    assert_eq!(run("(/ 7 2)"), Object::Float(3.5));
    assert_eq!(run("(/ 2)"), Object::Float(0.5));
    assert_eq!(run("(/ 1)"), Object::Int(1));
}

#[test]
fn mixed_operands_promote_to_float() {
    assert_eq!(run("(+ 1 2.5)"), Object::Float(3.5));
    assert_eq!(run("(* 2.0 3)"), Object::Float(6.0));
    assert_eq!(run("(- 1.5 1)"), Object::Float(0.5));
}

#[test]
fn quotient_truncates_and_modulo_floors() {
    assert_eq!(run("(quotient 7 2)"), Object::Int(3));
    assert_eq!(run("(quotient -7 2)"), Object::Int(-3));
    assert_eq!(run("(modulo 7 2)"), Object::Int(1));
    // the result carries the sign of the divisor
    assert_eq!(run("(modulo -7 2)"), Object::Int(1));
    assert_eq!(run("(modulo 7 -2)"), Object::Int(-1));
    assert_eq!(run("(modulo -7 -2)"), Object::Int(-1));
    assert_eq!(run("(modulo 6 3)"), Object::Int(0));
    assert_eq!(run("(modulo -6 3)"), Object::Int(0));
    let err = run_err("(quotient 1 0)");
    assert_eq!(err.kind(), ExcKind::ValueError);
    let err = run_err("(modulo 1 0)");
    assert_eq!(err.kind(), ExcKind::ValueError);
}

#[test]
fn comparisons_honor_argument_order() {
    assert_eq!(run("(< 1 2)"), Object::Bool(true));
    assert_eq!(run("(< 2 1)"), Object::Bool(false));
    assert_eq!(run("(<= 2 2)"), Object::Bool(true));
    // > and >= compile through their swapped inverses; the relation must
    // still read left to right
    assert_eq!(run("(> 3 2)"), Object::Bool(true));
    assert_eq!(run("(> 2 3)"), Object::Bool(false));
    assert_eq!(run("(> 2 2)"), Object::Bool(false));
    assert_eq!(run("(>= 2 2)"), Object::Bool(true));
    assert_eq!(run("(>= 1 2)"), Object::Bool(false));
    assert_eq!(run("(= 2 2)"), Object::Bool(true));
    assert_eq!(run("(= 2 2.0)"), Object::Bool(true));
}

#[test]
fn eq_is_identity() {
    assert_eq!(run("(eq? 'a 'a)"), Object::Bool(true));
    assert_eq!(run("(eq? 'a 'b)"), Object::Bool(false));
    assert_eq!(run("(eq? '() '())"), Object::Bool(true));
    // two reads of the same string literal are distinct objects
    assert_eq!(run("(eq? \"a\" \"a\")"), Object::Bool(false));
    assert_eq!(run("(begin (define s \"a\") (eq? s s))"), Object::Bool(true));
}

#[test]
fn arithmetic_type_errors_carry_both_operands() {
    let err = run_err("(+ 1 'a)");
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert!(err.message().contains('+'));
    assert_eq!(err.irritants(), ["1", "a"]);
}

// ----------------------------------------------------------------------
// special forms
// ----------------------------------------------------------------------

#[test]
fn if_branches_and_defaults() {
    assert_eq!(run("(if #t 1 2)"), Object::Int(1));
    assert_eq!(run("(if #f 1 2)"), Object::Int(2));
    assert_eq!(run("(if #f 1)"), Object::Undefined);
    // only #f is false
    assert_eq!(run("(if 0 'yes 'no)"), Object::symbol("yes"));
    assert_eq!(run("(if '() 'yes 'no)"), Object::symbol("yes"));
}

#[test]
fn begin_sequences_left_to_right() {
    assert_eq!(run("(begin)"), Object::Undefined);
    assert_eq!(run("(begin 1 2 3)"), Object::Int(3));
    assert_eq!(
        run("(begin (define x 1) (set! x (+ x 1)) x)"),
        Object::Int(2)
    );
}

#[test]
fn define_forward_references_share_one_cell() {
    assert_eq!(
        run("(define (f) (g)) (define (g) 7) (f)"),
        Object::Int(7)
    );
}

#[test]
fn set_returns_the_unspecified_value() {
    assert_eq!(run("(define x 1) (set! x 9)"), Object::Undefined);
    assert_eq!(run("(define x 1) (set! x 9) x"), Object::Int(9));
}

// ----------------------------------------------------------------------
// procedures and closures
// ----------------------------------------------------------------------

#[test]
fn lambda_application() {
    assert_eq!(run("((lambda (x y) (* x y)) 6 7)"), Object::Int(42));
    assert_eq!(run("((lambda (x) x) 'v)"), Object::symbol("v"));
    assert_eq!(run("((lambda () 5))"), Object::Int(5));
}

#[test]
fn parameters_shadow_outer_bindings() {
    assert_eq!(run("((lambda (x) ((lambda (x) x) 2)) 1)"), Object::Int(2));
}

#[test]
fn factorial_recursion() {
    assert_eq!(
        run("(define fact (lambda (n) (if (= n 0) 1 (* n (fact (- n 1)))))) (fact 5)"),
        Object::Int(120)
    );
}

#[test]
fn closures_capture_lexically() {
    assert_eq!(
        run("(define (make-adder n) (lambda (x) (+ x n))) ((make-adder 3) 4)"),
        Object::Int(7)
    );
    // transitive capture through two lambda layers
    assert_eq!(
        run("(define (f x) (lambda (y) (lambda () (+ x y)))) (((f 1) 2))"),
        Object::Int(3)
    );
}

#[test]
fn counter_shares_one_boxed_binding() {
    assert_eq!(
        run("(define counter (lambda () (define c 0) (lambda () (set! c (+ c 1)) c))) \
             (define f (counter)) (f) (f) (f)"),
        Object::Int(3)
    );
    // independent counters do not interfere
    assert_eq!(
        run("(define counter (lambda () (define c 0) (lambda () (set! c (+ c 1)) c))) \
             (define f (counter)) (define g (counter)) (f) (f) (g)"),
        Object::Int(1)
    );
}

#[test]
fn assigned_parameters_are_boxed() {
    assert_eq!(
        run("(define (bump x) (set! x (+ x 1)) x) (bump 41)"),
        Object::Int(42)
    );
    // a closure over an assigned parameter observes its mutation
    assert_eq!(
        run("(define (pair x) (cons (lambda () x) (lambda () (set! x (+ x 1))))) \
             (define p (pair 0)) ((cdr p)) ((cdr p)) ((car p))"),
        Object::Int(2)
    );
}

#[test]
fn variadic_rest_argument_boundaries() {
    // exactly the declared minimum: rest is the empty list
    assert_eq!(run("((lambda (a . rest) rest) 1)"), Object::Nil);
    // zero extras over a zero-minimum signature
    assert_eq!(run("((lambda rest rest))"), Object::Nil);
    assert_eq!(
        run("((lambda (a . rest) rest) 1 2 3)"),
        Object::list([Object::Int(2), Object::Int(3)])
    );
    assert_eq!(
        run("((lambda (a . rest) a) 1 2 3)"),
        Object::Int(1)
    );
    assert_eq!(
        run("((lambda rest rest) 1 2)"),
        Object::list([Object::Int(1), Object::Int(2)])
    );
}

#[test]
fn primitives_are_first_class() {
    assert_eq!(run("(define add +) (add 2 3)"), Object::Int(5));
    assert_eq!(run("((if #t + *) 2 3)"), Object::Int(5));
    assert_eq!(run("(apply1 + '(1 2))"), Object::Int(3));
    assert_eq!(run("(apply1 cons '(1 2))"),
        Object::Pair(Box::new(Object::Int(1)), Box::new(Object::Int(2))));
}

#[test]
fn arity_errors() {
    let err = run_err("((lambda (x) x))");
    assert_eq!(err.kind(), ExcKind::ArityError);
    assert!(err.message().contains("not enough args"));
    let err = run_err("((lambda (x) x) 1 2)");
    assert_eq!(err.kind(), ExcKind::ArityError);
    assert!(err.message().contains("too many args"));
}

#[test]
fn calling_a_non_procedure_is_a_type_error() {
    let err = run_err("(define x 5) (x 1)");
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert!(err.message().contains("non procedure"));
}

// ----------------------------------------------------------------------
// tail calls
// ----------------------------------------------------------------------

#[test]
fn tail_recursion_runs_in_constant_stack() {
    assert_eq!(
        run("(define loop (lambda (n) (if (= n 0) 'done (loop (- n 1))))) (loop 1000000)"),
        Object::symbol("done")
    );
}

#[test]
fn mutual_tail_recursion_runs_in_constant_stack() {
    assert_eq!(
        run("(define (even? n) (if (= n 0) #t (odd? (- n 1)))) \
             (define (odd? n) (if (= n 0) #f (even? (- n 1)))) \
             (even? 100001)"),
        Object::Bool(false)
    );
}

#[test]
fn non_tail_recursion_overflows_recoverably() {
    let err = run_err(
        "(define count (lambda (n) (if (= n 0) 0 (+ 1 (count (- n 1)))))) (count 100000)",
    );
    assert_eq!(err.kind(), ExcKind::ResourceError);
    assert!(err.message().contains("out of stack space"));
}

// ----------------------------------------------------------------------
// continuations
// ----------------------------------------------------------------------

#[test]
fn continuation_abandons_pending_computation() {
    assert_eq!(
        run("(call-with-current-continuation (lambda (k) (+ 1 (k 42))))"),
        Object::Int(42)
    );
}

#[test]
fn continuation_unused_returns_normally() {
    assert_eq!(
        run("(call-with-current-continuation (lambda (k) 10))"),
        Object::Int(10)
    );
}

#[test]
fn continuation_escapes_nested_calls() {
    assert_eq!(
        run("(define (find k) (* 2 (k 7))) \
             (+ 1 (call-with-current-continuation (lambda (k) (find k))))"),
        Object::Int(8)
    );
}

// ----------------------------------------------------------------------
// data primitives
// ----------------------------------------------------------------------

#[test]
fn pairs_and_mutation() {
    assert_eq!(run("(car (cons 1 2))"), Object::Int(1));
    assert_eq!(run("(cdr (cons 1 2))"), Object::Int(2));
    assert_eq!(
        run("(define p (cons 1 2)) (set-car! p 9) (car p)"),
        Object::Int(9)
    );
    assert_eq!(
        run("(define p (cons 1 2)) (set-cdr! p '()) p"),
        Object::list([Object::Int(1)])
    );
}

#[test]
fn vectors() {
    assert_eq!(
        run("(define v (make-vector 3 0)) (vector-set! v 1 5) (vector-ref v 1)"),
        Object::Int(5)
    );
    assert_eq!(run("(vector-ref '#(a b c) 2)"), Object::symbol("c"));
    let err = run_err("(vector-ref (make-vector 2 0) 5)");
    assert_eq!(err.kind(), ExcKind::BoundsError);
}

#[test]
fn strings() {
    assert_eq!(run("(string-ref \"hello\" 1)"), Object::Char('e'));
    assert_eq!(
        run("(define s \"hat\") (string-set! s 0 #\\c) s"),
        Object::Str("cat".to_owned())
    );
    let err = run_err("(string-ref \"ab\" 9)");
    assert_eq!(err.kind(), ExcKind::BoundsError);
}

#[test]
fn type_predicates() {
    assert_eq!(run("(pair? '(1))"), Object::Bool(true));
    assert_eq!(run("(pair? '())"), Object::Bool(false));
    assert_eq!(run("(null? '())"), Object::Bool(true));
    assert_eq!(run("(integer? 3)"), Object::Bool(true));
    assert_eq!(run("(integer? 3.5)"), Object::Bool(false));
    assert_eq!(run("(symbol? 'a)"), Object::Bool(true));
    assert_eq!(run("(string? \"s\")"), Object::Bool(true));
    assert_eq!(run("(char? #\\x)"), Object::Bool(true));
    assert_eq!(run("(vector? (make-vector 1 0))"), Object::Bool(true));
    assert_eq!(run("(procedure? (lambda () 1))"), Object::Bool(true));
    assert_eq!(run("(procedure? 5)"), Object::Bool(false));
    assert_eq!(run("(eof-object? 5)"), Object::Bool(false));
}

#[test]
fn list_helpers() {
    assert_eq!(run("(length '(1 2 3))"), Object::Int(3));
    assert_eq!(run("(length '())"), Object::Int(0));
    assert_eq!(
        run("(reverse '(1 2 3))"),
        Object::list([Object::Int(3), Object::Int(2), Object::Int(1)])
    );
    assert_eq!(
        run("(list->vector '(1 2))"),
        Object::Vector(vec![Object::Int(1), Object::Int(2)])
    );
    assert_eq!(
        run("(memq 'b '(a b c))"),
        Object::list([Object::symbol("b"), Object::symbol("c")])
    );
    assert_eq!(run("(memq 'z '(a b c))"), Object::Bool(false));
    assert_eq!(
        run("(assq 'b '((a 1) (b 2)))"),
        Object::list([Object::symbol("b"), Object::Int(2)])
    );
    assert_eq!(run("(assq 'z '((a 1)))"), Object::Bool(false));
}

// ----------------------------------------------------------------------
// errors
// ----------------------------------------------------------------------

#[test]
fn car_of_nil_is_a_type_error_with_the_irritant() {
    let err = run_err("(car '())");
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert!(err.message().contains("car"));
    assert_eq!(err.irritants(), ["()"]);
}

#[test]
fn user_errors_come_from_the_error_primitive() {
    let err = run_err("(error \"boom\")");
    assert_eq!(err.kind(), ExcKind::UserError);
    assert_eq!(err.message(), "boom");
}

#[test]
fn syntax_failures_are_compile_errors() {
    assert_eq!(run_err("(if)").kind(), ExcKind::CompileError);
    assert_eq!(run_err("(define)").kind(), ExcKind::CompileError);
    assert_eq!(run_err("(lambda (1) 2)").kind(), ExcKind::CompileError);
    assert_eq!(run_err("(< 1)").kind(), ExcKind::CompileError);
    assert_eq!(run_err("(car 1 2)").kind(), ExcKind::CompileError);
    assert_eq!(run_err("(1 2").kind(), ExcKind::CompileError);
}

#[test]
fn optional_port_arguments_do_not_admit_surplus() {
    // the trailing port is optional, not a rest argument
    let err = run_err("(read 1 2)");
    assert_eq!(err.kind(), ExcKind::CompileError);
    assert!(err.message().contains("too many arguments"));
    assert_eq!(run_err("(write 1 2 3)").kind(), ExcKind::CompileError);
    assert_eq!(run_err("(newline 1 2)").kind(), ExcKind::CompileError);
}

// ----------------------------------------------------------------------
// resource limits
// ----------------------------------------------------------------------

#[test]
fn instruction_budget_interrupts_runaway_loops() {
    let mut rt = Runtime::with_tracker(LimitedTracker::new(1_000_000, 100_000)).unwrap();
    let err = rt
        .run("(define (spin) (spin)) (spin)")
        .expect_err("the budget must interrupt the loop");
    assert_eq!(err.kind(), ExcKind::ResourceError);
}

// ----------------------------------------------------------------------
// compiled programs and ports
// ----------------------------------------------------------------------

#[test]
fn compiled_programs_rerun_without_hidden_state() {
    let mut rt = Runtime::new();
    let program = rt.compile("((lambda (x) (* x x)) 9)").unwrap();
    for _ in 0..3 {
        let mut ctx = Context::new();
        assert_eq!(rt.execute(&program, &mut ctx).unwrap(), Object::Int(81));
    }
}

#[test]
fn file_ports_roundtrip() {
    let dir = std::env::temp_dir();
    let out_path = dir.join(format!("vireo-out-{}.txt", std::process::id()));
    let out = out_path.to_str().unwrap();
    let result = run(&format!(
        "(define p (open-output-file \"{out}\")) \
         (display \"hi\" p) (newline p) (write 42 p) \
         (close-output-port p) 'ok"
    ));
    assert_eq!(result, Object::symbol("ok"));
    assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "hi\n42");

    let in_path = dir.join(format!("vireo-in-{}.scm", std::process::id()));
    std::fs::write(&in_path, "42 hello").unwrap();
    let inp = in_path.to_str().unwrap();
    let result = run(&format!(
        "(define p (open-input-file \"{inp}\")) \
         (define a (read p)) (define b (read p)) (define c (read p)) \
         (close-input-port p) \
         (cons a (cons b (eof-object? c)))"
    ));
    assert_eq!(
        result,
        Object::Pair(
            Box::new(Object::Int(42)),
            Box::new(Object::Pair(
                Box::new(Object::symbol("hello")),
                Box::new(Object::Bool(true))
            ))
        )
    );

    std::fs::remove_file(&out_path).ok();
    std::fs::remove_file(&in_path).ok();
}

#[test]
fn load_evaluates_a_file_in_a_fresh_context() {
    let path = std::env::temp_dir().join(format!("vireo-load-{}.scm", std::process::id()));
    std::fs::write(&path, "(define loaded-value (* 9 11))").unwrap();
    let p = path.to_str().unwrap();
    assert_eq!(
        run(&format!("(load \"{p}\") loaded-value")),
        Object::Int(99)
    );
    std::fs::remove_file(&path).ok();
}

#[test]
fn current_output_port_is_a_parameter() {
    assert_eq!(
        run("(output-port? (current-output-port))"),
        Object::Bool(true)
    );
    assert_eq!(
        run("(input-port? (current-input-port))"),
        Object::Bool(true)
    );
}
