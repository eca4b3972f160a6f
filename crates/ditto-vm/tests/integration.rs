//! Tests de bout en bout : source → compilation → exécution, sorties
//! capturées par un hôte enregistreur.

use std::cell::RefCell;
use std::rc::Rc;

use ditto_core::Host;
use ditto_vm::{boot_vm, execute_module, VmError};
use indoc::indoc;
use pretty_assertions::assert_eq;

struct RecordHost(Rc<RefCell<String>>);

impl Host for RecordHost {
    fn print(&mut self, s: &str) {
        self.0.borrow_mut().push_str(s);
    }
}

fn run_src(src: &str) -> (Result<(), VmError>, String) {
    let mut vm = boot_vm().expect("bootstrap");
    let out = Rc::new(RefCell::new(String::new()));
    vm.host = Box::new(RecordHost(out.clone()));
    let res = execute_module(&mut vm, Some("test"), src);
    let text = out.borrow().clone();
    (res, text)
}

fn run_ok(src: &str) -> String {
    let (res, out) = run_src(src);
    res.expect("script should run cleanly");
    out
}

// Arithmétique sur variables de module, sortie via System.print.
#[test]
fn prints_a_sum_of_module_vars() {
    let out = run_ok(indoc! {"
        var a = 3
        var b = 4
        System.print(a + b)
    "});
    assert_eq!(out, "7\n");
}

// Référence avant définition comblée plus loin dans le module.
#[test]
fn forward_referenced_function_runs() {
    let out = run_ok(indoc! {"
        fun f() {
            return g()
        }
        fun g() {
            return 42
        }
        System.print(f())
    "});
    assert_eq!(out, "42\n");
}

// Même référence sans définition : compilation refusée.
#[test]
fn dangling_forward_reference_fails_to_compile() {
    let (res, _) = run_src(indoc! {"
        fun f() {
            return g()
        }
        System.print(f())
    "});
    match res {
        Err(VmError::Compile(e)) => {
            assert!(e.msg.contains("identifier g used but not defined"), "{}", e.msg)
        }
        other => panic!("expected compile error, got {other:?}"),
    }
}

// Fermeture sur un paramètre, appelée après le retour de make.
#[test]
fn closure_survives_its_frame() {
    let out = run_ok(indoc! {"
        fun make(n) {
            fun inner() {
                return n
            }
            return inner
        }
        var c = make(7)
        System.print(c())
    "});
    assert_eq!(out, "7\n");
}

#[test]
fn two_closures_capture_distinct_upvalues() {
    let out = run_ok(indoc! {"
        fun make(n) {
            fun inner() {
                return n
            }
            return inner
        }
        var a = make(1)
        var b = make(2)
        System.print(a() + b())
    "});
    assert_eq!(out, "3\n");
}

// Héritage simple et appel super patché vers la classe parente.
#[test]
fn super_call_reaches_the_parent_method() {
    let out = run_ok(indoc! {"
        class A {
            m() {
                return 1
            }
        }
        class B < A {
            m() {
                return super.m() + 2
            }
        }
        System.print(B.new().m())
    "});
    assert_eq!(out, "3\n");
}

// Bascule coopérative : le thread reprend à l'ip sauvegardé.
#[test]
fn cooperative_threads_interleave() {
    let out = run_ok(indoc! {"
        fun worker() {
            System.print(1)
            Thread.yield()
            System.print(3)
        }
        var t = Thread.new(worker)
        t.call()
        System.print(2)
        t.call()
        System.print(4)
    "});
    assert_eq!(out, "1\n2\n3\n4\n");
}

#[test]
fn yield_and_call_carry_values() {
    let out = run_ok(indoc! {"
        fun worker() {
            var got = Thread.yield(10)
            System.print(got)
        }
        var t = Thread.new(worker)
        System.print(t.call())
        t.call(20)
        System.print(t.isDone)
    "});
    assert_eq!(out, "10\n20\ntrue\n");
}

#[test]
fn aborted_thread_reports_and_the_caller_continues() {
    let (res, out) = run_src(indoc! {"
        fun boom() {
            Thread.abort(\"kaboom\")
        }
        var t = Thread.new(boom)
        t.call()
        System.print(\"after\")
    "});
    res.expect("main thread survives the abort");
    assert_eq!(out, "after\n");
}

#[test]
fn constructor_initializes_fields() {
    let out = run_ok(indoc! {"
        class Point {
            var x
            var y
            new(a, b) {
                x = a
                y = b
            }
            sum() {
                return x + y
            }
        }
        var p = Point.new(3, 4)
        System.print(p.sum())
    "});
    assert_eq!(out, "7\n");
}

// Les index de champs hérités sont décalés par la passe de patch.
#[test]
fn inherited_fields_do_not_collide() {
    let out = run_ok(indoc! {"
        class A2 {
            var a
            new() {
                a = 1
            }
            geta() {
                return a
            }
        }
        class B2 < A2 {
            var b
            new() {
                super()
                b = 2
            }
            getb() {
                return b
            }
            sum() {
                return geta() + getb()
            }
        }
        System.print(B2.new().sum())
    "});
    assert_eq!(out, "3\n");
}

#[test]
fn static_fields_and_methods_live_on_the_metaclass() {
    let out = run_ok(indoc! {"
        class Counter {
            static var total
            static bump() {
                total = (total == null) ? 1 : (total + 1)
                return total
            }
        }
        Counter.bump()
        Counter.bump()
        System.print(Counter.bump())
    "});
    assert_eq!(out, "3\n");
}

#[test]
fn getters_and_setters_dispatch() {
    let out = run_ok(indoc! {"
        class Box {
            var v
            new(x) {
                v = x
            }
            value {
                return v
            }
            value=(x) {
                v = x
            }
        }
        var b = Box.new(1)
        b.value = 41
        System.print(b.value + 1)
    "});
    assert_eq!(out, "42\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let out = run_ok(indoc! {"
        var i = 0
        var acc = 0
        while (i < 10) {
            i = i + 1
            if (i % 2 == 0) continue
            if (i > 7) break
            acc = acc + i
        }
        System.print(acc)
    "});
    assert_eq!(out, "16\n");
}

#[test]
fn for_loop_iterates_a_range() {
    let out = run_ok(indoc! {"
        var sum = 0
        for x (1..4) {
            sum = sum + x
        }
        System.print(sum)
    "});
    assert_eq!(out, "10\n");
}

#[test]
fn for_loop_iterates_a_list() {
    let out = run_ok(indoc! {"
        var parts = \"\"
        for s ([\"a\", \"b\", \"c\"]) {
            parts = parts + s
        }
        System.print(parts)
    "});
    assert_eq!(out, "abc\n");
}

#[test]
fn map_literal_subscript_and_remove() {
    let out = run_ok(indoc! {"
        var m = {\"one\": 1, \"two\": 2}
        m[\"three\"] = 3
        System.print(m[\"one\"] + m[\"three\"])
        m.remove(\"two\")
        System.print(m.count)
    "});
    assert_eq!(out, "4\n2\n");
}

#[test]
fn string_interpolation_concatenates() {
    let out = run_ok(indoc! {r#"
        var name = "world"
        var n = 2
        System.print("hello %(name), %(n + 1) times!")
    "#});
    assert_eq!(out, "hello world, 3 times!\n");
}

#[test]
fn logic_operators_short_circuit() {
    let out = run_ok(indoc! {"
        System.print(false && 5.quack)
        System.print(true || 5.quack)
    "});
    assert_eq!(out, "false\ntrue\n");
}

#[test]
fn deep_recursion_grows_the_frame_stack() {
    let out = run_ok(indoc! {"
        fun count(n) {
            if (n == 0) return 0
            return count(n - 1) + 1
        }
        System.print(count(100))
    "});
    assert_eq!(out, "100\n");
}

#[test]
fn type_is_and_equality() {
    let out = run_ok(indoc! {r#"
        System.print(3.type.name)
        System.print("x" is String)
        System.print(1 is Object)
        System.print("ab" == "ab")
        System.print(1..3 == 1..3)
    "#});
    assert_eq!(out, "Num\ntrue\ntrue\ntrue\ntrue\n");
}

#[test]
fn method_not_found_is_a_runtime_error() {
    let (res, _) = run_src("System.print(5.quack)");
    match res {
        Err(VmError::Runtime(msg)) => assert!(msg.contains("quack"), "{msg}"),
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    let (res, _) = run_src(indoc! {"
        fun f(a, b) {
            return a
        }
        f(1)
    "});
    match res {
        Err(VmError::Runtime(msg)) => assert!(msg.contains("expects 2 arguments"), "{msg}"),
        other => panic!("expected runtime error, got {other:?}"),
    }
}

// Le module "cli" du REPL persiste ses variables entre deux exécutions.
#[test]
fn repl_style_module_reuse_keeps_variables()  {
    let mut vm = boot_vm().expect("bootstrap");
    let out = Rc::new(RefCell::new(String::new()));
    vm.host = Box::new(RecordHost(out.clone()));
    execute_module(&mut vm, Some("cli"), "var x = 5").expect("first line");
    execute_module(&mut vm, Some("cli"), "System.print(x + 1)").expect("second line");
    assert_eq!(out.borrow().as_str(), "6\n");
}

#[test]
fn import_loads_and_exposes_module_variables() {
    let dir = std::env::temp_dir().join(format!("ditto-import-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    std::fs::write(
        dir.join("helper.di"),
        indoc! {r#"
            var greeting = "hi"
        "#},
    )
    .expect("helper module");

    let mut vm = boot_vm().expect("bootstrap");
    let out = Rc::new(RefCell::new(String::new()));
    vm.host = Box::new(RecordHost(out.clone()));
    vm.root_dir = Some(dir.to_string_lossy().into_owned());

    execute_module(
        &mut vm,
        Some("main"),
        indoc! {"
            import helper for greeting
            System.print(greeting)
        "},
    )
    .expect("import should succeed");
    assert_eq!(out.borrow().as_str(), "hi\n");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn conditional_expression_picks_a_branch() {
    let out = run_ok(indoc! {"
        var x = 5
        System.print(x > 3 ? \"big\" : \"small\")
        System.print(x > 7 ? \"big\" : \"small\")
    "});
    assert_eq!(out, "big\nsmall\n");
}

#[test]
fn operator_methods_are_overridable() {
    let out = run_ok(indoc! {"
        class Vec {
            var v
            new(a) {
                v = a
            }
            x {
                return v
            }
            +(other) {
                return Vec.new(v + other.x)
            }
        }
        var sum = Vec.new(2) + Vec.new(3)
        System.print(sum.x)
    "});
    assert_eq!(out, "5\n");
}

// L'accès par point de code marche les séquences UTF-8, pas les octets.
#[test]
fn string_code_point_access() {
    let out = run_ok(indoc! {r#"
        var s = "héllo"
        System.print(s.at_(1))
        System.print(s.at_(4))
        System.print(s.count)
    "#});
    assert_eq!(out, "é\no\n6\n");
}

#[test]
fn string_at_out_of_bound_is_a_runtime_error() {
    let (res, _) = run_src(indoc! {r#"
        System.print("ab".at_(2))
    "#});
    match res {
        Err(VmError::Runtime(msg)) => assert!(msg.contains("out of bound"), "{msg}"),
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[test]
fn list_primitives_cover_mutation() {
    let out = run_ok(indoc! {"
        var l = [1, 2, 3]
        l.add(4)
        l[0] = 10
        System.print(l.count)
        System.print(l[0] + l[3])
        l.removeAt(1)
        System.print(l[1])
    "});
    assert_eq!(out, "4\n14\n3\n");
}
