//! primitives.rs — Amorçage du module core et méthodes natives.
//!
//! L'amorçage câble d'abord la triade racine (Object, sa méta-classe,
//! Class) à la main, lie les primitives d'Object (l'héritage copie les
//! slots, elles doivent précéder toute sous-classe) puis fait compiler et
//! exécuter le script core par la chaîne normale : les classes primitives
//! naissent du même `CREATE_CLASS` que les classes utilisateur. Les
//! méthodes natives sont liées en dernier sur les classes récupérées dans
//! les variables du module core.
//!
//! Convention primitive : `(vm, args)` avec le récepteur en `args[0]`,
//! résultat déposé en `args[0]`, `true` en cas de succès. `false` signale
//! une erreur (slot d'erreur du thread garni via [`thread_error`]) ou une
//! bascule volontaire de thread (slot nul).

use ditto_core::object::class::{bind_super_class, Method, ObjClass, Primitive};
use ditto_core::object::fun::ObjClosure;
use ditto_core::object::list::ObjList;
use ditto_core::object::map::ObjMap;
use ditto_core::object::range::ObjRange;
use ditto_core::object::thread::ObjThread;
use ditto_core::utf8;
use ditto_core::value::{stringify, value_is_equal, Obj, Value};
use ditto_core::vm::new_string_value;
use ditto_core::{Gc, Vm};
use ditto_compiler::compile_module;

use crate::interp::thread_error;
use crate::{execute_module, get_or_make_module, VmError};

/// Classes du cœur, définies par le même chemin que les classes script.
const CORE_SCRIPT: &str = r#"
class Bool {}
class Num {}
class Null {}
class String {}
class Fn {}
class Thread {}
class List {}
class Map {}
class Range {}
class System {
    static print() {
        writeString_("\n")
        return null
    }
    static print(obj) {
        writeObject_(obj)
        writeString_("\n")
        return obj
    }
    static writeObject_(obj) {
        var text = obj.toString
        if (text is String) {
            writeString_(text)
        } else {
            writeString_("<toString did not return a String>")
        }
    }
}
"#;

/// Amorce le module core dans `vm`.
pub fn build_core(vm: &mut Vm) -> Result<(), VmError> {
    let core = get_or_make_module(vm, None);

    // Triade racine. Object n'a pas de superclasse ; Class descend
    // d'Object ; la méta-classe d'Object descend de Class ; Class est sa
    // propre classe, le cycle se referme en dernier.
    let object_class = ObjClass::new_raw(vm, "Object", 0);
    let class_of_class = ObjClass::new_raw(vm, "Class", 0);
    bind_super_class(&class_of_class, &object_class);
    let object_meta = ObjClass::new_raw(vm, "Object metaClass", 0);
    bind_super_class(&object_meta, &class_of_class);
    object_class.borrow_mut().header.class = Some(object_meta.clone());
    object_meta.borrow_mut().header.class = Some(class_of_class.clone());
    class_of_class.borrow_mut().header.class = Some(class_of_class.clone());

    core.borrow_mut().define_var("Object", Value::Obj(Obj::Class(object_class.clone())));
    core.borrow_mut().define_var("Class", Value::Obj(Obj::Class(class_of_class.clone())));
    vm.object_class = Some(object_class.clone());
    vm.class_of_class = Some(class_of_class.clone());

    // Primitives d'Object avant toute sous-classe : l'héritage copie.
    bind_prim(vm, &object_class, "!", prim_object_not);
    bind_prim(vm, &object_class, "==(_)", prim_object_eq);
    bind_prim(vm, &object_class, "!=(_)", prim_object_ne);
    bind_prim(vm, &object_class, "is(_)", prim_object_is);
    bind_prim(vm, &object_class, "toString", prim_object_to_string);
    bind_prim(vm, &object_class, "type", prim_object_type);
    bind_prim(vm, &class_of_class, "name", prim_class_name);
    bind_prim(vm, &class_of_class, "supertype", prim_class_supertype);
    bind_prim(vm, &class_of_class, "toString", prim_class_name);
    bind_prim(vm, &class_of_class, "new()", prim_class_default_new);

    // Les autres classes naissent du script core.
    execute_module(vm, None, CORE_SCRIPT)?;

    let bool_class = core_class(&core, "Bool")?;
    let num_class = core_class(&core, "Num")?;
    let null_class = core_class(&core, "Null")?;
    let string_class = core_class(&core, "String")?;
    let fn_class = core_class(&core, "Fn")?;
    let thread_class = core_class(&core, "Thread")?;
    let list_class = core_class(&core, "List")?;
    let map_class = core_class(&core, "Map")?;
    let range_class = core_class(&core, "Range")?;
    let system_class = core_class(&core, "System")?;

    vm.bool_class = Some(bool_class.clone());
    vm.num_class = Some(num_class.clone());
    vm.null_class = Some(null_class.clone());
    vm.string_class = Some(string_class.clone());
    vm.fn_class = Some(fn_class.clone());
    vm.thread_class = Some(thread_class.clone());
    vm.list_class = Some(list_class.clone());
    vm.map_class = Some(map_class.clone());
    vm.range_class = Some(range_class.clone());

    // Bool / Null
    bind_prim(vm, &bool_class, "toString", prim_bool_to_string);
    bind_prim(vm, &bool_class, "!", prim_bool_not);
    bind_prim(vm, &null_class, "!", prim_null_not);
    bind_prim(vm, &null_class, "toString", prim_null_to_string);

    // Num
    bind_prim(vm, &meta_of(&num_class), "fromString(_)", prim_num_from_string);
    bind_prim(vm, &meta_of(&num_class), "pi", prim_num_pi);
    bind_prim(vm, &num_class, "+(_)", prim_num_add);
    bind_prim(vm, &num_class, "-(_)", prim_num_sub);
    bind_prim(vm, &num_class, "*(_)", prim_num_mul);
    bind_prim(vm, &num_class, "/(_)", prim_num_div);
    bind_prim(vm, &num_class, "%(_)", prim_num_rem);
    bind_prim(vm, &num_class, ">(_)", prim_num_gt);
    bind_prim(vm, &num_class, ">=(_)", prim_num_ge);
    bind_prim(vm, &num_class, "<(_)", prim_num_lt);
    bind_prim(vm, &num_class, "<=(_)", prim_num_le);
    bind_prim(vm, &num_class, "&(_)", prim_num_bit_and);
    bind_prim(vm, &num_class, "|(_)", prim_num_bit_or);
    bind_prim(vm, &num_class, ">>(_)", prim_num_shr);
    bind_prim(vm, &num_class, "<<(_)", prim_num_shl);
    bind_prim(vm, &num_class, "..(_)", prim_num_range);
    bind_prim(vm, &num_class, "-", prim_num_neg);
    bind_prim(vm, &num_class, "~", prim_num_bit_not);
    bind_prim(vm, &num_class, "abs", prim_num_abs);
    bind_prim(vm, &num_class, "ceil", prim_num_ceil);
    bind_prim(vm, &num_class, "floor", prim_num_floor);
    bind_prim(vm, &num_class, "sqrt", prim_num_sqrt);
    bind_prim(vm, &num_class, "truncate", prim_num_truncate);
    bind_prim(vm, &num_class, "fraction", prim_num_fraction);
    bind_prim(vm, &num_class, "isInteger", prim_num_is_integer);
    bind_prim(vm, &num_class, "isNan", prim_num_is_nan);
    bind_prim(vm, &num_class, "toString", prim_num_to_string);

    // String
    bind_prim(vm, &string_class, "+(_)", prim_string_concat);
    bind_prim(vm, &string_class, "count", prim_string_count);
    bind_prim(vm, &string_class, "toString", prim_string_to_string);
    bind_prim(vm, &string_class, "contains(_)", prim_string_contains);
    bind_prim(vm, &string_class, "at_(_)", prim_string_at);

    // List
    bind_prim(vm, &meta_of(&list_class), "new()", prim_list_new);
    bind_prim(vm, &list_class, "addCore_(_)", prim_list_add_core);
    bind_prim(vm, &list_class, "add(_)", prim_list_add);
    bind_prim(vm, &list_class, "[_]", prim_list_subscript);
    bind_prim(vm, &list_class, "[_]=(_)", prim_list_subscript_setter);
    bind_prim(vm, &list_class, "count", prim_list_count);
    bind_prim(vm, &list_class, "removeAt(_)", prim_list_remove_at);
    bind_prim(vm, &list_class, "clear", prim_list_clear);
    bind_prim(vm, &list_class, "iterate(_)", prim_list_iterate);
    bind_prim(vm, &list_class, "iteratorValue(_)", prim_list_iterator_value);
    bind_prim(vm, &list_class, "toString", prim_object_to_string);

    // Map
    bind_prim(vm, &meta_of(&map_class), "new()", prim_map_new);
    bind_prim(vm, &map_class, "addCore_(_,_)", prim_map_add_core);
    bind_prim(vm, &map_class, "[_]", prim_map_subscript);
    bind_prim(vm, &map_class, "[_]=(_)", prim_map_subscript_setter);
    bind_prim(vm, &map_class, "count", prim_map_count);
    bind_prim(vm, &map_class, "remove(_)", prim_map_remove);
    bind_prim(vm, &map_class, "containsKey(_)", prim_map_contains_key);
    bind_prim(vm, &map_class, "clear", prim_map_clear);

    // Range
    bind_prim(vm, &range_class, "from", prim_range_from);
    bind_prim(vm, &range_class, "to", prim_range_to);
    bind_prim(vm, &range_class, "iterate(_)", prim_range_iterate);
    bind_prim(vm, &range_class, "iteratorValue(_)", prim_range_iterator_value);

    // Fn : Fn.new(f) et la famille call, marquée FnCall (le récepteur est
    // la fermeture elle-même).
    bind_prim(vm, &meta_of(&fn_class), "new(_)", prim_fn_new);
    for argc in 0..=16usize {
        let sign = call_signature(argc);
        let idx = vm.ensure_method_name(&sign);
        fn_class.borrow_mut().bind_method(idx, Method::FnCall);
    }

    // Thread
    bind_prim(vm, &meta_of(&thread_class), "new(_)", prim_thread_new);
    bind_prim(vm, &meta_of(&thread_class), "current", prim_thread_current);
    bind_prim(vm, &meta_of(&thread_class), "yield()", prim_thread_yield);
    bind_prim(vm, &meta_of(&thread_class), "yield(_)", prim_thread_yield_with_arg);
    bind_prim(vm, &meta_of(&thread_class), "abort(_)", prim_thread_abort);
    bind_prim(vm, &thread_class, "call()", prim_thread_call);
    bind_prim(vm, &thread_class, "call(_)", prim_thread_call_with_arg);
    bind_prim(vm, &thread_class, "isDone", prim_thread_is_done);

    // System
    let system_meta = meta_of(&system_class);
    bind_prim(vm, &system_meta, "writeString_(_)", prim_system_write_string);
    bind_prim(vm, &system_meta, "clock", prim_system_clock);
    bind_prim(vm, &system_meta, "gc()", prim_system_gc);
    bind_prim(vm, &system_meta, "importModule(_)", prim_system_import_module);
    bind_prim(vm, &system_meta, "getModuleVariable(_,_)", prim_system_get_module_variable);

    log::debug!(
        "core module ready: {} classes, {} method names",
        core.borrow().var_names.len(),
        vm.method_name_count()
    );
    Ok(())
}

fn core_class(core: &Gc<ditto_core::object::module::ObjModule>, name: &str) -> Result<Gc<ObjClass>, VmError> {
    let core = core.borrow();
    core.index_of(name)
        .and_then(|i| core.var_values[i].as_class())
        .ok_or_else(|| VmError::Internal(format!("core class {name} missing after bootstrap")))
}

fn bind_prim(vm: &mut Vm, class: &Gc<ObjClass>, sign: &str, p: Primitive) {
    let idx = vm.ensure_method_name(sign);
    class.borrow_mut().bind_method(idx, Method::Primitive(p));
}

fn meta_of(class: &Gc<ObjClass>) -> Gc<ObjClass> {
    class.borrow().header.class.clone().expect("metaclass wired")
}

fn call_signature(argc: usize) -> String {
    let mut s = String::from("call(");
    for i in 0..argc {
        if i > 0 {
            s.push(',');
        }
        s.push('_');
    }
    s.push(')');
    s
}

/* ───────────────────── garde-fous ───────────────────── */

fn check_num(vm: &mut Vm, v: &Value, what: &str) -> Option<f64> {
    match v.as_num() {
        Some(n) => Some(n),
        None => {
            thread_error(vm, &format!("{what} must be a number"));
            None
        }
    }
}

fn check_int(vm: &mut Vm, v: &Value, what: &str) -> Option<i64> {
    let n = check_num(vm, v, what)?;
    if n != n.trunc() {
        thread_error(vm, &format!("{what} must be an integer"));
        return None;
    }
    Some(n as i64)
}

fn check_index(vm: &mut Vm, v: &Value, len: usize) -> Option<usize> {
    let i = check_int(vm, v, "index")?;
    if i < 0 || i as usize >= len {
        thread_error(vm, "index out of bound");
        return None;
    }
    Some(i as usize)
}

/* ───────────────────── Object ───────────────────── */

fn prim_object_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(false);
    true
}

fn prim_object_eq(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(value_is_equal(&args[0], &args[1]));
    true
}

fn prim_object_ne(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(!value_is_equal(&args[0], &args[1]));
    true
}

/// `obj is Class` : remonte la chaîne des superclasses du type de `obj`.
fn prim_object_is(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(target) = args[1].as_class() else {
        return thread_error(vm, "right operand of is must be a class");
    };
    let mut class = Some(vm.class_of(&args[0]));
    while let Some(c) = class {
        if Gc::ptr_eq(&c, &target) {
            args[0] = Value::Bool(true);
            return true;
        }
        class = c.borrow().super_class.clone();
    }
    args[0] = Value::Bool(false);
    true
}

fn prim_object_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = new_string_value(vm, &stringify(&args[0]));
    true
}

fn prim_object_type(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Obj(Obj::Class(vm.class_of(&args[0])));
    true
}

/* ───────────────────── Class ───────────────────── */

fn prim_class_name(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(class) = args[0].as_class() else {
        return thread_error(vm, "receiver must be a class");
    };
    let name = class.borrow().name.clone();
    args[0] = new_string_value(vm, &name);
    true
}

fn prim_class_supertype(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(class) = args[0].as_class() else {
        return thread_error(vm, "receiver must be a class");
    };
    let sup = class.borrow().super_class.clone();
    args[0] = match sup {
        Some(s) => Value::Obj(Obj::Class(s)),
        None => Value::Null,
    };
    true
}

/// Constructeur par défaut : instance vierge, sans initialiseur. Les
/// classes déclarant `new(...)` l'écrasent par leur enveloppe statique.
fn prim_class_default_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(class) = args[0].as_class() else {
        return thread_error(vm, "receiver must be a class");
    };
    let inst = ditto_core::object::instance::ObjInstance::new(vm, class);
    args[0] = Value::Obj(Obj::Instance(inst));
    true
}

/* ───────────────────── Bool / Null ───────────────────── */

fn prim_bool_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let text = if matches!(args[0], Value::Bool(true)) { "true" } else { "false" };
    args[0] = new_string_value(vm, text);
    true
}

fn prim_bool_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let b = matches!(args[0], Value::Bool(true));
    args[0] = Value::Bool(!b);
    true
}

fn prim_null_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Bool(true);
    true
}

fn prim_null_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = new_string_value(vm, "null");
    true
}

/* ───────────────────── Num ───────────────────── */

macro_rules! num_binary {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
            let Some(b) = check_num(vm, &args[1], "right operand") else { return false };
            args[0] = Value::Num(a $op b);
            true
        }
    };
}

macro_rules! num_compare {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
            let Some(b) = check_num(vm, &args[1], "right operand") else { return false };
            args[0] = Value::Bool(a $op b);
            true
        }
    };
}

num_binary!(prim_num_add, +);
num_binary!(prim_num_sub, -);
num_binary!(prim_num_mul, *);
num_binary!(prim_num_div, /);
num_binary!(prim_num_rem, %);
num_compare!(prim_num_gt, >);
num_compare!(prim_num_ge, >=);
num_compare!(prim_num_lt, <);
num_compare!(prim_num_le, <=);

macro_rules! num_bitwise {
    ($name:ident, $body:expr) => {
        fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
            let Some(b) = check_num(vm, &args[1], "right operand") else { return false };
            let (a, b) = ((a as i64) as u32, (b as i64) as u32);
            let f: fn(u32, u32) -> u32 = $body;
            args[0] = Value::Num(f(a, b) as f64);
            true
        }
    };
}

num_bitwise!(prim_num_bit_and, |a, b| a & b);
num_bitwise!(prim_num_bit_or, |a, b| a | b);
num_bitwise!(prim_num_shr, |a, b| a.wrapping_shr(b));
num_bitwise!(prim_num_shl, |a, b| a.wrapping_shl(b));

fn prim_num_bit_not(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
    args[0] = Value::Num(!((a as i64) as u32) as f64);
    true
}

fn prim_num_neg(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
    args[0] = Value::Num(-a);
    true
}

/// `a..b` : les bornes doivent être entières.
fn prim_num_range(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(from) = check_int(vm, &args[0], "left bound of range") else { return false };
    let Some(to) = check_int(vm, &args[1], "right bound of range") else { return false };
    let range = ObjRange::new(vm, from, to);
    args[0] = Value::Obj(Obj::Range(range));
    true
}

macro_rules! num_unary {
    ($name:ident, $f:expr) => {
        fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
            let f: fn(f64) -> f64 = $f;
            args[0] = Value::Num(f(a));
            true
        }
    };
}

num_unary!(prim_num_abs, f64::abs);
num_unary!(prim_num_ceil, f64::ceil);
num_unary!(prim_num_floor, f64::floor);
num_unary!(prim_num_sqrt, f64::sqrt);
num_unary!(prim_num_truncate, f64::trunc);
num_unary!(prim_num_fraction, f64::fract);

fn prim_num_is_integer(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
    args[0] = Value::Bool(a.is_finite() && a == a.trunc());
    true
}

fn prim_num_is_nan(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
    args[0] = Value::Bool(a.is_nan());
    true
}

fn prim_num_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(a) = check_num(vm, &args[0], "receiver") else { return false };
    args[0] = new_string_value(vm, &stringify(&Value::Num(a)));
    true
}

fn prim_num_pi(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Num(std::f64::consts::PI);
    true
}

fn prim_num_from_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(s) = args[1].as_str() else {
        return thread_error(vm, "argument of fromString must be a string");
    };
    args[0] = match s.borrow().value.trim().parse::<f64>() {
        Ok(n) => Value::Num(n),
        Err(_) => Value::Null,
    };
    true
}

/* ───────────────────── String ───────────────────── */

fn prim_string_concat(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(a) = args[0].as_str() else {
        return thread_error(vm, "receiver must be a string");
    };
    let Some(b) = args[1].as_str() else {
        return thread_error(vm, "right operand of + must be a string");
    };
    let joined = format!("{}{}", a.borrow().value, b.borrow().value);
    args[0] = new_string_value(vm, &joined);
    true
}

fn prim_string_count(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(s) = args[0].as_str() else {
        return thread_error(vm, "receiver must be a string");
    };
    let len = s.borrow().len();
    args[0] = Value::Num(len as f64);
    true
}

fn prim_string_to_string(_vm: &mut Vm, _args: &mut [Value]) -> bool {
    true
}

fn prim_string_contains(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(s) = args[0].as_str() else {
        return thread_error(vm, "receiver must be a string");
    };
    let Some(needle) = args[1].as_str() else {
        return thread_error(vm, "argument of contains must be a string");
    };
    let found = s.borrow().value.contains(&needle.borrow().value);
    args[0] = Value::Bool(found);
    true
}

/// `s.at_(i)` : la chaîne d'un point de code à l'index `i`, en marchant
/// les séquences UTF-8 depuis le début.
fn prim_string_at(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(s) = args[0].as_str() else {
        return thread_error(vm, "receiver must be a string");
    };
    let Some(want) = check_int(vm, &args[1], "index") else { return false };
    if want < 0 {
        return thread_error(vm, "index out of bound");
    }
    let text = s.borrow().value.clone();
    let bytes = text.as_bytes();
    let mut at = 0usize;
    let mut seen = 0i64;
    while at < bytes.len() {
        let Some((_, n)) = utf8::decode_utf8(&bytes[at..]) else {
            return thread_error(vm, "string holds a malformed utf-8 sequence");
        };
        if seen == want {
            args[0] = new_string_value(vm, &text[at..at + n]);
            return true;
        }
        seen += 1;
        at += n;
    }
    thread_error(vm, "index out of bound")
}

/* ───────────────────── List ───────────────────── */

fn prim_list_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let list = ObjList::new(vm, Vec::new());
    args[0] = Value::Obj(Obj::List(list));
    true
}

/// Variante interne des littéraux de liste : rend la liste pour chaîner.
fn prim_list_add_core(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(list) = args[0].as_list() else {
        return thread_error(vm, "receiver must be a list");
    };
    list.borrow_mut().push(args[1].clone());
    true
}

fn prim_list_add(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(list) = args[0].as_list() else {
        return thread_error(vm, "receiver must be a list");
    };
    list.borrow_mut().push(args[1].clone());
    args[0] = args[1].clone();
    true
}

fn prim_list_subscript(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(list) = args[0].as_list() else {
        return thread_error(vm, "receiver must be a list");
    };
    let len = list.borrow().len();
    let Some(i) = check_index(vm, &args[1], len) else { return false };
    args[0] = list.borrow().elements[i].clone();
    true
}

fn prim_list_subscript_setter(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(list) = args[0].as_list() else {
        return thread_error(vm, "receiver must be a list");
    };
    let len = list.borrow().len();
    let Some(i) = check_index(vm, &args[1], len) else { return false };
    list.borrow_mut().elements[i] = args[2].clone();
    args[0] = args[2].clone();
    true
}

fn prim_list_count(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(list) = args[0].as_list() else {
        return thread_error(vm, "receiver must be a list");
    };
    let len = list.borrow().len();
    args[0] = Value::Num(len as f64);
    true
}

fn prim_list_remove_at(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(list) = args[0].as_list() else {
        return thread_error(vm, "receiver must be a list");
    };
    let len = list.borrow().len();
    let Some(i) = check_index(vm, &args[1], len) else { return false };
    args[0] = list.borrow_mut().remove_at(i).unwrap_or(Value::Null);
    true
}

fn prim_list_clear(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(list) = args[0].as_list() else {
        return thread_error(vm, "receiver must be a list");
    };
    list.borrow_mut().clear();
    args[0] = Value::Null;
    true
}

/// Protocole d'itération des boucles `for` : l'itérateur est l'index.
fn prim_list_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(list) = args[0].as_list() else {
        return thread_error(vm, "receiver must be a list");
    };
    let len = list.borrow().len();
    match &args[1] {
        Value::Null => {
            args[0] = if len == 0 { Value::Bool(false) } else { Value::Num(0.0) };
            true
        }
        v => {
            let Some(i) = check_int(vm, v, "iterator") else { return false };
            let next = i + 1;
            args[0] = if next >= 0 && (next as usize) < len {
                Value::Num(next as f64)
            } else {
                Value::Bool(false)
            };
            true
        }
    }
}

fn prim_list_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    prim_list_subscript(vm, args)
}

/* ───────────────────── Map ───────────────────── */

fn prim_map_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let map = ObjMap::new(vm);
    args[0] = Value::Obj(Obj::Map(map));
    true
}

fn prim_map_add_core(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(map) = args[0].as_map() else {
        return thread_error(vm, "receiver must be a map");
    };
    if !map.borrow_mut().set(args[1].clone(), args[2].clone()) {
        return thread_error(vm, "map key is not hashable");
    }
    true
}

fn prim_map_subscript(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(map) = args[0].as_map() else {
        return thread_error(vm, "receiver must be a map");
    };
    let v = map.borrow().get(&args[1]);
    args[0] = if v.is_undefined() { Value::Null } else { v };
    true
}

fn prim_map_subscript_setter(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(map) = args[0].as_map() else {
        return thread_error(vm, "receiver must be a map");
    };
    if !map.borrow_mut().set(args[1].clone(), args[2].clone()) {
        return thread_error(vm, "map key is not hashable");
    }
    args[0] = args[2].clone();
    true
}

fn prim_map_count(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(map) = args[0].as_map() else {
        return thread_error(vm, "receiver must be a map");
    };
    let len = map.borrow().len();
    args[0] = Value::Num(len as f64);
    true
}

fn prim_map_remove(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(map) = args[0].as_map() else {
        return thread_error(vm, "receiver must be a map");
    };
    let removed = map.borrow_mut().remove(&args[1]);
    args[0] = if removed.is_undefined() { Value::Null } else { removed };
    true
}

fn prim_map_contains_key(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(map) = args[0].as_map() else {
        return thread_error(vm, "receiver must be a map");
    };
    let found = map.borrow().contains(&args[1]);
    args[0] = Value::Bool(found);
    true
}

fn prim_map_clear(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(map) = args[0].as_map() else {
        return thread_error(vm, "receiver must be a map");
    };
    map.borrow_mut().clear();
    args[0] = Value::Null;
    true
}

/* ───────────────────── Range ───────────────────── */

fn prim_range_from(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(range) = args[0].as_range() else {
        return thread_error(vm, "receiver must be a range");
    };
    let from = range.borrow().from;
    args[0] = Value::Num(from as f64);
    true
}

fn prim_range_to(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(range) = args[0].as_range() else {
        return thread_error(vm, "receiver must be a range");
    };
    let to = range.borrow().to;
    args[0] = Value::Num(to as f64);
    true
}

/// L'itérateur d'un range est la valeur courante, bornes incluses, pas ±1.
fn prim_range_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(range) = args[0].as_range() else {
        return thread_error(vm, "receiver must be a range");
    };
    let (from, to) = {
        let r = range.borrow();
        (r.from, r.to)
    };
    match &args[1] {
        Value::Null => {
            args[0] = Value::Num(from as f64);
            true
        }
        v => {
            let Some(i) = check_int(vm, v, "iterator") else { return false };
            let next = if from <= to { i + 1 } else { i - 1 };
            let in_bounds = if from <= to { next <= to } else { next >= to };
            args[0] = if in_bounds { Value::Num(next as f64) } else { Value::Bool(false) };
            true
        }
    }
}

fn prim_range_iterator_value(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = args[1].clone();
    true
}

/* ───────────────────── Fn ───────────────────── */

fn prim_fn_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(_) = args[1].as_closure() else {
        return thread_error(vm, "argument of Fn.new must be a function");
    };
    args[0] = args[1].clone();
    true
}

/* ───────────────────── Thread ───────────────────── */

fn prim_thread_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(closure) = args[1].as_closure() else {
        return thread_error(vm, "argument of Thread.new must be a function");
    };
    let thread = ObjThread::new(vm, closure);
    args[0] = Value::Obj(Obj::Thread(thread));
    true
}

fn prim_thread_current(vm: &mut Vm, args: &mut [Value]) -> bool {
    match vm.cur_thread.clone() {
        Some(t) => {
            args[0] = Value::Obj(Obj::Thread(t));
            true
        }
        None => thread_error(vm, "no current thread"),
    }
}

/// Bascule volontaire vers `next`, `arg` devenant la valeur de reprise de
/// son `yield` suspendu (ou le slot 0 d'un thread vierge).
fn switch_to(vm: &mut Vm, next: Gc<ObjThread>, with_arg: Option<Value>) -> bool {
    if next.borrow().caller.is_some() {
        return thread_error(vm, "thread has been called");
    }
    if next.borrow().is_done() {
        return thread_error(vm, "a finished thread can not be switched to");
    }
    if !next.borrow().error_obj.is_null() {
        return thread_error(vm, "an aborted thread can not be switched to");
    }
    let Some(cur) = vm.cur_thread.clone() else {
        return thread_error(vm, "no current thread");
    };
    if Gc::ptr_eq(&cur, &next) {
        return thread_error(vm, "a thread can not call itself");
    }
    next.borrow_mut().caller = Some(cur.clone());
    // call(_) : l'argument laisse son slot, qui devient le slot du
    // résultat au retour, comme pour un appel ordinaire.
    if with_arg.is_some() {
        cur.borrow_mut().esp -= 1;
    }
    {
        let mut n = next.borrow_mut();
        let esp = n.esp;
        n.stack[esp - 1] = with_arg.unwrap_or(Value::Null);
    }
    vm.cur_thread = Some(next);
    false
}

fn prim_thread_call(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(next) = args[0].as_thread() else {
        return thread_error(vm, "receiver must be a thread");
    };
    switch_to(vm, next, None)
}

fn prim_thread_call_with_arg(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(next) = args[0].as_thread() else {
        return thread_error(vm, "receiver must be a thread");
    };
    switch_to(vm, next, Some(args[1].clone()))
}

/// Rend la main au thread appelant ; son `call()` suspendu reçoit `null`.
fn prim_thread_yield(vm: &mut Vm, _args: &mut [Value]) -> bool {
    let Some(cur) = vm.cur_thread.clone() else {
        return thread_error(vm, "no current thread");
    };
    let caller = cur.borrow_mut().caller.take();
    vm.cur_thread = caller.clone();
    if let Some(c) = caller {
        let mut ct = c.borrow_mut();
        let esp = ct.esp;
        ct.stack[esp - 1] = Value::Null;
    }
    false
}

/// `Thread.yield(v)` : comme `yield()`, le `call` de l'appelant vaut `v` ;
/// le slot de l'argument reste pour la valeur de reprise.
fn prim_thread_yield_with_arg(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(cur) = vm.cur_thread.clone() else {
        return thread_error(vm, "no current thread");
    };
    let caller = cur.borrow_mut().caller.take();
    vm.cur_thread = caller.clone();
    cur.borrow_mut().esp -= 1;
    if let Some(c) = caller {
        let mut ct = c.borrow_mut();
        let esp = ct.esp;
        ct.stack[esp - 1] = args[1].clone();
    }
    false
}

/// Annulation : l'erreur est posée par l'appelant de l'abandon.
fn prim_thread_abort(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(cur) = vm.cur_thread.clone() else {
        return thread_error(vm, "no current thread");
    };
    cur.borrow_mut().error_obj = if args[1].is_null() {
        new_string_value(vm, "thread aborted")
    } else {
        args[1].clone()
    };
    let caller = cur.borrow_mut().caller.take();
    vm.cur_thread = caller;
    false
}

fn prim_thread_is_done(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(t) = args[0].as_thread() else {
        return thread_error(vm, "receiver must be a thread");
    };
    let done = {
        let t = t.borrow();
        t.is_done() || !t.error_obj.is_null()
    };
    args[0] = Value::Bool(done);
    true
}

/* ───────────────────── System ───────────────────── */

fn prim_system_write_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(s) = args[1].as_str() else {
        return thread_error(vm, "argument of writeString_ must be a string");
    };
    let text = s.borrow().value.clone();
    vm.host.print(&text);
    args[0] = args[1].clone();
    true
}

fn prim_system_clock(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    args[0] = Value::Num(secs);
    true
}

/// Crochet d'atteignabilité : pas de collecte d'office, on expose le
/// compte d'objets de la liste globale.
fn prim_system_gc(vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = Value::Num(vm.object_count() as f64);
    true
}

/// `import` : le source du module est compilé puis exécuté sur son propre
/// thread, le thread importateur en appelant. Un module déjà chargé ne
/// tourne pas deux fois.
fn prim_system_import_module(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(name_h) = args[1].as_str() else {
        return thread_error(vm, "module name must be a string");
    };
    let name = name_h.borrow().value.clone();
    if vm.modules.contains_key(&Some(name.clone())) {
        args[0] = Value::Null;
        return true;
    }
    let path = match &vm.root_dir {
        Some(dir) => format!("{dir}/{name}.di"),
        None => format!("{name}.di"),
    };
    let src = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(_) => return thread_error(vm, &format!("module {name} not found at {path}")),
    };

    let module = get_or_make_module(vm, Some(&name));
    let fun = match compile_module(vm, &module, &src) {
        Ok(f) => f,
        Err(e) => {
            vm.modules.remove(&Some(name));
            return thread_error(vm, &e.to_string());
        }
    };
    let closure = ObjClosure::new(vm, fun, Vec::new());
    let next = ObjThread::new(vm, closure);

    // Le slot de l'argument devient le slot du résultat de l'import.
    let cur = vm.cur_thread.clone();
    if let Some(cur) = &cur {
        cur.borrow_mut().esp -= 1;
    }
    next.borrow_mut().caller = cur;
    vm.cur_thread = Some(next);
    false
}

fn prim_system_get_module_variable(vm: &mut Vm, args: &mut [Value]) -> bool {
    let (Some(module_h), Some(var_h)) = (args[1].as_str(), args[2].as_str()) else {
        return thread_error(vm, "module and variable names must be strings");
    };
    let module_name = module_h.borrow().value.clone();
    let var_name = var_h.borrow().value.clone();
    let Some(module) = vm.modules.get(&Some(module_name.clone())).cloned() else {
        return thread_error(vm, &format!("module {module_name} is not loaded"));
    };
    let m = module.borrow();
    match m.index_of(&var_name) {
        Some(idx) => {
            args[0] = m.var_values[idx].clone();
            true
        }
        None => {
            drop(m);
            thread_error(vm, &format!("variable {var_name} not found in module {module_name}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_vm;

    #[test]
    fn bootstrap_wires_the_root_triad() {
        let vm = boot_vm().unwrap();
        let object = vm.object_class.clone().unwrap();
        let class_of_class = vm.class_of_class.clone().unwrap();
        // Class est sa propre classe ; Object n'a pas de superclasse.
        assert!(Gc::ptr_eq(
            &class_of_class,
            &class_of_class.borrow().header.class.clone().unwrap()
        ));
        assert!(object.borrow().super_class.is_none());
        assert!(Gc::ptr_eq(
            &class_of_class.borrow().super_class.clone().unwrap(),
            &object
        ));
    }

    #[test]
    fn core_classes_are_fetched() {
        let vm = boot_vm().unwrap();
        for slot in [&vm.bool_class, &vm.num_class, &vm.string_class, &vm.list_class,
                     &vm.map_class, &vm.range_class, &vm.fn_class, &vm.thread_class] {
            assert!(slot.is_some());
        }
    }

    #[test]
    fn call_signature_shape() {
        assert_eq!(call_signature(0), "call()");
        assert_eq!(call_signature(1), "call(_)");
        assert_eq!(call_signature(3), "call(_,_,_)");
    }
}
