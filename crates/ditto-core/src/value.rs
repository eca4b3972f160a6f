//! value.rs — Modèle de valeurs dynamiques du langage Ditto.
//!
//! Une [`Value`] est une union taguée : `Undefined` (sentinelle interne,
//! jamais visible du script), `Null`, booléen, nombre flottant 64 bits, ou
//! référence vers un objet tas ([`Obj`]).
//!
//! Contrat d'égalité :
//! - nombres par égalité numérique,
//! - chaînes par contenu d'octets,
//! - ranges par paire `(from, to)`,
//! - tout autre objet par identité de référence.

use std::fmt::Write as _;
use std::rc::Rc;

use crate::object::class::ObjClass;
use crate::object::fun::{ObjClosure, ObjFn, ObjUpvalue};
use crate::object::instance::ObjInstance;
use crate::object::list::ObjList;
use crate::object::map::ObjMap;
use crate::object::module::ObjModule;
use crate::object::range::ObjRange;
use crate::object::string::ObjString;
use crate::object::thread::ObjThread;
use crate::Gc;

/// Valeur dynamique.
#[derive(Clone)]
pub enum Value {
    /// Sentinelle interne : slot non initialisé, clé absente, marqueur de
    /// référence avant définition. Jamais exposée au script.
    Undefined,
    /// `null`.
    Null,
    /// `true` / `false`.
    Bool(bool),
    /// Nombre flottant 64 bits.
    Num(f64),
    /// Référence vers un objet tas.
    Obj(Obj),
}

/// Référence taguée vers un objet tas, par sorte.
#[derive(Clone)]
pub enum Obj {
    Str(Gc<ObjString>),
    List(Gc<ObjList>),
    Map(Gc<ObjMap>),
    Module(Gc<ObjModule>),
    Range(Gc<ObjRange>),
    Upvalue(Gc<ObjUpvalue>),
    Fun(Gc<ObjFn>),
    Closure(Gc<ObjClosure>),
    Class(Gc<ObjClass>),
    Instance(Gc<ObjInstance>),
    Thread(Gc<ObjThread>),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_num(&self) -> bool {
        matches!(self, Value::Num(_))
    }

    /// `null` et `false` sont les deux seules valeurs fausses.
    pub fn is_falsy(&self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<Gc<ObjString>> {
        match self {
            Value::Obj(Obj::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<Gc<ObjList>> {
        match self {
            Value::Obj(Obj::List(l)) => Some(l.clone()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<Gc<ObjMap>> {
        match self {
            Value::Obj(Obj::Map(m)) => Some(m.clone()),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<Gc<ObjRange>> {
        match self {
            Value::Obj(Obj::Range(r)) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn as_fun(&self) -> Option<Gc<ObjFn>> {
        match self {
            Value::Obj(Obj::Fun(f)) => Some(f.clone()),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<Gc<ObjClosure>> {
        match self {
            Value::Obj(Obj::Closure(c)) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<Gc<ObjClass>> {
        match self {
            Value::Obj(Obj::Class(c)) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<Gc<ObjInstance>> {
        match self {
            Value::Obj(Obj::Instance(i)) => Some(i.clone()),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<Gc<ObjThread>> {
        match self {
            Value::Obj(Obj::Thread(t)) => Some(t.clone()),
            _ => None,
        }
    }

    /// Construit une valeur chaîne à partir d'une poignée.
    pub fn str(s: Gc<ObjString>) -> Value {
        Value::Obj(Obj::Str(s))
    }
}

/// Égalité suivant le contrat du langage.
pub fn value_is_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => obj_is_equal(x, y),
        _ => false,
    }
}

fn obj_is_equal(a: &Obj, b: &Obj) -> bool {
    match (a, b) {
        // Chaînes : contenu.
        (Obj::Str(x), Obj::Str(y)) => {
            Rc::ptr_eq(x, y) || x.borrow().value == y.borrow().value
        }
        // Ranges : (from, to).
        (Obj::Range(x), Obj::Range(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.from == y.from && x.to == y.to
        }
        // Tout le reste : identité de référence.
        (Obj::List(x), Obj::List(y)) => Rc::ptr_eq(x, y),
        (Obj::Map(x), Obj::Map(y)) => Rc::ptr_eq(x, y),
        (Obj::Module(x), Obj::Module(y)) => Rc::ptr_eq(x, y),
        (Obj::Upvalue(x), Obj::Upvalue(y)) => Rc::ptr_eq(x, y),
        (Obj::Fun(x), Obj::Fun(y)) => Rc::ptr_eq(x, y),
        (Obj::Closure(x), Obj::Closure(y)) => Rc::ptr_eq(x, y),
        (Obj::Class(x), Obj::Class(y)) => Rc::ptr_eq(x, y),
        (Obj::Instance(x), Obj::Instance(y)) => Rc::ptr_eq(x, y),
        (Obj::Thread(x), Obj::Thread(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        value_is_equal(self, other)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Num(n) => write!(f, "Num({n})"),
            Value::Obj(o) => write!(f, "Obj({})", stringify_obj(o)),
        }
    }
}

impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", stringify_obj(self))
    }
}

/// Hash d'une valeur utilisable comme clé de map, `None` si non hashable.
///
/// Les sortes hashables sont celles du langage : null, booléens, nombres,
/// chaînes, ranges et classes (par leur nom).
pub fn value_hash(v: &Value) -> Option<u32> {
    match v {
        Value::Null => Some(1),
        Value::Bool(false) => Some(2),
        Value::Bool(true) => Some(3),
        Value::Num(n) => Some(hash_num(*n)),
        Value::Obj(Obj::Str(s)) => Some(s.borrow().hash),
        Value::Obj(Obj::Range(r)) => {
            let r = r.borrow();
            Some(hash_num(r.from as f64) ^ hash_num(r.to as f64))
        }
        Value::Obj(Obj::Class(c)) => Some(crate::object::string::hash_string(
            c.borrow().name.as_bytes(),
        )),
        _ => None,
    }
}

/// Replie les 64 bits d'un flottant en 32.
fn hash_num(n: f64) -> u32 {
    let bits = n.to_bits();
    (bits ^ (bits >> 32)) as u32
}

/// Rendu texte "natif" d'une valeur, sans passer par les méthodes script.
///
/// Utilisé par les primitives `toString`, l'écho du REPL et les messages
/// d'erreur. Les nombres entiers s'affichent sans partie fractionnaire.
pub fn stringify(v: &Value) -> String {
    match v {
        Value::Undefined => "undefined".into(),
        Value::Null => "null".into(),
        Value::Bool(true) => "true".into(),
        Value::Bool(false) => "false".into(),
        Value::Num(n) => stringify_num(*n),
        Value::Obj(o) => stringify_obj(o),
    }
}

fn stringify_num(n: f64) -> String {
    if n.is_nan() {
        "nan".into()
    } else if n.is_infinite() {
        if n > 0.0 { "infinity".into() } else { "-infinity".into() }
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn stringify_obj(o: &Obj) -> String {
    match o {
        Obj::Str(s) => s.borrow().value.clone(),
        Obj::Range(r) => {
            let r = r.borrow();
            format!("{}..{}", r.from, r.to)
        }
        Obj::List(l) => {
            let l = l.borrow();
            let mut out = String::from("[");
            for (i, e) in l.elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(&mut out, "{}", stringify(e));
            }
            out.push(']');
            out
        }
        Obj::Map(m) => format!("<map {} entries>", m.borrow().len()),
        Obj::Module(md) => match &md.borrow().name {
            Some(n) => format!("<module {n}>"),
            None => "<module core>".into(),
        },
        Obj::Upvalue(_) => "<upvalue>".into(),
        Obj::Fun(f) => format!("<fn {}>", f.borrow().name),
        Obj::Closure(c) => format!("<fn {}>", c.borrow().fun.borrow().name),
        Obj::Class(c) => c.borrow().name.clone(),
        Obj::Instance(i) => {
            let class = i.borrow().header.class.clone();
            match class {
                Some(c) => format!("<instance of {}>", c.borrow().name),
                None => "<instance>".into(),
            }
        }
        Obj::Thread(_) => "<thread>".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vm;

    #[test]
    fn falsiness() {
        assert!(Value::Null.is_falsy());
        assert!(Value::Bool(false).is_falsy());
        assert!(!Value::Bool(true).is_falsy());
        assert!(!Value::Num(0.0).is_falsy());
        assert!(!Value::Undefined.is_falsy());
    }

    #[test]
    fn string_equality_is_by_content() {
        let mut vm = Vm::new();
        let a = ObjString::new(&mut vm, "abc");
        let b = ObjString::new(&mut vm, "abc");
        let c = ObjString::new(&mut vm, "abd");
        assert!(value_is_equal(&Value::str(a), &Value::str(b.clone())));
        assert!(!value_is_equal(&Value::str(b), &Value::str(c)));
    }

    #[test]
    fn range_equality_is_by_bounds() {
        let mut vm = Vm::new();
        let a = ObjRange::new(&mut vm, 1, 4);
        let b = ObjRange::new(&mut vm, 1, 4);
        assert!(value_is_equal(
            &Value::Obj(Obj::Range(a)),
            &Value::Obj(Obj::Range(b))
        ));
    }

    #[test]
    fn num_formatting() {
        assert_eq!(stringify(&Value::Num(7.0)), "7");
        assert_eq!(stringify(&Value::Num(3.5)), "3.5");
        assert_eq!(stringify(&Value::Num(-0.25)), "-0.25");
    }

    #[test]
    fn num_hash_is_deterministic() {
        assert_eq!(value_hash(&Value::Num(1.5)), value_hash(&Value::Num(1.5)));
        assert!(value_hash(&Value::Undefined).is_none());
    }
}
