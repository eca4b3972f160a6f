//! ditto-core — Cœur du langage Ditto.
//!
//! Ce crate porte tout ce que le compilateur et la boucle d'exécution
//! partagent :
//!
//! - le modèle de valeurs dynamique [`Value`] et les objets tas (`object`),
//! - la table des variables de module avec sa sentinelle de référence avant
//!   définition (`object::module`),
//! - la table d'opcodes ([`bytecode`]) : largeur d'opérandes + delta de pile,
//! - le modèle thread/frame (`object::thread`),
//! - l'état global de la VM ([`Vm`]) : classes primitives, table des
//!   signatures de méthodes, registre des modules, liste de tous les objets.
//!
//! La boucle de dispatch elle-même vit dans `ditto-vm`, le frontend dans
//! `ditto-compiler` ; les deux ne se connaissent que via ce crate.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

use std::cell::RefCell;
use std::rc::Rc;

pub mod bytecode;
pub mod object;
pub mod utf8;
pub mod value;
pub mod vm;

pub use value::{Obj, Value};
pub use vm::{DefaultHost, Host, Vm};

/// Poignée GC coopérative : comptage de références + mutabilité intérieure.
pub type Gc<T> = Rc<RefCell<T>>;

/// Construit une poignée [`Gc`].
pub fn gc<T>(v: T) -> Gc<T> {
    Rc::new(RefCell::new(v))
}

/// Longueur maximale d'un identifiant source.
pub const MAX_ID_LEN: usize = 128;

/// Nombre maximal de variables locales par unité de compilation.
pub const MAX_LOCAL_VAR_NUM: usize = 128;

/// Nombre maximal d'upvalues par fonction.
pub const MAX_UPVALUE_NUM: usize = 128;

/// Nombre maximal de champs d'une classe (hérités compris).
pub const MAX_FIELD_NUM: usize = 128;

/// Nombre maximal d'arguments d'un appel de méthode.
pub const MAX_ARG_NUM: usize = 16;
