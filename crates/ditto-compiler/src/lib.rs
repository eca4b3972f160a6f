//! ditto-compiler — Frontend du langage Ditto.
//!
//! Deux étages : le lexeur ([`lexer`]), flux paresseux de tokens avec état
//! d'interpolation, et le compilateur Pratt une passe ([`compile`]) qui
//! émet le bytecode ditto-core module par module. Une erreur est fatale
//! pour le module : aucun bytecode partiel ne sort d'ici.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

pub mod compile;
pub mod error;
pub mod lexer;
pub mod token;

pub use compile::{compile_module, Signature};
pub use error::CompileError;
