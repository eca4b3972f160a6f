//! error.rs — Erreurs de compilation.
//!
//! Une erreur est fatale pour le module entier : le bytecode partiel est
//! jeté, rien n'est exécuté.

use thiserror::Error;

/// Erreur lexicale ou de compilation, localisée fichier + ligne.
#[derive(Debug, Clone, Error)]
#[error("{}:{line}: {msg}", file.as_deref().unwrap_or("<script>"))]
pub struct CompileError {
    /// Nom du module (ou du fichier) en cours de compilation.
    pub file: Option<String>,
    pub line: u32,
    pub msg: String,
}

impl CompileError {
    pub fn new(file: Option<&str>, line: u32, msg: impl Into<String>) -> Self {
        Self { file: file.map(str::to_owned), line, msg: msg.into() }
    }
}
