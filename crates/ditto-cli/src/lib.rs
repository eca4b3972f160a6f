//! ditto-cli/src/lib.rs — Pilote du langage Ditto.
//!
//! Deux modes :
//!   - `di`          : REPL ligne à ligne, chaque entrée compilée et
//!                     exécutée dans le module "cli" (les variables
//!                     persistent d'une ligne à l'autre) ;
//!   - `di <chemin>` : compile et exécute le fichier comme module nommé
//!                     par son chemin ; le répertoire du fichier devient
//!                     la racine de résolution des `import`.
//!
//! Code de sortie : 0 sur terminaison propre, 1 sur toute erreur.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ditto_vm::{boot_vm, execute_module, VmError};

/// Point d'entrée (appelé depuis src/main.rs).
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.file {
        Some(path) => run_file(path),
        None => repl(),
    }
}

#[derive(Parser, Debug)]
#[command(name = "di", version, about = "Ditto language interpreter")]
struct Cli {
    /// Script à exécuter ; REPL si absent.
    file: Option<PathBuf>,
}

fn run_file(path: PathBuf) -> Result<()> {
    let src = std::fs::read_to_string(&path)
        .with_context(|| format!("can not read {}", path.display()))?;
    let mut vm = boot_vm().context("core bootstrap failed")?;
    // La racine d'import est le répertoire du script.
    vm.root_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned());

    let module_name = path.to_string_lossy().into_owned();
    log::info!("running {module_name}");
    execute_module(&mut vm, Some(&module_name), &src)
        .with_context(|| format!("execution of {module_name} failed"))?;
    Ok(())
}

fn repl() -> Result<()> {
    let mut vm = boot_vm().context("core bootstrap failed")?;
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!(">>> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            return Ok(()); // fin d'entrée
        };
        let line = line?;
        if line.starts_with("quit") {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        // Une erreur n'abat pas le REPL, la ligne suivante repart saine.
        match execute_module(&mut vm, Some("cli"), &line) {
            Ok(()) => {}
            Err(VmError::Compile(e)) => eprintln!("{e}"),
            Err(e) => eprintln!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_optional_file() {
        let cli = Cli::parse_from(["di"]);
        assert!(cli.file.is_none());
        let cli = Cli::parse_from(["di", "demo.di"]);
        assert_eq!(cli.file.unwrap(), PathBuf::from("demo.di"));
    }
}
