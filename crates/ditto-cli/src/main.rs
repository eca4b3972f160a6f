//! ditto-cli/src/main.rs
//!
//! Point d'entrée du binaire `di`. main.rs reste minimal : logs, puis
//! délégation à `ditto_cli::run()`. La lib se teste en unité.

fn main() {
    // Logs activés via RUST_LOG.
    env_logger::init();

    if let Err(err) = ditto_cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
