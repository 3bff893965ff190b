//! Presentation helpers shared by the subcommands.

use serde::Serialize;

/// Set by `main` from the global `--json` flag.
pub fn is_json() -> bool {
    std::env::var("HARVEST_JSON").is_ok_and(|v| v == "1")
}

/// Set by `main` from the global `--quiet` flag.
pub fn is_quiet() -> bool {
    std::env::var("HARVEST_QUIET").is_ok_and(|v| v == "1")
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("  failed to serialize output: {e}"),
    }
}

/// One doctor line: `[OK]`, `[!!]` or `[??]`.
pub fn check_line(ok: Option<bool>, message: &str) {
    let tag = match ok {
        Some(true) => "[OK]",
        Some(false) => "[!!]",
        None => "[??]",
    };
    println!("{tag} {message}");
}
