pub mod map;
pub mod mask;
pub mod methods;

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

/// Print `Error: {msg}` and exit with code 1.
pub fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

/// Parse a duration string like "5m", "30s", "1h", "100ms", "1.5s".
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let (numeric, unit_secs) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 0.001)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1.0)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60.0)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3600.0)
    } else {
        (s, 1.0)
    };

    let value: f64 = numeric
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: '{s}'"))?;
    if !(value > 0.0 && value.is_finite()) {
        return Err(format!("duration must be positive: '{s}'"));
    }
    Ok(Duration::from_secs_f64(value * unit_secs))
}

/// Write `value` as pretty JSON to `path`, or to stdout when `path` is None.
pub fn write_json<T: Serialize>(value: &T, path: Option<&Path>) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("cannot serialize report: {e}"))?;
    match path {
        Some(path) => std::fs::write(path, json + "\n")
            .map_err(|e| format!("cannot write {}: {e}", path.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}
