//! Logging setup for the binary. The library only emits `tracing` events.

use std::str::FromStr;

use tracing::Level;

/// Parse a level name (`error`, `warn`/`warning`, `info`, `debug`, `trace`,
/// any case). Unknown names fall back to `INFO`.
pub fn parse_level(name: &str) -> Level {
    let name = name.trim();
    if name.eq_ignore_ascii_case("warning") {
        return Level::WARN;
    }
    Level::from_str(name).unwrap_or(Level::INFO)
}

/// Install a `fmt` subscriber at `level`. Returns false when a global
/// subscriber was already installed, which makes repeated calls harmless.
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .try_init()
        .is_ok()
}
