//! Logger setup for the daemon.

use chrono::Local;
use log::LevelFilter;
use std::io::Write;

/// Initialize the global logger.
///
/// `RUST_LOG` overrides the default level; `verbose` raises the default
/// from info to debug.
pub fn init(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(default_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:5} {}: {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
