//! Tracing initialisation and log helpers shared by every stage.
//!
//! Call [`init_tracing`] once at program start. Components never read or
//! change the log level afterwards; anything verbosity-dependent (such as
//! verbose test flags) is passed to them explicitly.

use serde::Serialize;
use tracing::{debug, info, Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::unit::UnitSet;

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// Only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// Log a framed section banner and return the span for the section.
///
/// Enter the span to tag the section's log lines with its title.
pub fn section(title: &str) -> Span {
    let rule = "=".repeat(title.len());
    info!("\n{rule}\n{title}\n{rule}\n");
    tracing::info_span!("section", name = %title)
}

/// Log the size of a unit map, and its full contents at debug level.
pub fn log_units<T: Serialize>(title: &str, units: &UnitSet<T>) {
    info!("{title} - found {} entries", units.len());
    if tracing::enabled!(Level::DEBUG) {
        match serde_json::to_string(units) {
            Ok(json) => debug!("{title} (object) - {json}"),
            Err(e) => debug!("{title} (object) - unserializable: {e}"),
        }
    }
}
