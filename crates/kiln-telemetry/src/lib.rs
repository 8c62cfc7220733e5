//! Kiln Telemetry - logging for the Kiln plugin host.
//!
//! ```rust,no_run
//! use kiln_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), kiln_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("kiln::plugin=debug");
//! setup_logging(&config)?;
//! tracing::info!("host ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    LOG_FILE_PREFIX, LogConfig, LogFormat, LogTarget, PLUGIN_LOG_TARGET, setup_default_logging,
    setup_logging,
};
