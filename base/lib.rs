// Shared plumbing for the vigil-server and vigil-client binaries: a
// testable clock abstraction, a graceful-shutdown signal, tracing setup,
// and small formatting helpers. No camera-specific logic lives here.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::ResultExt;
