//! Cross-cutting utilities shared by every layer: retry backoff and
//! logging initialisation.

mod backoff;
mod logging;

pub use backoff::ExponentialBackoff;
pub use logging::init_logging;
