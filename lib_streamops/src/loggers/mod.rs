/// Installs the `tracing` subscriber and manages log files.
pub mod setup;

pub use setup::{init_tracing, LogOptions, LoggerError};
