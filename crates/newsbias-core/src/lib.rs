//! NewsBias Core — shared error type and service configuration.

pub mod config;
pub mod error;

pub use config::{DataPaths, ServiceConfig};
pub use error::{Error, Result};
