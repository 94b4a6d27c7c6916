//! Configuration for Datamart services.
//!
//! Settings come from one TOML or JSON document (a path, inline JSON, or a
//! well-known file), with a handful of environment variables layered on top.
//! [`logging::init`] sets up the shared tracing subscriber.
#![allow(missing_docs)]

pub mod error;
pub mod loader;
pub mod logging;
pub mod models;
pub mod util;
pub mod validation;

pub use error::ConfigLoadError;
pub use loader::{ConfigLoad, ConfigLoader};
pub use models::{BusConfig, Config, ConfigSource};
