pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{AppConfig, BatchErrorPolicy, Dimension, ModelConfig, RunConfig};
pub use error::{ModelError, ModelErrorKind, Result, SjtError};
pub use traits::{DataSource, ModelClient};
pub use types::*;
