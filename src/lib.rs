// Typed failure taxonomy
pub mod error;

// Secret vault (credential encryption, masking)
pub mod credentials;

// Per-connector admission control
pub mod rate_limit;

// Framework configuration
pub mod config;

pub use error::{ConnectorError, ErrorKind, Result};
