//! Error types emitted by the backbone.
//!
//! Every failure here is a programming or usage error rather than a
//! transient condition: nothing is retried internally, and callers are
//! expected to abort the generation session on any of these.

/// Backbone-specific error category.
#[derive(Debug)]
pub enum BackboneError {
    /// The configuration is structurally invalid (wrong architecture
    /// variant, indivisible head counts, zero-sized dimensions).
    Config { message: String },
    /// An operation was invoked before the state it depends on was set
    /// up, e.g. `forward` before `allocate_inference_cache`.
    UsageOrder { message: String },
    /// A cache write or rotary-table lookup addressed a region outside
    /// the allocated capacity.
    Capacity { context: String },
    /// A backend failure propagated from the tensor library.
    Backend { message: String },
}

impl std::fmt::Display for BackboneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackboneError::Config { message } => {
                write!(f, "invalid backbone configuration: {message}")
            }
            BackboneError::UsageOrder { message } => {
                write!(f, "usage-order violation: {message}")
            }
            BackboneError::Capacity { context } => {
                write!(f, "capacity exceeded: {context}")
            }
            BackboneError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for BackboneError {}

impl From<candle_core::Error> for BackboneError {
    fn from(err: candle_core::Error) -> Self {
        BackboneError::Backend {
            message: err.to_string(),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = BackboneError> = std::result::Result<T, E>;
