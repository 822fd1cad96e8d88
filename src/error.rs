//! Error types for TierCache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Layer Errors
    // =========================================================================
    /// Layer is degraded, in maintenance or offline
    #[error("Layer unavailable: {layer} ({status})")]
    LayerUnavailable { layer: String, status: String },

    /// Layer is not declared in the registry
    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    /// A write would exceed a layer's capacity (internal signal)
    #[error("Capacity exceeded on layer {layer}: need {required} bytes, {available} available")]
    CapacityExceeded {
        layer: String,
        required: u64,
        available: u64,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration patch rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Load or save against the persistence collaborator failed
    #[error("Persistence failure for key {key}: {reason}")]
    Persistence { key: String, reason: String },

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures the caller of `get`/`set`/`invalidate` is allowed to see
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::LayerUnavailable { .. } | Error::UnknownLayer(_) | Error::InvalidConfiguration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_unavailable_display() {
        let err = Error::LayerUnavailable {
            layer: "l2".into(),
            status: "offline".into(),
        };
        assert_eq!(err.to_string(), "Layer unavailable: l2 (offline)");
        assert!(err.is_user_visible());
    }

    #[test]
    fn test_internal_errors_are_not_user_visible() {
        let err = Error::CompressionFailed {
            algorithm: "lz4".into(),
            reason: "boom".into(),
        };
        assert!(!err.is_user_visible());
        assert!(!Error::Internal("x".into()).is_user_visible());
    }
}
