//! Error types for the bundling pipeline
//!
//! Sizing and configuration problems are fatal: they surface as
//! [`BundleError`] and the run stops. Capacity exhaustion of a polyline is
//! not an error; the edge processor resizes its storage instead.

use thiserror::Error;

/// Errors that can occur while building or running the bundling pipeline
#[derive(Error, Debug)]
pub enum BundleError {
    /// A configuration value is out of range
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The network description is inconsistent
    #[error("invalid network input: {0}")]
    InvalidInput(String),

    /// A buffer would exceed the device's storage-buffer ceiling
    #[error("buffer '{label}' needs {bytes} bytes, device limit is {limit} bytes")]
    BufferTooLarge {
        label: String,
        bytes: u64,
        limit: u64,
    },

    /// A single dispatch was issued wider than the device allows
    #[error("dispatch of {kernel} over {count} elements exceeds the device width {max}")]
    DispatchTooWide {
        kernel: &'static str,
        count: usize,
        max: usize,
    },

    /// Uniforms passed to a kernel do not match its contract
    #[error("kernel {kernel}: uniform '{key}' {problem}")]
    UniformContract {
        kernel: &'static str,
        key: String,
        problem: &'static str,
    },

    /// Buffers bound to a kernel do not match its contract
    #[error("kernel {kernel}: {problem}")]
    BindingContract {
        kernel: &'static str,
        problem: String,
    },

    /// A kernel would read and write the same buffer
    #[error("kernel {kernel} reads and writes buffer {buffer}")]
    Hazard { kernel: &'static str, buffer: u64 },

    /// A handle does not refer to a live buffer
    #[error("unknown buffer handle {0}")]
    UnknownBuffer(u64),

    /// Device creation or readback failed
    #[error("device error: {0}")]
    Device(String),

    /// An I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for bundling operations
pub type Result<T> = std::result::Result<T, BundleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_too_large_names_the_buffer() {
        let err = BundleError::BufferTooLarge {
            label: "samples[0/1]".to_string(),
            bytes: 2048,
            limit: 1024,
        };
        let message = err.to_string();
        assert!(message.contains("samples[0/1]"));
        assert!(message.contains("2048"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: BundleError = io.into();
        assert!(matches!(err, BundleError::Io(_)));
    }
}
