//! Error handling for the feature pipe
//!
//! This module defines the crate-wide error type and a Result alias. Most
//! runtime failures inside the graph are reported through status returns and
//! logging; the variants here cover construction, lifecycle and configuration.

use thiserror::Error;

/// Main error type for feature pipe operations
#[derive(Error, Debug)]
pub enum PipeError {
    /// A lifecycle call was made from the wrong graph stage
    #[error("Invalid stage for {operation}: expected {expected}, found {found}")]
    InvalidStage {
        operation: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    /// A node hook failed during a lifecycle transition
    #[error("Node '{node}' failed to {phase}")]
    NodeLifecycle { node: String, phase: &'static str },

    /// A node declared IO inconsistent with the fixed topology
    #[error("Topology error on {node}: {message}")]
    Topology { node: String, message: String },

    /// Every data item slot of an inference pass is in use
    #[error("Data item table exhausted ({0} slots)")]
    DataItemsExhausted(usize),

    /// No pipe-internal buffer id left for a request
    #[error("Pipe buffer ids exhausted")]
    BufferIdsExhausted,

    /// The concrete allocator failed to produce a buffer
    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    /// A reference count or delivery contract was broken
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipeError>,
    },
}

impl PipeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn topology(node: impl Into<String>, message: impl Into<String>) -> Self {
        PipeError::Topology {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for feature pipe operations
pub type Result<T> = std::result::Result<T, PipeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipeError::Protocol("negative buffer reference".to_string());
        assert_eq!(
            err.to_string(),
            "Protocol violation: negative buffer reference"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = PipeError::Config("bad value".to_string());
        let with_ctx = err.with_context("Failed to load pipe.toml");
        assert!(with_ctx.to_string().contains("Failed to load pipe.toml"));
        assert!(with_ctx.to_string().contains("bad value"));
    }

    #[test]
    fn test_invalid_stage_error() {
        let err = PipeError::InvalidStage {
            operation: "start",
            expected: "ready",
            found: "running",
        };
        assert!(err.to_string().contains("start"));
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn test_result_ext_context() {
        let res: Result<()> = Err(PipeError::BufferIdsExhausted);
        let err = res.context("determine").unwrap_err();
        assert!(matches!(err, PipeError::WithContext { .. }));
    }
}
