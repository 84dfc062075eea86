//! Unified error handling for the location HAL daemon
//!
//! This crate provides the single error type shared by the protocol, broker and
//! transport layers. It uses thiserror for Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using LocHalError
pub type Result<T> = std::result::Result<T, LocHalError>;

/// Unified error type for all daemon operations
#[derive(thiserror::Error, Debug)]
pub enum LocHalError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Invalid path {path}: {reason}")]
    InvalidPath {
        path: PathBuf,
        reason: String,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Client Protocol Errors
    // ============================================================================
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    #[error("Invalid request from {client}: {reason}")]
    InvalidRequest {
        client: String,
        reason: String,
    },

    #[error("Unknown client: {0}")]
    UnknownClient(String),

    // ============================================================================
    // Transport Errors
    // ============================================================================
    #[error("Transport to client {0} is closed")]
    ClientGone(String),
}

impl LocHalError {
    /// Create an invalid config value error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed message error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }
}
