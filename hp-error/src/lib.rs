//! Unified error handling for hwprobe
//!
//! This crate provides the single error type used across the hardware access
//! layer. Most runtime failures in that layer are reported as `false`/`None`
//! rather than errors; `ProbeError` covers the places where a reason matters
//! (driver installation, configuration, invalid caller input).

use std::io;
use std::path::PathBuf;

/// Result type alias using ProbeError
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Unified error type for all hwprobe operations
#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // ============================================================================
    // Thread Affinity Errors
    // ============================================================================
    #[error("Processor group {group} out of range ({groups} group(s) available)")]
    AffinityOutOfRange {
        group: u16,
        groups: u16,
    },

    // ============================================================================
    // Driver and Service Management Errors
    // ============================================================================
    #[error("Service control manager unavailable: {0}")]
    ServiceManagerUnavailable(String),

    #[error("Service already exists: {0}")]
    ServiceExists(String),

    #[error("Failed to create service {name}: {reason}")]
    ServiceCreate {
        name: String,
        reason: String,
    },

    #[error("Failed to start service {name}: {reason}")]
    ServiceStart {
        name: String,
        reason: String,
    },

    #[error("Failed to open device {device}: {reason}")]
    DeviceOpen {
        device: String,
        reason: String,
    },

    #[error("Driver not open")]
    DriverNotOpen,

    #[error("No driver image available: {0}")]
    DriverImageMissing(String),

    #[error("Failed to decompress driver image: {0}")]
    Decompress(String),

    // ============================================================================
    // Invalid Input Errors
    // ============================================================================
    #[error("PCI register address {0:#x} is not 4-byte aligned")]
    MisalignedPciRegister(u32),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl ProbeError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not-supported error from a string
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// True for errors that only mean "this platform or driver is not there"
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NotSupported(_)
                | Self::DriverNotOpen
                | Self::DriverImageMissing(_)
                | Self::ServiceManagerUnavailable(_)
        )
    }
}

// Allow converting from String to ProbeError
impl From<String> for ProbeError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to ProbeError
impl From<&str> for ProbeError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
