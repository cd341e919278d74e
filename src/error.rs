/*!
 * Error types for Manufactory
 */

use std::fmt;
use std::io;

use crate::core::facility::FacilityError;
use crate::core::loader::LoadError;
use crate::model::{BuildingId, ManufactureId};

pub type Result<T> = std::result::Result<T, ManufactoryError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug)]
pub enum ManufactoryError {
    /// Configuration error
    Config(String),

    /// Pipeline manifest could not be parsed
    Manifest(String),

    /// I/O error
    Io(io::Error),

    /// A manufacture failed graph validation or loading
    Load {
        manufacture: ManufactureId,
        source: LoadError,
    },

    /// Facility admission refused
    Admission(FacilityError),

    /// No loaded manufacture owns this building
    UnknownBuilding(BuildingId),

    /// No such loaded manufacture
    UnknownManufacture(ManufactureId),

    /// `run_miner` called on a building that is not a miner
    NotAMiner(BuildingId),

    /// Piece or record store failure
    Store(String),

    /// The hub is shutting down
    ShuttingDown,

    /// Generic error with message
    Other(String),
}

impl ManufactoryError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ManufactoryError::Config(_)
            | ManufactoryError::Manifest(_)
            | ManufactoryError::Io(_)
            | ManufactoryError::Store(_) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Admission conflicts resolve by themselves once running work finishes
    pub fn is_transient(&self) -> bool {
        matches!(self, ManufactoryError::Admission(_))
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            ManufactoryError::Config(_) => ErrorCategory::Configuration,
            ManufactoryError::Manifest(_) | ManufactoryError::Load { .. } => ErrorCategory::Graph,
            ManufactoryError::Io(_) => ErrorCategory::IoError,
            ManufactoryError::Admission(_) => ErrorCategory::Admission,
            ManufactoryError::UnknownBuilding(_)
            | ManufactoryError::UnknownManufacture(_)
            | ManufactoryError::NotAMiner(_) => ErrorCategory::Validation,
            ManufactoryError::Store(_) => ErrorCategory::Storage,
            ManufactoryError::ShuttingDown => ErrorCategory::Lifecycle,
            ManufactoryError::Other(_) => ErrorCategory::Unknown,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration errors
    Configuration,
    /// Pipeline graph errors (manifest, integrity)
    Graph,
    /// I/O operation errors
    IoError,
    /// Facility capacity and exclusivity conflicts
    Admission,
    /// Bad references from callers
    Validation,
    /// Piece/record store errors
    Storage,
    /// Startup and shutdown
    Lifecycle,
    /// Uncategorized errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Graph => write!(f, "graph"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Admission => write!(f, "admission"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Lifecycle => write!(f, "lifecycle"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl fmt::Display for ManufactoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManufactoryError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ManufactoryError::Manifest(msg) => write!(f, "Manifest error: {}", msg),
            ManufactoryError::Io(err) => write!(f, "I/O error: {}", err),
            ManufactoryError::Load {
                manufacture,
                source,
            } => write!(f, "Manufacture {} failed to load: {}", manufacture, source),
            ManufactoryError::Admission(err) => write!(f, "Admission refused: {}", err),
            ManufactoryError::UnknownBuilding(id) => write!(f, "Unknown building: {}", id),
            ManufactoryError::UnknownManufacture(id) => {
                write!(f, "Unknown manufacture: {}", id)
            }
            ManufactoryError::NotAMiner(id) => write!(f, "Building {} is not a miner", id),
            ManufactoryError::Store(msg) => write!(f, "Store error: {}", msg),
            ManufactoryError::ShuttingDown => write!(f, "Hub is shutting down"),
            ManufactoryError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ManufactoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManufactoryError::Io(err) => Some(err),
            ManufactoryError::Load { source, .. } => Some(source),
            ManufactoryError::Admission(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ManufactoryError {
    fn from(err: io::Error) -> Self {
        ManufactoryError::Io(err)
    }
}

impl From<toml::de::Error> for ManufactoryError {
    fn from(err: toml::de::Error) -> Self {
        ManufactoryError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<FacilityError> for ManufactoryError {
    fn from(err: FacilityError) -> Self {
        ManufactoryError::Admission(err)
    }
}

impl From<anyhow::Error> for ManufactoryError {
    fn from(err: anyhow::Error) -> Self {
        ManufactoryError::Store(format!("{:#}", err))
    }
}
