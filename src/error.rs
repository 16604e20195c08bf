//! Error types for strata
//!
//! All modules use `StrataResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// Coarse classification of a failure, used by callers that need to tell
/// user mistakes apart from infrastructure trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The build is not in a state where the operation makes sense
    Precondition,
    /// The cache could not be consulted
    CacheProbe,
    /// The container or store collaborator failed
    Collaborator,
    /// A `--chown` override could not be resolved
    Ownership,
    /// Malformed user input at the runtime-spec boundary
    InvalidParameter,
    /// I/O, serialization and other infrastructure failures
    System,
}

/// All errors that can occur in strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Build preconditions
    #[error("Please provide a source image with `from` prior to commit")]
    NoBaseImage,

    #[error("{0}")]
    Precondition(String),

    // Step context
    #[error("{instruction}: {source}")]
    Step {
        instruction: String,
        #[source]
        source: Box<StrataError>,
    },

    // Cache errors
    #[error("cache probe failed for parent {parent}: {source}")]
    CacheProbe {
        parent: String,
        #[source]
        source: Box<StrataError>,
    },

    // Container errors
    #[error("Container create failed: {0}")]
    ContainerCreate(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("The command '{command}' returned a non-zero code: {code}")]
    ContainerCommand { command: String, code: i32 },

    #[error("Failed to commit container {container}: {reason}")]
    Commit { container: String, reason: String },

    // Image and layer errors
    #[error("failed to export image: {source}")]
    ExportImage {
        #[source]
        source: Box<StrataError>,
    },

    #[error("failed to encode image config: {0}")]
    EncodeImageConfig(#[source] serde_json::Error),

    #[error("failed to get destination image {image:?}: {source}")]
    DestinationImage {
        image: String,
        #[source]
        source: Box<StrataError>,
    },

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Corrupt store entry {path}: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    // Copy errors
    #[error("failed to copy files: {source}")]
    CopyFailed {
        #[source]
        source: Box<StrataError>,
    },

    #[error("invalid {instruction}: {reason}")]
    InvalidDestination { instruction: String, reason: String },

    #[error("Copy source not found in build context: {0}")]
    SourceNotFound(String),

    #[error("{message}: {reason}")]
    Ownership {
        message: &'static str,
        reason: String,
    },

    // Runtime-spec boundary
    #[error("{0}")]
    InvalidParameter(String),

    #[error("{0}")]
    System(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration already exists at {0}")]
    ConfigExists(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid build plan {path}: {reason}")]
    PlanInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Wrap an error with the instruction that was executing
    pub fn in_step(self, instruction: impl Into<String>) -> Self {
        Self::Step {
            instruction: instruction.into(),
            source: Box::new(self),
        }
    }

    /// Classify the error, looking through step context wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoBaseImage | Self::Precondition(_) => ErrorKind::Precondition,
            Self::Step { source, .. } => source.kind(),
            Self::CacheProbe { .. } => ErrorKind::CacheProbe,
            Self::ContainerCreate(_)
            | Self::ContainerNotFound(_)
            | Self::ContainerCommand { .. }
            | Self::Commit { .. }
            | Self::ExportImage { .. }
            | Self::DestinationImage { .. }
            | Self::ImageNotFound(_)
            | Self::LayerNotFound(_)
            | Self::CopyFailed { .. } => ErrorKind::Collaborator,
            Self::Ownership { .. } => ErrorKind::Ownership,
            Self::InvalidParameter(_)
            | Self::InvalidDestination { .. }
            | Self::SourceNotFound(_)
            | Self::PlanInvalid { .. }
            | Self::ConfigInvalid { .. } => ErrorKind::InvalidParameter,
            _ => ErrorKind::System,
        }
    }

    /// Whether the error was caused by malformed user input
    pub fn is_invalid_parameter(&self) -> bool {
        self.kind() == ErrorKind::InvalidParameter
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Step { source, .. } => source.hint(),
            Self::NoBaseImage => Some("Start the plan with a `from` instruction"),
            Self::ImageNotFound(_) => Some("Run: strata images, or import a base with: strata import"),
            Self::CommandFailed { .. } => Some("Is podman installed and on PATH?"),
            Self::UnsupportedPlatform(_) => Some("Build containers need a Linux host with podman"),
            Self::ConfigExists(_) => Some("Use --force to overwrite"),
            Self::ConfigInvalid { .. } => Some("Run: strata config init --force, to start from defaults"),
            _ => None,
        }
    }
}
