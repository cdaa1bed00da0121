//! Error types for the fixture harness.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::command::Phase;
use crate::socket::{Role, Transport};

/// Fixture harness errors.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// The per-command config directory could not be created.
    #[error("failed to create config dir for {name}: {source}")]
    TempDir {
        name: String,
        #[source]
        source: io::Error,
    },

    /// An option passed to [`Command::new`](crate::Command::new) failed.
    #[error("error applying option {index}: {source}")]
    Option {
        /// Position of the failing option in the list.
        index: usize,
        #[source]
        source: Box<FixtureError>,
    },

    /// A deferred config file writer failed.
    #[error("error writing config file {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// The probe listener for a socket reservation could not be bound.
    #[error("failed to reserve {role} socket on {transport} {addr}: {source}")]
    Reserve {
        role: Role,
        transport: Transport,
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Key or certificate generation failed.
    #[error("failed to provision credential {name}: {source}")]
    Provisioning {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The external process could not be launched.
    #[error("failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A reserved socket never accepted a connection.
    #[error(
        "timed out waiting on {role} socket {addr} after {attempts} attempts; last error: {last_error}"
    )]
    SocketTimeout {
        role: Role,
        addr: String,
        attempts: u32,
        last_error: String,
    },

    /// A deferred post-start action failed.
    #[error("post-start action {index} failed: {source}")]
    PostStart {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A shutdown action failed.
    #[error("shutdown action {index} failed: {source}")]
    Shutdown {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Waiting for the process to exit failed. The config dir is kept.
    #[error("failed waiting for {name} to exit: {source}")]
    ExitWait {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The config dir could not be removed after the process exited.
    #[error("failed to remove config dir {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A socket was requested for a role that was never reserved.
    #[error("{role} socket not configured, please configure a {role} listener")]
    NotConfigured { role: Role },

    /// Dialing a reserved socket failed.
    #[error("error dialing {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A lifecycle method was called in the wrong phase.
    #[error("cannot {action} {name} while {phase}")]
    InvalidState {
        name: String,
        action: &'static str,
        phase: Phase,
    },

    /// Error raised by collaborator code inside an option.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`FixtureError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An option or config file writer failed; no process was started.
    Configuration,
    /// Key or certificate generation failed.
    Provisioning,
    /// The process did not launch or its sockets never came up.
    Startup,
    /// The shutdown chain failed; the process was still reaped.
    Shutdown,
    /// The OS wait failed; the config dir was kept for inspection.
    ExitWait,
    /// The harness was used incorrectly.
    Usage,
}

impl FixtureError {
    /// Classify this error, looking through option wrappers to the root cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Option { source, .. } => match source.kind() {
                ErrorKind::Provisioning => ErrorKind::Provisioning,
                _ => ErrorKind::Configuration,
            },
            Self::Provisioning { .. } => ErrorKind::Provisioning,
            Self::TempDir { .. }
            | Self::ConfigFile { .. }
            | Self::Reserve { .. }
            | Self::Other(_) => ErrorKind::Configuration,
            Self::Spawn { .. } | Self::SocketTimeout { .. } | Self::PostStart { .. } => {
                ErrorKind::Startup
            }
            Self::Shutdown { .. } => ErrorKind::Shutdown,
            Self::ExitWait { .. } | Self::Cleanup { .. } => ErrorKind::ExitWait,
            Self::NotConfigured { .. } | Self::Dial { .. } | Self::InvalidState { .. } => {
                ErrorKind::Usage
            }
        }
    }

    /// Whether the error should stop the enclosing test.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Shutdown
    }

    /// Create an error from collaborator code.
    pub fn other(msg: impl std::fmt::Display) -> Self {
        Self::Other(anyhow::anyhow!("{msg}"))
    }
}
