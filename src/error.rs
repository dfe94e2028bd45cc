use thiserror::Error;

use crate::opcode::{Abi, PointerWidth};

/// Failures of the register access layer.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The running architecture has no identification instruction
    #[error("identification instructions are not available on {0}")]
    UnsupportedArchitecture(&'static str),

    /// No machine-code stub for this pointer width / calling convention
    #[error("no machine-code stub for {width:?} / {abi:?}")]
    NoStub { width: PointerWidth, abi: Abi },

    /// The OS refused to hand out executable memory
    #[error("failed to allocate executable memory: {0}")]
    Allocation(String),
}

/// Phase of a driver run, used for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PerProcessor,
    PerCore,
    PostUpdate,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::PerProcessor => write!(f, "per-processor"),
            Phase::PerCore => write!(f, "per-core"),
            Phase::PostUpdate => write!(f, "post-update"),
        }
    }
}

/// Failures raised by probe drivers.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Required instruction or OS facility is missing
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Topology leaves returned degenerate or contradictory values
    #[error("inconsistent topology: {0}")]
    InconsistentTopology(String),

    /// A platform source could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A per-core task panicked or was cancelled
    #[error("per-core task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A driver hook panicked on the orchestrating task
    #[error("driver panicked: {0}")]
    Panicked(String),

    /// Wrapped failure with driver and phase context
    #[error("driver {driver} failed during {phase}: {source}")]
    Driver {
        driver: &'static str,
        phase: Phase,
        #[source]
        source: Box<ProbeError>,
    },
}

impl ProbeError {
    pub fn in_driver(self, driver: &'static str, phase: Phase) -> Self {
        ProbeError::Driver {
            driver,
            phase,
            source: Box::new(self),
        }
    }
}

/// Failures loading discovery options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the options schema
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Failed to write config file
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration value
    #[error("invalid configuration: {key} = {value} - {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
