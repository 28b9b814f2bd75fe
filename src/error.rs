use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("invalid form id: {0}")]
    InvalidFormId(String),

    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),

    #[error("missing config file formcat.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("catalog request failed: {0}")]
    Network(String),

    #[error("catalog server rejected credentials (status {status})")]
    #[diagnostic(help("check username and password in formcat.json"))]
    Auth { status: u16 },

    #[error("catalog server returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed content: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to start background task: {0}")]
    TaskSpawn(String),
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::Network(_) | CatalogError::Status { .. } => ErrorKind::Network,
            CatalogError::Auth { .. } => ErrorKind::Auth,
            CatalogError::Parse(_) | CatalogError::InvalidFormId(_) => ErrorKind::Parse,
            CatalogError::Storage(_) | CatalogError::TaskSpawn(_) => ErrorKind::Storage,
            CatalogError::InvalidServerUrl(_)
            | CatalogError::MissingConfig
            | CatalogError::ConfigRead(_)
            | CatalogError::ConfigParse(_) => ErrorKind::Config,
        }
    }
}

/// Coarse classification used when failures are aggregated into results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Storage,
    Network,
    Auth,
    Parse,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::Config => write!(f, "config"),
        }
    }
}
