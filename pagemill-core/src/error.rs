use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PagemillError {
    #[error("Invalid working directory: {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broken pipe: process {pid} has exited")]
    BrokenPipe { pid: u32 },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PagemillError>;
