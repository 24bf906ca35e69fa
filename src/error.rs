//! Crate-wide error type.
//!
//! Generalizes the teacher's `ReplicationError` to cover both drivers: the
//! WAL driver's libpq/protocol failures and the trigger driver's SQL
//! codegen / channel-parse failures, behind one enum so the driver contract
//! (`Driver`) can return a single error type regardless of which driver is
//! in use.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Database connection failure (either driver's connection).
    #[error("connection error: {0}")]
    Connection(String),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A logical-replication frame could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A tuple referenced a relation-ID the driver has never seen a
    /// Relation message for. Per spec this is always a hard error.
    #[error("unknown relation id {0}")]
    UnknownRelation(u32),

    /// Trigger-driver SQL generation or channel-name parsing failure.
    #[error("trigger driver error: {0}")]
    Trigger(String),

    /// Buffer read/write ran past the end of the supplied slice.
    #[error("buffer error: {0}")]
    Buffer(String),

    #[error("string conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    #[error("postgres client error")]
    TokioPostgres(#[from] tokio_postgres::Error),

    #[error("json error")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn trigger<S: Into<String>>(message: S) -> Self {
        Self::Trigger(message.into())
    }

    pub fn buffer<S: Into<String>>(message: S) -> Self {
        Self::Buffer(message.into())
    }
}
