use thiserror::Error;

/// Failures inside the event store. Handler code maps these onto
/// `OK(id, false, "error: …")` frames; they never tear down a connection.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Malformed client frames. Surfaced as a `NOTICE`, after which the
/// connection keeps going.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message must be a JSON array")]
    NotAnArray,

    #[error("message array is empty")]
    EmptyArray,

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("{verb} message has a bad shape: {detail}")]
    BadShape {
        verb: &'static str,
        detail: String,
    },

    #[error("binary frames are not accepted")]
    BinaryFrame,
}

/// Fatal startup failures. The process exits non-zero on any of these.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to open database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to bind listen socket: {0}")]
    Bind(#[from] std::io::Error),
}
