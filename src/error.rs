use std::time::Duration;

/// Semantic error kinds exchanged between the executor, actions, and the
/// resource managers. The kind decides how a failure surfaces: actions fail
/// the running instance, dispatch-level errors propagate to the bus as a
/// requeue signal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A missing action, unknown data-source type, absent required
    /// parameter, or a task list that contradicts its own `depend_on`.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catalog miss, data-source miss, instance miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// A data source or bus endpoint could not be established or probed.
    #[error("connection error: {0}")]
    Connection(String),

    /// HTTP status >= 400 or an explicit rejection from a remote endpoint.
    #[error("remote endpoint error: {0}")]
    Remote(String),

    /// Driver-reported failure during a query or exec.
    #[error("datasource error: {0}")]
    Datasource(String),

    /// Embedded-script evaluation fault.
    #[error("script error: {0}")]
    Script(String),

    /// A task attempt overran its configured deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The enclosing context was cancelled during an attempt or between
    /// retries.
    #[error("cancelled")]
    Cancelled,

    /// Invariant breach; should not occur.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Datasource(e.to_string())
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(e: mongodb::error::Error) -> Self {
        Error::Datasource(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Remote(e.to_string())
    }
}

impl From<mlua::Error> for Error {
    fn from(e: mlua::Error) -> Self {
        Error::Script(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
