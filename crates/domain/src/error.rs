/// Shared error type used across all backend-session crates.
///
/// The transient/permanent split drives retry policy: transient errors
/// (disconnects, spawn failures, timeouts, 5xx responses) are retried with
/// backoff by the supervisor; permanent errors (protocol violations, config
/// mistakes) surface to the caller unchanged.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("circuit open, retry in {cooldown_seconds:.0}s")]
    CircuitOpen { cooldown_seconds: f64 },

    #[error("app-server error{}: {message}", fmt_response_context(.method, .code))]
    Response {
        method: Option<String>,
        code: Option<i64>,
        message: String,
    },

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("spawn: {0}")]
    Spawn(String),

    #[error("config: {0}")]
    Config(String),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("{0}")]
    Other(String),
}

fn fmt_response_context(method: &Option<String>, code: &Option<i64>) -> String {
    match (method, code) {
        (Some(m), Some(c)) => format!(" ({m}, code {c})"),
        (Some(m), None) => format!(" ({m})"),
        (None, Some(c)) => format!(" (code {c})"),
        (None, None) => String::new(),
    }
}

impl Error {
    /// Whether this error is transient and worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Disconnected(_) | Error::Timeout(_) | Error::Spawn(_) => true,
            Error::Http(msg) => {
                // 5xx responses are transient; 4xx and connection-shape
                // failures without a status are treated as transient too
                // since the backend may simply not be up yet.
                !msg.contains("status 4")
            }
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Construct a disconnect error with the standard user-facing message.
    pub fn disconnected() -> Self {
        Error::Disconnected("app-server disconnected".into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
