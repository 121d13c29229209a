//! Error taxonomy shared by the host, the client and the verbs

use std::time::Duration;
use thiserror::Error;

/// Raised by the sandbox resolver when a path would leave the shared root.
///
/// Deliberately carries no path: the offending absolute location must never
/// end up in a log line or an error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("path escapes the shared directory")]
pub struct PathEscapeError;

#[derive(Debug, Error)]
pub enum CtError {
    #[error("path escapes the shared directory")]
    PathEscape,

    #[error("wrong token or password")]
    Unauthorized,

    #[error("operation not permitted on this host")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("host replied HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("not connected to any CT host")]
    NotConnected,

    #[error("cancelled")]
    Cancelled,

    #[error("local file not found: {}", .0.display())]
    LocalNotFound(std::path::PathBuf),

    #[error("clipboard is empty")]
    EmptyClipboard,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed data: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T, E = CtError> = std::result::Result<T, E>;

impl From<PathEscapeError> for CtError {
    fn from(_: PathEscapeError) -> Self {
        CtError::PathEscape
    }
}

impl CtError {
    /// Only dropped or refused connections are worth retrying; everything the
    /// host answered deliberately is terminal for the invocation.
    pub fn is_transient(&self) -> bool {
        matches!(self, CtError::Connection(_))
    }

    /// Map a host status code (and its text body) back into the taxonomy.
    pub fn from_status(status: u16, what: &str, body: String) -> Self {
        match status {
            401 => CtError::Unauthorized,
            403 => CtError::Forbidden,
            404 => CtError::NotFound(what.to_string()),
            409 => CtError::Conflict(what.to_string()),
            400 => CtError::BadRequest(body),
            _ => CtError::Remote {
                status,
                message: body,
            },
        }
    }

    /// Human diagnosis printed by the client verbs.
    pub fn diagnose(&self) -> String {
        match self {
            CtError::Unauthorized => {
                "❌ Authentication failed: wrong token or password. Run `ct join` again.".into()
            }
            CtError::Forbidden => {
                "⛔ Forbidden: the host is read-only or the path is outside the share.".into()
            }
            CtError::PathEscape => "⛔ Path escapes the shared directory.".into(),
            CtError::NotFound(what) => format!("❌ Not found on remote host: {what}"),
            CtError::Conflict(what) => format!("⚠️  Already exists: {what}"),
            CtError::NotConnected => {
                "⚠️  No active CT session. Run `ct join` first.".into()
            }
            CtError::Connection(msg) => format!("❌ Connection error: {msg}"),
            CtError::Timeout(d) => format!("⏱️  Host did not answer within {}s.", d.as_secs()),
            CtError::Cancelled => "❌ Cancelled.".into(),
            CtError::LocalNotFound(p) => format!("❌ Local file not found: {}", p.display()),
            CtError::EmptyClipboard => "📋 No file in CT clipboard. Use `ct cp` first.".into(),
            other => format!("❌ {other}"),
        }
    }
}
