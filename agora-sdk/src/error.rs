//! Errors returned by the SDK surface.

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport-level HTTP failure (connect, DNS, body read).
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The session is unrecoverable; the caller must sign in again.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The chat connection is not open. Transient: the connection may be
    /// mid-reconnect; retry after the next [`StreamEvent::Open`].
    ///
    /// [`StreamEvent::Open`]: crate::event::StreamEvent::Open
    #[error("not connected")]
    NotConnected,

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}
