//! Unified error type.

use crate::adapter::State;

/// A boxed error produced by application code or a response body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by bridle's fallible operations.
///
/// Infrastructure failures (binding, accepting, a client going away) and
/// application failures (an `Err` or a panic out of the application call)
/// share this type, because both end up on the same reporting path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("no socket address for `{0}`")]
    Resolve(String),

    #[error("application failed: {0}")]
    Application(#[source] BoxError),

    #[error("application panicked: {0}")]
    Panic(String),

    #[error("invalid status `{0}`")]
    InvalidStatus(String),

    #[error("invalid response header `{0}`")]
    InvalidHeader(String),

    #[error("response body failed: {0}")]
    Body(#[source] BoxError),

    #[error("request body failed: {0}")]
    RequestBody(#[source] BoxError),

    #[error("client went away before the response finished")]
    Disconnected,

    #[error("`{event}` is not valid while the exchange is {state:?}")]
    State { event: &'static str, state: State },

    #[error("server thread stopped unexpectedly")]
    ServerThread,
}

impl Error {
    /// Builds an [`Error::Panic`] from the payload `catch_unwind` hands back.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self::Panic(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_keep_their_message() {
        let err = Error::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "application panicked: boom");

        let err = Error::from_panic(Box::new(String::from("kaput")));
        assert_eq!(err.to_string(), "application panicked: kaput");

        let err = Error::from_panic(Box::new(42_u8));
        assert_eq!(err.to_string(), "application panicked: non-string panic payload");
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "io: taken");
    }
}
