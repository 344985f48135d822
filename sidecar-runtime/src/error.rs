use std::fmt;

/// Errors returned by sidecar operations.
///
/// Variants are split into two classes. Fatal errors abort startup (or the
/// process) and the host is expected to restart the sandbox. Recoverable
/// errors are absorbed where they happen: a failed poll is retried, a failed
/// signature becomes a structured 500 for that one request.
#[derive(Debug)]
pub enum SidecarError {
    /// Invalid or missing configuration.
    Config(String),
    /// Registration with the host lifecycle API failed.
    Registration(String),
    /// The loopback listener could not be bound.
    Bind(String),
    /// The loopback listener stopped while the sidecar was still polling.
    Listener(String),
    /// A lifecycle call after registration (`event/next`, `exit/error`) failed.
    Poll(String),
    /// Credential signing failed for a single request.
    Signing(String),
}

impl SidecarError {
    /// Whether the process can survive this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            SidecarError::Config(_)
            | SidecarError::Registration(_)
            | SidecarError::Bind(_)
            | SidecarError::Listener(_) => true,
            SidecarError::Poll(_) | SidecarError::Signing(_) => false,
        }
    }
}

impl fmt::Display for SidecarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidecarError::Config(msg) => write!(f, "config error: {msg}"),
            SidecarError::Registration(msg) => write!(f, "registration error: {msg}"),
            SidecarError::Bind(msg) => write!(f, "bind error: {msg}"),
            SidecarError::Listener(msg) => write!(f, "listener error: {msg}"),
            SidecarError::Poll(msg) => write!(f, "poll error: {msg}"),
            SidecarError::Signing(msg) => write!(f, "signing error: {msg}"),
        }
    }
}

impl std::error::Error for SidecarError {}

pub type Result<T> = std::result::Result<T, SidecarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SidecarError::Config("x".into()).is_fatal());
        assert!(SidecarError::Registration("x".into()).is_fatal());
        assert!(SidecarError::Bind("x".into()).is_fatal());
        assert!(SidecarError::Listener("x".into()).is_fatal());
        assert!(!SidecarError::Poll("x".into()).is_fatal());
        assert!(!SidecarError::Signing("x".into()).is_fatal());
    }

    #[test]
    fn display_prefixes_class() {
        let err = SidecarError::Registration("missing header".into());
        assert_eq!(err.to_string(), "registration error: missing header");
    }
}
