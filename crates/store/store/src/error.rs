use thiserror::Error;

/// Errors surfaced by a [`CoordinationStore`](crate::CoordinationStore).
///
/// Connectivity failures are kept apart from logical failures so callers can
/// decide whether a fault is worth retrying or must fail loudly.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns `true` if the error means the store could not be reached.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns `true` if a server-side script could not be evaluated.
    pub fn is_script(&self) -> bool {
        matches!(self, Self::Script(_))
    }
}
