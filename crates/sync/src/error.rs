use std::time::Duration;

use thiserror::Error;

use fleetlock_store::StoreError;

/// Errors raised by the coordination primitives themselves.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Invalid construction parameters. Raised before any store access.
    #[error("configuration error: {0}")]
    Config(String),

    /// A non-blocking lock attempt found the lock held elsewhere.
    #[error("lock {key} is held by another owner")]
    LockNotAcquired { key: String },

    /// A blocking lock attempt gave up after its timeout.
    #[error("timed out after {timeout:?} waiting for lock {key}")]
    LockAcquisitionTimeout { key: String, timeout: Duration },

    /// The lease expired or was taken over while the protected work ran.
    #[error("lock {key} was lost while held")]
    LockLost { key: String },

    /// A non-blocking scoped acquisition found every slot taken.
    #[error("semaphore {key} has no free slot (capacity {capacity})")]
    SemaphoreUnavailable { key: String, capacity: u32 },

    /// A blocking semaphore acquisition gave up after its timeout.
    #[error("timed out after {timeout:?} waiting for semaphore {key} (capacity {capacity})")]
    SemaphoreAcquisitionTimeout {
        key: String,
        capacity: u32,
        timeout: Duration,
    },

    /// Release without a matching acquire.
    #[error("semaphore {key} is not held by instance {instance_id}")]
    SemaphoreNotAcquired { key: String, instance_id: String },

    /// The slot expired or was pruned while the protected work ran.
    #[error("semaphore {key} was lost by instance {instance_id}")]
    SemaphoreLost { key: String, instance_id: String },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoordinationError {
    /// Returns `true` if ownership was lost mid-flight.
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::LockLost { .. } | Self::SemaphoreLost { .. })
    }

    /// Returns `true` for the expected, retryable acquisition failures.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(
            self,
            Self::LockNotAcquired { .. }
                | Self::LockAcquisitionTimeout { .. }
                | Self::SemaphoreUnavailable { .. }
                | Self::SemaphoreAcquisitionTimeout { .. }
        )
    }
}

/// Outcome of running an operation under a guard.
///
/// The protected operation's own error travels untouched in
/// [`GuardError::Operation`]; everything the guard itself raises is a
/// [`CoordinationError`].
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("guarded operation failed: {0}")]
    Operation(#[source] E),
}

impl<E> GuardError<E> {
    /// The coordination error, if the guard (not the operation) failed.
    pub fn coordination(&self) -> Option<&CoordinationError> {
        match self {
            Self::Coordination(e) => Some(e),
            Self::Operation(_) => None,
        }
    }

    /// The operation's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::Coordination(_) => None,
        }
    }

    pub fn is_lost(&self) -> bool {
        self.coordination().is_some_and(CoordinationError::is_lost)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Coordination(CoordinationError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn timeout_message_names_key_and_capacity() {
        let err = CoordinationError::SemaphoreAcquisitionTimeout {
            key: "gpu-pool".into(),
            capacity: 4,
            timeout: Duration::from_secs(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("gpu-pool"));
        assert!(msg.contains("capacity 4"));
    }

    #[test]
    fn classification() {
        assert!(CoordinationError::LockLost { key: "k".into() }.is_lost());
        assert!(
            CoordinationError::LockNotAcquired { key: "k".into() }.is_acquisition_failure()
        );
        assert!(!CoordinationError::Cancelled.is_acquisition_failure());
    }

    #[test]
    fn guard_error_keeps_operation_error() {
        let err: GuardError<Boom> = GuardError::Operation(Boom);
        assert!(err.coordination().is_none());
        assert!(err.into_operation().is_some());

        let err: GuardError<Boom> = CoordinationError::Cancelled.into();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "operation cancelled");
    }

    #[test]
    fn store_errors_convert() {
        let err: CoordinationError = StoreError::Connection("reset".into()).into();
        assert!(matches!(err, CoordinationError::Store(ref e) if e.is_connectivity()));
    }
}
