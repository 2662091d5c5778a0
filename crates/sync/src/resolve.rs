//! Per-call resolution of store handles and keys.
//!
//! A guard built once can protect a whole family of keys (one per job id,
//! say) by deriving the key from the arguments of each call, and can pick a
//! store per call as well.

use std::fmt;
use std::sync::Arc;

use fleetlock_store::CoordinationStore;

use crate::error::CoordinationError;

type KeyFn<A> = dyn Fn(&A) -> String + Send + Sync;
type StoreFn<A> = dyn Fn(&A) -> Arc<dyn CoordinationStore> + Send + Sync;

/// Where the key of a guarded call comes from.
pub enum KeySource<A> {
    /// The same key for every call.
    Fixed(String),
    /// A key computed from the call's arguments.
    Derived(Arc<KeyFn<A>>),
}

impl<A> KeySource<A> {
    pub fn fixed(key: impl Into<String>) -> Self {
        Self::Fixed(key.into())
    }

    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(f))
    }

    /// Reject an empty fixed key. Derived keys are checked per call.
    pub(crate) fn validate(&self) -> Result<(), CoordinationError> {
        match self {
            Self::Fixed(key) => non_empty(key),
            Self::Derived(_) => Ok(()),
        }
    }

    pub(crate) fn resolve(&self, args: &A) -> Result<String, CoordinationError> {
        let key = match self {
            Self::Fixed(key) => key.clone(),
            Self::Derived(f) => f(args),
        };
        non_empty(&key)?;
        Ok(key)
    }
}

fn non_empty(key: &str) -> Result<(), CoordinationError> {
    if key.is_empty() {
        return Err(CoordinationError::Config("key must not be empty".into()));
    }
    Ok(())
}

impl<A> Clone for KeySource<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(key) => Self::Fixed(key.clone()),
            Self::Derived(f) => Self::Derived(Arc::clone(f)),
        }
    }
}

impl<A> fmt::Debug for KeySource<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(key) => f.debug_tuple("Fixed").field(key).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

impl<A> From<&str> for KeySource<A> {
    fn from(key: &str) -> Self {
        Self::fixed(key)
    }
}

impl<A> From<String> for KeySource<A> {
    fn from(key: String) -> Self {
        Self::Fixed(key)
    }
}

/// Where the store handle of a guarded call comes from.
pub enum StoreSource<A> {
    /// One shared connection for every call.
    Shared(Arc<dyn CoordinationStore>),
    /// A store picked from the call's arguments.
    Resolver(Arc<StoreFn<A>>),
}

impl<A> StoreSource<A> {
    pub fn shared(store: Arc<dyn CoordinationStore>) -> Self {
        Self::Shared(store)
    }

    pub fn resolver<F>(f: F) -> Self
    where
        F: Fn(&A) -> Arc<dyn CoordinationStore> + Send + Sync + 'static,
    {
        Self::Resolver(Arc::new(f))
    }

    pub(crate) fn resolve(&self, args: &A) -> Arc<dyn CoordinationStore> {
        match self {
            Self::Shared(store) => Arc::clone(store),
            Self::Resolver(f) => f(args),
        }
    }
}

impl<A> Clone for StoreSource<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Shared(store) => Self::Shared(Arc::clone(store)),
            Self::Resolver(f) => Self::Resolver(Arc::clone(f)),
        }
    }
}

impl<A> fmt::Debug for StoreSource<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(_) => f.write_str("Shared(..)"),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_empty_key_fails_validation() {
        let source: KeySource<()> = KeySource::fixed("");
        assert!(matches!(
            source.validate(),
            Err(CoordinationError::Config(_))
        ));
    }

    #[test]
    fn derived_key_uses_arguments() {
        let source = KeySource::derived(|job: &(u32, String)| format!("job-{}-{}", job.0, job.1));
        assert!(source.validate().is_ok());
        assert_eq!(source.resolve(&(7, "eu".to_owned())).unwrap(), "job-7-eu");
    }

    #[test]
    fn derived_empty_key_fails_at_resolution() {
        let source = KeySource::derived(|name: &String| name.clone());
        assert!(source.validate().is_ok());
        assert!(matches!(
            source.resolve(&String::new()),
            Err(CoordinationError::Config(_))
        ));
    }
}
