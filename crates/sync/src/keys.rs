/// Renders the store keys used by locks and semaphores.
///
/// The layout is the only state other replicas (and operators) observe:
///
/// - `prefix:lock:{name}`: exclusive lease, value = lock value.
/// - `prefix:lock:{name}:owner`: owner token of the current acquisition.
/// - `prefix:semaphore:{name}`: sorted set of instance ids scored by expiry.
/// - `prefix:semaphore:{name}:holders:{instance_id}`: per-holder metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("fleetlock")
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.prefix)
    }

    /// Fence key holding the token of whichever run currently owns `name`.
    pub fn lock_owner(&self, name: &str) -> String {
        format!("{}:lock:{name}:owner", self.prefix)
    }

    pub fn semaphore(&self, name: &str) -> String {
        format!("{}:semaphore:{name}", self.prefix)
    }

    pub fn semaphore_holder(&self, name: &str, instance_id: &str) -> String {
        format!("{}:semaphore:{name}:holders:{instance_id}", self.prefix)
    }
}
