use crate::container::Container;
use crate::key::AccessKey;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flags of a holder that outlive moves of the holder itself.
///
/// The pool keeps a clone while the holder is borrowed so deletions and type-system changes
/// can reach it; the diagnostic registry keeps a weak reference.
#[derive(Debug)]
pub(crate) struct HolderState {
    key: AccessKey,
    deleted: AtomicBool,
    schema_outdated: AtomicBool,
}

impl HolderState {
    pub(crate) const fn key(&self) -> &AccessKey {
        &self.key
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub(crate) fn mark_schema_outdated(&self) {
        self.schema_outdated.store(true, Ordering::Release);
    }
}

/// Owns zero or one live container for a key, plus the flags deciding whether it may be reused.
#[derive(Debug, Clone)]
pub struct ContainerHolder {
    container: Option<Container>,
    state: Arc<HolderState>,
    failure: Option<String>,
}

impl ContainerHolder {
    /// Creates an empty holder. The container is loaded lazily by the first borrower.
    pub(crate) fn new(key: AccessKey) -> Self {
        Self {
            container: None,
            state: Arc::new(HolderState {
                key,
                deleted: AtomicBool::new(false),
                schema_outdated: AtomicBool::new(false),
            }),
            failure: None,
        }
    }

    pub(crate) fn with_container(key: AccessKey, container: Container) -> Self {
        let mut holder = Self::new(key);
        holder.container = Some(container);
        holder
    }

    pub fn key(&self) -> &AccessKey {
        &self.state.key
    }

    pub const fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.deleted.load(Ordering::Acquire)
    }

    pub fn is_schema_outdated(&self) -> bool {
        self.state.schema_outdated.load(Ordering::Acquire)
    }

    /// Description of the last failed load, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Whether the holder may be kept for the next borrower.
    pub fn is_valid(&self) -> bool {
        self.container.is_some() && !self.is_deleted() && !self.is_schema_outdated()
    }

    /// The reason [`ContainerHolder::is_valid`] is false, for logging.
    pub(crate) fn invalid_reason(&self) -> Option<&'static str> {
        if self.is_deleted() {
            Some("deleted")
        } else if self.is_schema_outdated() {
            Some("schema outdated")
        } else if self.failure.is_some() {
            Some("load failed")
        } else if self.container.is_none() {
            Some("never loaded")
        } else {
            None
        }
    }

    pub(crate) fn set_container(&mut self, container: Container) -> Option<Container> {
        self.failure = None;
        self.container.replace(container)
    }

    pub(crate) fn record_failure(&mut self, failure: impl Into<String>) {
        self.container = None;
        self.failure = Some(failure.into());
    }

    /// Forgets the container so the next borrower reloads it from durable storage.
    pub(crate) fn reset(&mut self) {
        self.container = None;
        self.failure = None;
    }

    /// Moves the content out, leaving an empty holder that shares the same flags.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            container: self.container.take(),
            state: Arc::clone(&self.state),
            failure: self.failure.take(),
        }
    }

    pub(crate) fn mark_deleted(&self) {
        self.state.mark_deleted();
    }

    pub(crate) fn state(&self) -> &Arc<HolderState> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerData;

    fn key() -> AccessKey {
        AccessKey::document(3, 7, "dave")
    }

    #[test]
    fn test_fresh_holder_is_not_reusable() {
        let holder = ContainerHolder::new(key());
        assert!(holder.is_empty());
        assert!(!holder.is_valid());
        assert_eq!(holder.invalid_reason(), Some("never loaded"));
    }

    #[test]
    fn test_flags_invalidate_loaded_holder() {
        let mut holder = ContainerHolder::new(key());
        holder.set_container(Container::new(key(), ContainerData::default()));
        assert!(holder.is_valid());

        let clone = holder.clone();
        clone.state().mark_schema_outdated();
        assert!(!holder.is_valid());
        assert_eq!(holder.invalid_reason(), Some("schema outdated"));

        holder.mark_deleted();
        assert_eq!(holder.invalid_reason(), Some("deleted"));
    }

    #[test]
    fn test_failure_clears_container() {
        let mut holder = ContainerHolder::with_container(
            key(),
            Container::new(key(), ContainerData::default()),
        );
        holder.record_failure("decode failed");
        assert!(holder.is_empty());
        assert_eq!(holder.failure(), Some("decode failed"));

        holder.reset();
        assert!(holder.failure().is_none());
    }
}
