//! Thread-scoped ledger of the containers the current unit of work owns.
//!
//! Sessions form a stack per thread. [`Session::open`] starts the root frame,
//! [`Session::open_nested`] pushes a child frame and every frame is closed by its
//! [`SessionGuard`]. Lookups fall through to parent frames unless the frame is isolated.
//!
//! The ledger is what keeps a request from deadlocking against itself: a container borrowed for
//! exclusive write stays registered here, so later reads of the same key within the session are
//! served from the entry instead of borrowing from the pool again.

use crate::container::Container;
use crate::error::{StoreError, StoreResult};
use crate::key::AccessKey;
use crate::mode::AccessMode;
use crate::pool::PooledHolder;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug)]
struct Frame {
    id: SessionId,
    isolated: bool,
    entries: HashMap<AccessKey, ManagedEntry>,
}

#[derive(Debug)]
pub(crate) struct ManagedEntry {
    pub(crate) mode: AccessMode,
    pub(crate) container: Container,
    pub(crate) read_count: u32,
    pub(crate) write_count: u32,
    release_on_close: bool,
    pub(crate) lease: Option<PooledHolder>,
}

impl ManagedEntry {
    fn view(&self, key: &AccessKey, session: SessionId) -> ManagedEntryView {
        ManagedEntryView {
            key: key.clone(),
            mode: self.mode,
            container: self.container.clone(),
            read_count: self.read_count,
            write_count: self.write_count,
            release_on_close: self.release_on_close,
            session,
        }
    }
}

/// Snapshot of a session entry.
#[derive(Debug, Clone)]
pub struct ManagedEntryView {
    pub key: AccessKey,
    pub mode: AccessMode,
    pub container: Container,
    pub read_count: u32,
    pub write_count: u32,
    /// Whether closing the session hands the container back to the exclusive access pool.
    pub release_on_close: bool,
    /// The frame holding the entry.
    pub session: SessionId,
}

/// A container removed from a session so it can be handed to another thread.
///
/// Any pool reservation travels with it. Dropping it releases the reservation.
#[derive(Debug)]
pub struct OwnedContainer {
    key: AccessKey,
    mode: AccessMode,
    container: Container,
    lease: Option<PooledHolder>,
}

impl OwnedContainer {
    pub const fn key(&self) -> &AccessKey {
        &self.key
    }

    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    pub const fn container(&self) -> &Container {
        &self.container
    }
}

/// Entry points of the thread-local session stack.
#[derive(Debug)]
pub struct Session;

impl Session {
    /// Opens the root session of the current thread.
    ///
    /// # Errors
    /// Returns [`StoreError::SessionAlreadyActive`] if the thread already has a session.
    pub fn open() -> StoreResult<SessionGuard> {
        STACK.with_borrow_mut(|stack| {
            if !stack.is_empty() {
                return Err(StoreError::SessionAlreadyActive);
            }
            Ok(Self::push(stack, false))
        })
    }

    /// Pushes a child session. Isolated children do not see their parents' entries.
    pub fn open_nested(isolated: bool) -> SessionGuard {
        STACK.with_borrow_mut(|stack| Self::push(stack, isolated))
    }

    fn push(stack: &mut Vec<Frame>, isolated: bool) -> SessionGuard {
        let id = SessionId::next();
        stack.push(Frame { id, isolated, entries: HashMap::new() });
        trace!(session = %id, isolated, depth = stack.len(), "Session opened");
        SessionGuard { id, closed: false, _thread_bound: PhantomData }
    }

    pub fn current() -> StoreResult<SessionId> {
        STACK.with_borrow(|stack| stack.last().map(|f| f.id).ok_or(StoreError::NoActiveSession))
    }

    pub fn is_active() -> bool {
        STACK.with_borrow(|stack| !stack.is_empty())
    }

    /// Number of open frames on this thread.
    pub fn depth() -> usize {
        STACK.with_borrow(Vec::len)
    }

    /// Registers `container` in the current frame, replacing any entry for its key.
    pub fn add(
        key: AccessKey,
        mode: AccessMode,
        container: Container,
    ) -> StoreResult<ManagedEntryView> {
        Self::add_leased(key, mode, container, None)
    }

    /// Like [`Session::add`], additionally handing a pool reservation to the entry.
    ///
    /// When the replaced entry held a reservation and the new one brings none, the reservation
    /// carries over so the pool slot stays taken until the session closes.
    pub(crate) fn add_leased(
        key: AccessKey,
        mode: AccessMode,
        container: Container,
        lease: Option<PooledHolder>,
    ) -> StoreResult<ManagedEntryView> {
        let (view, replaced) = STACK.with_borrow_mut(|stack| {
            let frame = stack.last_mut().ok_or(StoreError::NoActiveSession)?;
            let mut entry = ManagedEntry {
                mode,
                container,
                read_count: 0,
                write_count: 0,
                release_on_close: false,
                lease,
            };

            let mut replaced = frame.entries.remove(&key);
            if entry.lease.is_none() {
                entry.lease = replaced.as_mut().and_then(|old| old.lease.take());
            }
            entry.release_on_close = entry.lease.is_some();

            let view = entry.view(&key, frame.id);
            frame.entries.insert(key, entry);
            Ok::<_, StoreError>((view, replaced))
        })?;

        if let Some(old) = replaced {
            trace!(key = %view.key, from = %old.mode, to = %view.mode, "Session entry replaced");
        }
        Ok(view)
    }

    /// Looks `key` up in the current frame, then in parent frames up to the first isolated one.
    pub fn managed_entry(key: &AccessKey) -> Option<ManagedEntryView> {
        STACK.with_borrow(|stack| {
            for frame in stack.iter().rev() {
                if let Some(entry) = frame.entries.get(key) {
                    return Some(entry.view(key, frame.id));
                }
                if frame.isolated {
                    break;
                }
            }
            None
        })
    }

    /// Runs `f` on the visible entry for `key`. `f` must not touch the session stack.
    pub(crate) fn update_entry<R>(
        key: &AccessKey,
        f: impl FnOnce(&mut ManagedEntry) -> R,
    ) -> Option<R> {
        STACK.with_borrow_mut(|stack| {
            for frame in stack.iter_mut().rev() {
                if let Some(entry) = frame.entries.get_mut(key) {
                    return Some(f(entry));
                }
                if frame.isolated {
                    break;
                }
            }
            None
        })
    }

    /// Fails unless this exact container instance is held for exclusive write.
    pub fn assert_writable(container: &Container) -> StoreResult<()> {
        if !Self::is_active() {
            return Err(StoreError::NoActiveSession);
        }
        let key = container.key();
        match Self::managed_entry(key) {
            Some(entry)
                if entry.mode == AccessMode::ExclusiveWrite
                    && entry.container.same_instance(container) =>
            {
                Ok(())
            },
            Some(entry) if entry.mode != AccessMode::ExclusiveWrite => {
                Err(StoreError::WriteNotPermitted {
                    key: key.clone(),
                    reason: format!("held as {}", entry.mode).into(),
                })
            },
            Some(_) => Err(StoreError::WriteNotPermitted {
                key: key.clone(),
                reason: "a different instance is held for this key".into(),
            }),
            None => Err(StoreError::WriteNotPermitted {
                key: key.clone(),
                reason: "not held by the current session".into(),
            }),
        }
    }

    /// Drops the visible entry for `key`, releasing its pool reservation.
    pub fn remove(key: &AccessKey) -> bool {
        Self::take(key).is_some()
    }

    pub(crate) fn take(key: &AccessKey) -> Option<ManagedEntry> {
        STACK.with_borrow_mut(|stack| {
            for frame in stack.iter_mut().rev() {
                if let Some(entry) = frame.entries.remove(key) {
                    return Some(entry);
                }
                if frame.isolated {
                    break;
                }
            }
            None
        })
    }

    pub fn contains(key: &AccessKey) -> bool {
        Self::managed_entry(key).is_some()
    }

    /// Removes the entry for `key` from the session so it can move to another thread.
    pub fn detach(key: &AccessKey) -> StoreResult<OwnedContainer> {
        if !Self::is_active() {
            return Err(StoreError::NoActiveSession);
        }
        let entry = Self::take(key).ok_or_else(|| StoreError::InvalidArgument {
            message: format!("{key} is not held by the current session").into(),
            context: Some("Detaching container".into()),
        })?;
        debug!(%key, mode = %entry.mode, "Container detached from session");
        Ok(OwnedContainer {
            key: key.clone(),
            mode: entry.mode,
            container: entry.container,
            lease: entry.lease,
        })
    }

    /// Registers a detached container in the current frame of this thread.
    pub fn adopt(owned: OwnedContainer) -> StoreResult<ManagedEntryView> {
        let OwnedContainer { key, mode, container, lease } = owned;
        debug!(%key, %mode, "Container adopted by session");
        Self::add_leased(key, mode, container, lease)
    }
}

/// Closes its session when dropped. Bound to the thread that opened it.
#[must_use = "Dropping the guard closes the session immediately"]
#[derive(Debug)]
pub struct SessionGuard {
    id: SessionId,
    closed: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl SessionGuard {
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Closes the session, handing leased containers back to the pool.
    ///
    /// # Errors
    /// Returns [`StoreError::SessionNotCurrent`] if a nested session opened after this one is
    /// still open. The frame then stays on the stack.
    pub fn close(mut self) -> StoreResult<()> {
        self.closed = true;
        self.pop()
    }

    fn pop(&self) -> StoreResult<()> {
        let frame = STACK.with_borrow_mut(|stack| match stack.last() {
            Some(top) if top.id == self.id => Ok(stack.pop()),
            other => Err(StoreError::SessionNotCurrent {
                session: self.id,
                current: other.map(|f| f.id),
            }),
        })?;

        if let Some(frame) = frame {
            let released = frame.entries.values().filter(|e| e.release_on_close).count();
            trace!(session = %self.id, entries = frame.entries.len(), released, "Session closed");
        }
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.pop()
        {
            error!(session = %self.id, error = %e, "Session guard dropped out of order");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerData;

    fn key() -> AccessKey {
        AccessKey::document(1, 9, "grace")
    }

    fn container() -> Container {
        Container::new(key(), ContainerData::new(1, b"c".to_vec()))
    }

    #[test]
    fn test_root_session_is_unique_per_thread() {
        assert!(matches!(Session::current(), Err(StoreError::NoActiveSession)));
        let guard = Session::open().unwrap();
        assert_eq!(Session::current().unwrap(), guard.id());
        assert!(matches!(Session::open(), Err(StoreError::SessionAlreadyActive)));
        guard.close().unwrap();
        assert!(!Session::is_active());
    }

    #[test]
    fn test_nested_lookup_respects_isolation() {
        let _root = Session::open().unwrap();
        Session::add(key(), AccessMode::ExclusiveWrite, container()).unwrap();

        {
            let _child = Session::open_nested(false);
            assert!(Session::contains(&key()));
            assert_eq!(Session::depth(), 2);
        }
        {
            let _isolated = Session::open_nested(true);
            assert!(!Session::contains(&key()));
        }
        assert_eq!(Session::depth(), 1);
    }

    #[test]
    fn test_out_of_order_close_is_rejected() {
        let root = Session::open().unwrap();
        let child = Session::open_nested(false);
        let child_id = child.id();

        let err = root.close().unwrap_err();
        assert!(matches!(
            err,
            StoreError::SessionNotCurrent { current: Some(current), .. } if current == child_id
        ));

        child.close().unwrap();
        assert_eq!(Session::depth(), 1);
        // The root frame was left behind by the rejected close.
        STACK.with_borrow_mut(Vec::clear);
    }

    #[test]
    fn test_assert_writable_requires_exact_exclusive_instance() {
        let _root = Session::open().unwrap();
        let held = container();
        Session::add(key(), AccessMode::SharedReadOnly, held.clone()).unwrap();
        assert!(matches!(
            Session::assert_writable(&held),
            Err(StoreError::WriteNotPermitted { .. })
        ));

        Session::add(key(), AccessMode::ExclusiveWrite, held.clone()).unwrap();
        Session::assert_writable(&held).unwrap();
        assert!(Session::assert_writable(&container()).is_err());
    }

    #[test]
    fn test_entries_are_replaced_not_duplicated() {
        let _root = Session::open().unwrap();
        Session::add(key(), AccessMode::SharedReadOnly, container()).unwrap();
        Session::update_entry(&key(), |e| e.read_count += 1);
        let view = Session::add(key(), AccessMode::ExclusiveWrite, container()).unwrap();

        assert_eq!(view.mode, AccessMode::ExclusiveWrite);
        assert_eq!(view.read_count, 0);
        assert!(Session::remove(&key()));
        assert!(!Session::remove(&key()));
    }

    #[test]
    fn test_detach_and_adopt_across_threads() {
        let _root = Session::open().unwrap();
        let held = container();
        Session::add(key(), AccessMode::ExclusiveWrite, held.clone()).unwrap();
        let owned = Session::detach(&key()).unwrap();
        assert!(!Session::contains(&key()));

        let adopted_id = std::thread::spawn(move || {
            let _session = Session::open().unwrap();
            let view = Session::adopt(owned).unwrap();
            Session::assert_writable(&view.container).unwrap();
            view.container.id()
        })
        .join()
        .unwrap();

        assert_eq!(adopted_id, held.id());
    }
}
