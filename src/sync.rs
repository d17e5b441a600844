//! The torrent lock and its condition variable.
//!
//! One writer lock guards all mutable torrent state. Code holding it in
//! deferrable mode may schedule actions that run exactly once when the lock
//! is released, which is how burst triggers (request updates, writer wakes)
//! are coalesced without re-entering the lock. A raw mode bypasses the
//! deferral machinery; it is used around I/O, by [`Event::wait`], and in
//! tight worker loops where deferrals would accumulate.
//!
//! Setting `LOCK_DEBUG=basic` enables owner tracking; `LOCK_DEBUG=stack`
//! additionally captures a backtrace at each acquisition.

use std::backtrace::Backtrace;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::oneshot;

/// Identity of a deferred action: the scheduling function plus its argument.
/// Two `defer_unique` calls with the same key within one lock cycle run the
/// action once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferKey {
    pub func: &'static str,
    pub arg: u64,
}

type Action<T> = Box<dyn FnOnce(&mut T) + Send>;

struct Pending<T> {
    actions: Vec<Action<T>>,
    unique: HashSet<DeferKey>,
}

impl<T> Default for Pending<T> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            unique: HashSet::new(),
        }
    }
}

/// A writer lock that runs deferred actions on release.
pub struct DeferredRwLock<T> {
    inner: RwLock<T>,
    pending: Mutex<Pending<T>>,
    debug: Option<Mutex<LockDebug>>,
}

impl<T> DeferredRwLock<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        let debug = match std::env::var("LOCK_DEBUG").as_deref() {
            Ok("basic") => Some(Mutex::new(LockDebug::new(name, false))),
            Ok("stack") => Some(Mutex::new(LockDebug::new(name, true))),
            _ => None,
        };
        Self {
            inner: RwLock::new(value),
            pending: Mutex::new(Pending::default()),
            debug,
        }
    }

    /// Acquires the lock in deferrable mode.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let inner = self.inner.write();
        self.debug_on_lock();
        WriteGuard {
            lock: self,
            inner: Some(inner),
        }
    }

    /// Acquires the lock in raw mode: deferred actions are neither
    /// schedulable nor run on release. Pending actions from deferrable
    /// holders stay queued.
    pub fn raw_write(&self) -> RawWriteGuard<'_, T> {
        let inner = self.inner.write();
        self.debug_on_lock();
        RawWriteGuard {
            lock: self,
            inner: Some(inner),
        }
    }

    /// Read lock for pure queries. No deferral support.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Human-readable description of the current holder, for diagnostics.
    pub fn debug_info(&self) -> String {
        match &self.debug {
            None => "lock debug not enabled (set LOCK_DEBUG=basic or stack)".to_owned(),
            Some(d) => d.lock().info(),
        }
    }

    fn run_pending(&self, data: &mut T) {
        let mut pending = self.pending.lock();
        let actions = std::mem::take(&mut pending.actions);
        pending.unique.clear();
        drop(pending);
        for action in actions {
            action(data);
        }
        // Actions only receive the guarded data, so they cannot schedule
        // further deferrals mid-drain.
        debug_assert!(self.pending.lock().actions.is_empty());
    }

    fn debug_on_lock(&self) {
        if let Some(d) = &self.debug {
            d.lock().on_lock();
        }
    }

    fn debug_on_unlock(&self) {
        if let Some(d) = &self.debug {
            d.lock().on_unlock();
        }
    }
}

/// Deferrable-mode write guard.
pub struct WriteGuard<'a, T> {
    lock: &'a DeferredRwLock<T>,
    inner: Option<RwLockWriteGuard<'a, T>>,
}

impl<'a, T> WriteGuard<'a, T> {
    /// Schedules an action to run when the lock is released.
    pub fn defer(&mut self, action: impl FnOnce(&mut T) + Send + 'static) {
        self.lock.pending.lock().actions.push(Box::new(action));
    }

    /// Schedules an action keyed by `(function, argument)` identity; repeat
    /// schedules within one lock cycle are dropped.
    pub fn defer_unique(&mut self, key: DeferKey, action: impl FnOnce(&mut T) + Send + 'static) {
        let mut pending = self.lock.pending.lock();
        if !pending.unique.insert(key) {
            return;
        }
        pending.actions.push(Box::new(action));
    }

    /// Runs pending deferred actions now, while still holding the lock.
    pub fn flush_deferred(&mut self) {
        let data: &mut T = self.inner.as_mut().unwrap();
        self.lock.run_pending(data);
    }

    /// Releases the lock in raw mode around `f` (deferred actions do not
    /// run), then re-acquires it. Every I/O done while holding the lock goes
    /// through here so the lock is restored on all return paths.
    pub fn unlocked_raw<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.lock.debug_on_unlock();
        self.inner = None;
        let ret = f();
        self.inner = Some(self.lock.inner.write());
        self.lock.debug_on_lock();
        ret
    }

    // Releases without running deferrals; used by Event::wait.
    fn release_raw(mut self) -> &'a DeferredRwLock<T> {
        self.lock.debug_on_unlock();
        self.inner = None;
        self.lock
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().unwrap()
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap()
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            self.lock.run_pending(&mut inner);
            self.lock.debug_on_unlock();
        }
    }
}

/// Raw-mode write guard: no deferral support, pending actions untouched.
pub struct RawWriteGuard<'a, T> {
    lock: &'a DeferredRwLock<T>,
    inner: Option<RwLockWriteGuard<'a, T>>,
}

impl<T> RawWriteGuard<'_, T> {
    /// Releases the lock around `f`, then re-acquires it.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.lock.debug_on_unlock();
        self.inner = None;
        let ret = f();
        self.inner = Some(self.lock.inner.write());
        self.lock.debug_on_lock();
        ret
    }
}

impl<T> Deref for RawWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().unwrap()
    }
}

impl<T> DerefMut for RawWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap()
    }
}

impl<T> Drop for RawWriteGuard<'_, T> {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            self.lock.debug_on_unlock();
        }
    }
}

struct LockDebug {
    name: &'static str,
    capture_stacks: bool,
    owner: Option<ThreadId>,
    stack: Option<Backtrace>,
}

impl LockDebug {
    fn new(name: &'static str, capture_stacks: bool) -> Self {
        Self {
            name,
            capture_stacks,
            owner: None,
            stack: None,
        }
    }

    fn on_lock(&mut self) {
        let me = thread::current().id();
        if let Some(owner) = self.owner {
            panic!(
                "lock {} acquired by {:?} while still owned by {:?}\nowner stack:\n{}",
                self.name,
                me,
                owner,
                self.stack_str(),
            );
        }
        self.owner = Some(me);
        if self.capture_stacks {
            self.stack = Some(Backtrace::force_capture());
        }
    }

    fn on_unlock(&mut self) {
        let me = thread::current().id();
        if self.owner != Some(me) {
            panic!(
                "unlock of {} by {:?} (owner {:?})\nowner stack:\n{}",
                self.name,
                me,
                self.owner,
                self.stack_str(),
            );
        }
        self.owner = None;
        self.stack = None;
    }

    fn stack_str(&self) -> String {
        match &self.stack {
            Some(bt) => bt.to_string(),
            None => "(no stack captured, set LOCK_DEBUG=stack)".to_owned(),
        }
    }

    fn info(&self) -> String {
        match self.owner {
            None => "lock not held".to_owned(),
            Some(owner) => format!(
                "lock {:?} held by thread {:?}\n{}",
                self.name,
                owner,
                self.stack_str()
            ),
        }
    }
}

/// A condition variable compatible with [`DeferredRwLock`].
///
/// Waiters are woken LIFO by [`Event::signal`]; [`Event::broadcast`] wakes
/// all. `wait` releases the outer lock in raw mode so pending deferred
/// actions are not re-entered while suspended.
#[derive(Default)]
pub struct Event {
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes the most recently blocked waiter, if any.
    pub fn signal(&self) {
        if let Some(tx) = self.waiters.lock().pop() {
            let _ = tx.send(());
        }
    }

    /// Wakes all waiters.
    pub fn broadcast(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for tx in waiters {
            let _ = tx.send(());
        }
    }

    /// Atomically releases `guard` (raw mode, skipping deferrals) and
    /// suspends until woken, then re-acquires the lock and returns a fresh
    /// guard. Deferred actions queued before the wait run at the eventual
    /// release of the returned guard.
    pub fn wait<'a, T>(
        &self,
        guard: WriteGuard<'a, T>,
    ) -> impl std::future::Future<Output = WriteGuard<'a, T>> + 'a {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().push(tx);
            rx
        };
        let lock = guard.release_raw();
        async move {
            let _ = rx.await;
            lock.write()
        }
    }
}
