//! Purpose: Track live load sessions so a process shutdown can cancel their statements.
//! Exports: `SessionRegistry`, `SessionControl`.
//! Role: Injected into every `LoadSession`; the hosting process calls `shutdown` once.
//! Invariants: A session's in-flight statement is cancelled at most once.
//! Invariants: Cancellation runs outside the registry lock.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::sql::StatementExecutor;

/// Per-session cancellation state shared between the session and the registry.
pub struct SessionControl {
    id: u64,
    executor: Arc<dyn StatementExecutor>,
    statement_active: AtomicBool,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for SessionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionControl")
            .field("id", &self.id)
            .field("statement_active", &self.statement_active.load(Ordering::Relaxed))
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

impl SessionControl {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn executor(&self) -> &Arc<dyn StatementExecutor> {
        &self.executor
    }

    pub fn set_statement_active(&self, active: bool) {
        self.statement_active.store(active, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the running statement; returns false if none was running or it was already cancelled.
    pub fn cancel_once(&self) -> Result<bool, Error> {
        if !self.statement_active.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.cancel()
    }

    /// Cancels whatever the executor is running, active load or not. At most once per session.
    pub fn cancel(&self) -> Result<bool, Error> {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        debug!(session = self.id, "cancelling load statement");
        self.executor.cancel()?;
        Ok(true)
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    shutting_down: bool,
    sessions: HashMap<u64, Arc<SessionControl>>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn register(&self, executor: Arc<dyn StatementExecutor>) -> Result<Arc<SessionControl>, Error> {
        let mut inner = self.lock();
        if inner.shutting_down {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("cannot start a load session while shutting down"));
        }
        inner.next_id += 1;
        let control = Arc::new(SessionControl {
            id: inner.next_id,
            executor,
            statement_active: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        inner.sessions.insert(control.id, Arc::clone(&control));
        Ok(control)
    }

    pub fn unregister(&self, id: u64) {
        self.lock().sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Marks the registry as shutting down and cancels every in-flight statement once.
    /// Returns how many statements were cancelled.
    pub fn shutdown(&self) -> usize {
        let sessions: Vec<Arc<SessionControl>> = {
            let mut inner = self.lock();
            inner.shutting_down = true;
            inner.sessions.values().cloned().collect()
        };
        let mut cancelled = 0;
        for control in sessions {
            match control.cancel_once() {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(err) => warn!(session = control.id, error = %err, "failed to cancel load statement"),
            }
        }
        info!(cancelled, "load sessions shut down");
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingExecutor {
        cancels: AtomicUsize,
    }

    impl StatementExecutor for CountingExecutor {
        fn execute(&self, _sql: &str) -> Result<(), Error> {
            Ok(())
        }

        fn cancel(&self) -> Result<(), Error> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn ids_are_monotonic_and_unregister_removes() {
        let registry = SessionRegistry::new();
        let executor: Arc<dyn StatementExecutor> = Arc::new(CountingExecutor::default());
        let first = registry.register(Arc::clone(&executor)).expect("first");
        let second = registry.register(executor).expect("second");
        assert!(second.id() > first.id());
        assert_eq!(registry.len(), 2);
        registry.unregister(first.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn shutdown_cancels_each_active_statement_once() {
        let registry = SessionRegistry::new();
        let active = Arc::new(CountingExecutor::default());
        let idle = Arc::new(CountingExecutor::default());
        let active_control = registry.register(active.clone()).expect("active");
        active_control.set_statement_active(true);
        registry.register(idle.clone()).expect("idle");

        assert_eq!(registry.shutdown(), 1);
        assert_eq!(registry.shutdown(), 0);
        assert!(!active_control.cancel_once().expect("again"));
        assert_eq!(active.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(idle.cancels.load(Ordering::SeqCst), 0);
        assert!(active_control.is_cancelled());
    }

    #[test]
    fn register_after_shutdown_is_refused() {
        let registry = SessionRegistry::new();
        registry.shutdown();
        assert!(registry.is_shutting_down());
        let err = registry
            .register(Arc::new(CountingExecutor::default()))
            .expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
