//! Bounded pool of interpreter sessions.
//!
//! Sessions are created lazily up to the configured size. A checked-out
//! session serves exactly one caller; it goes back to the pool when the
//! guard drops, unless it was poisoned, in which case it is discarded and
//! its slot freed for a fresh session.

use super::config::HostConfig;
use super::loader::ModuleImporter;
use super::session::InterpreterSession;
use log::debug;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Sessions currently alive
    pub created: usize,
    /// Sessions waiting for work
    pub idle: usize,
    /// Configured maximum
    pub capacity: usize,
    /// Sessions discarded after poisoning
    pub discarded: u64,
}

struct PoolState {
    idle: Vec<InterpreterSession>,
    created: usize,
    discarded: u64,
}

struct PoolInner {
    config: HostConfig,
    importer: Option<ModuleImporter>,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, session: InterpreterSession) {
        let mut state = self.lock();
        if session.is_poisoned() {
            state.created = state.created.saturating_sub(1);
            state.discarded += 1;
            debug!("🗑️ Discarded poisoned session {}", session.id());
        } else {
            state.idle.push(session);
        }
        drop(state);
        self.available.notify_one();
    }
}

/// Thread-safe session pool; clones share the same sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Creates an empty pool holding at most `config.execution.pool_size` sessions.
    pub fn new(config: HostConfig) -> Self {
        Self::with_importer(config, None)
    }

    /// Like [`SessionPool::new`]; sessions resolve `import` through `importer`.
    pub fn with_importer(config: HostConfig, importer: Option<ModuleImporter>) -> Self {
        let capacity = config.execution.pool_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                config,
                importer,
                capacity,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    created: 0,
                    discarded: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Takes an idle session, creating one if below capacity; blocks while
    /// every session is busy.
    pub fn checkout(&self) -> PooledSession {
        let mut state = self.inner.lock();
        loop {
            if let Some(session) = state.idle.pop() {
                return self.guard(session);
            }
            if state.created < self.inner.capacity {
                state.created += 1;
                drop(state);
                let mut session = InterpreterSession::new(&self.inner.config);
                if let Some(importer) = &self.inner.importer {
                    session.allow_imports(importer.clone());
                }
                return self.guard(session);
            }
            state = self
                .inner
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            created: state.created,
            idle: state.idle.len(),
            capacity: self.inner.capacity,
            discarded: state.discarded,
        }
    }

    /// Drops retained module globals of every idle session.
    pub fn reset_module_state(&self) {
        for session in self.inner.lock().idle.iter_mut() {
            session.reset_module_state();
        }
    }

    fn guard(&self, session: InterpreterSession) -> PooledSession {
        PooledSession {
            session: Some(session),
            pool: Arc::clone(&self.inner),
        }
    }
}

/// Exclusive use of one session, returned to the pool on drop.
pub struct PooledSession {
    session: Option<InterpreterSession>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledSession {
    type Target = InterpreterSession;

    fn deref(&self) -> &InterpreterSession {
        // Only `Drop` takes the session out.
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut InterpreterSession {
        self.session.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session);
        }
    }
}
