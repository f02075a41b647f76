//! Fixed-size session pool.
//!
//! Borrowers take exclusive ownership of a session; the pool holds the idle
//! ones in a bounded channel. Exhaustion is never surfaced to callers: a
//! borrow that waits past the acquire timeout fabricates a fresh session
//! instead. Expired sessions are retired lazily, on borrow and on return.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{Instant, timeout_at};

use crate::config::CrawlerConfig;
use crate::net::session::Session;
use crate::net::transport::SessionFactory;

/// Pool of reusable sessions, fixed at `pool_size`.
pub struct SessionPool {
    tx: Sender<Session>,
    rx: Mutex<Receiver<Session>>,
    factory: Arc<dyn SessionFactory>,
    acquire_timeout: Duration,
    max_age: Duration,
    max_requests: u32,
}

impl SessionPool {
    pub fn new(config: &CrawlerConfig, factory: Arc<dyn SessionFactory>) -> Arc<Self> {
        let size = config.pool_size.max(1);
        let (tx, rx) = mpsc::channel(size);
        for _ in 0..size {
            // Channel capacity equals pool size, so seeding cannot fail.
            let _ = tx.try_send(factory.create());
        }
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            factory,
            acquire_timeout: config.session_acquire_timeout,
            max_age: config.session_max_age,
            max_requests: config.session_max_requests,
        })
    }

    /// Borrow a session, waiting up to the acquire timeout. On timeout a
    /// fresh session is fabricated so callers never observe exhaustion.
    pub async fn acquire(self: &Arc<Self>) -> PooledSession {
        // The deadline covers the lock wait as well as the channel wait, so
        // concurrent waiters on an exhausted pool each fabricate after their
        // own timeout instead of queueing behind one another.
        let deadline = Instant::now() + self.acquire_timeout;
        let session = match timeout_at(deadline, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await
        {
            Ok(Some(session)) => session,
            Ok(None) | Err(_) => {
                log::warn!("session acquire timed out, fabricating a fresh session");
                self.factory.create()
            }
        };

        let session = if session.expired(self.max_age, self.max_requests) {
            log::debug!(
                "retiring session on borrow (age {:?}, {} requests)",
                session.age(),
                session.request_count()
            );
            self.factory.create()
        } else {
            session
        };

        PooledSession {
            session: Some(session),
            pool: Arc::clone(self),
        }
    }

    /// Return a session. Expired sessions are discarded and replaced with a
    /// fresh one so the pool size stays constant.
    fn release(&self, session: Session) {
        let session = if session.expired(self.max_age, self.max_requests) {
            log::debug!(
                "retiring session on release (age {:?}, {} requests)",
                session.age(),
                session.request_count()
            );
            self.factory.create()
        } else {
            session
        };
        // Full channel means this was a fabricated extra; drop it rather
        // than let the pool grow past its fixed size.
        let _ = self.tx.try_send(session);
    }

    /// Idle sessions currently held by the pool.
    pub fn idle(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Borrowed session that returns itself to the pool on drop, so the release
/// path runs regardless of how the fetch exits.
pub struct PooledSession {
    session: Option<Session>,
    pool: Arc<SessionPool>,
}

impl std::ops::Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session taken")
    }
}

impl std::ops::DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session taken")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}
