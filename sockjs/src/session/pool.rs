//! Garbage-collected session pool.
//!
//! The pool is the authoritative registry of pooled sessions. Two timers
//! drive it: a GC tick that reaps expired sessions and a heartbeat tick
//! that writes `h` frames through every attached transport.
//!
//! The GC heap is ordered by the *last-visit* cycle stamp of each
//! session, not by expiry. On each pass every session is visited at most
//! once, in the order they were last visited; a session whose recorded
//! cycle equals the current pass timestamp has already been considered,
//! which terminates the loop. This keeps `add` and `remove` O(log N) and
//! makes TTL touches free, at the cost of O(N) work per pass.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS_SESSIONS_EXPIRED;
use crate::session::{Session, SessionError, SessionState, now_ms};

#[derive(Clone)]
pub(crate) struct SessionPool {
    gc_interval: Duration,
    heartbeat_delay: Duration,
    inner: Arc<Mutex<PoolInner>>,
}

struct PoolInner {
    stopping: bool,
    sessions: HashMap<String, Arc<Session>>,
    /// Timestamp of the GC pass that last visited each session.
    cycles: HashMap<String, u64>,
    /// Min-heap of `(cycle stamp, session id)`. Entries whose stamp no
    /// longer matches `cycles` are stale and skipped on pop; the heap is
    /// never searched.
    heap: BinaryHeap<Reverse<(u64, String)>>,
}

impl SessionPool {
    pub(crate) fn new(gc_interval: Duration, heartbeat_delay: Duration) -> Self {
        Self {
            gc_interval,
            heartbeat_delay,
            inner: Arc::new(Mutex::new(PoolInner {
                stopping: false,
                sessions: HashMap::new(),
                cycles: HashMap::new(),
                heap: BinaryHeap::new(),
            })),
        }
    }

    /// Spawn the GC and heartbeat tickers. They run until `cancel` fires.
    pub(crate) fn start(&self, cancel: &CancellationToken) {
        self.inner.lock().stopping = false;

        tokio::spawn({
            let pool = self.clone();
            let cancel = cancel.clone();
            async move {
                let mut interval = tokio::time::interval(pool.gc_interval);
                // first tick triggers instantly
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => pool.gc().await,
                    }
                }
            }
        });

        tokio::spawn({
            let pool = self.clone();
            let cancel = cancel.clone();
            async move {
                let mut interval = tokio::time::interval(pool.heartbeat_delay);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => pool.heartbeat(),
                    }
                }
            }
        });
    }

    /// Refuse new sessions and close every pooled one with
    /// `3000 "Go away!"`.
    pub(crate) async fn stop(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.stopping {
                return;
            }
            inner.stopping = true;
            inner.cycles.clear();
            inner.heap.clear();
            inner.sessions.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };
        for session in drained {
            session.close().await;
        }
    }

    /// Register a freshly created session.
    pub(crate) fn add(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.stopping {
            return Err(SessionError::PoolStopping);
        }
        let id = session.session_id().to_owned();
        if inner.sessions.contains_key(&id) {
            return Err(SessionError::DuplicateSession(id));
        }
        if session.state() != SessionState::New {
            return Err(SessionError::NotNew);
        }
        let now = now_ms();
        inner.cycles.insert(id.clone(), now);
        inner.sessions.insert(id.clone(), Arc::clone(session));
        inner.heap.push(Reverse((now, id)));
        Ok(())
    }

    pub(crate) fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    /// Drop a session from the registry and close it. Tolerant of absent
    /// ids.
    pub(crate) async fn remove(&self, session_id: &str) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            inner.cycles.remove(session_id);
            inner.sessions.remove(session_id)
        };
        match session {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// One garbage collection pass: visit each session at most once,
    /// reap the expired ones.
    pub(crate) async fn gc(&self) {
        let expired = self.sweep(now_ms());
        if expired.is_empty() {
            return;
        }
        ::metrics::counter!(METRICS_SESSIONS_EXPIRED).increment(expired.len() as u64);
        for session in expired {
            tracing::debug!(session_id = %session.session_id(), "reaping expired session");
            session.close().await;
        }
    }

    fn sweep(&self, now: u64) -> Vec<Arc<Session>> {
        let mut expired = Vec::new();
        let mut inner = self.inner.lock();
        loop {
            let (stamp, id) = match inner.heap.peek() {
                Some(Reverse((stamp, id))) => (*stamp, id.clone()),
                None => break,
            };
            match inner.cycles.get(&id) {
                // removed session, stale heap entry
                None => {
                    inner.heap.pop();
                    continue;
                }
                Some(&cycle) if cycle != stamp => {
                    inner.heap.pop();
                    continue;
                }
                // everything left was already visited this pass
                Some(&cycle) if cycle >= now => break,
                Some(_) => {}
            }
            inner.heap.pop();
            let Some(session) = inner.sessions.get(&id).cloned() else {
                inner.cycles.remove(&id);
                continue;
            };
            if session.has_expired(now) {
                inner.sessions.remove(&id);
                inner.cycles.remove(&id);
                expired.push(session);
            } else {
                inner.cycles.insert(id.clone(), now);
                inner.heap.push(Reverse((now, id)));
            }
        }
        expired
    }

    /// Write a heartbeat through every registered session.
    pub(crate) fn heartbeat(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.send_heartbeat();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SockJsConfig;
    use crate::connection::{Connection, ConnectionInfo};
    use async_trait::async_trait;
    use std::sync::Weak;

    struct NullConn;

    #[async_trait]
    impl Connection for NullConn {
        async fn on_message(&self, _message: String) -> eyre::Result<()> {
            Ok(())
        }
    }

    fn pooled_session(id: &str, config: &SockJsConfig) -> Arc<Session> {
        let session = Session::new(id, config, Weak::new());
        session.bind(Arc::new(NullConn));
        session.set_conn_info(ConnectionInfo {
            ip: "127.0.0.1".to_owned(),
            cookies: Default::default(),
            arguments: Default::default(),
            headers: Default::default(),
            path: "/".to_owned(),
        });
        session
    }

    fn test_pool() -> (SessionPool, SockJsConfig) {
        let config = SockJsConfig::default();
        (
            SessionPool::new(config.session_check_interval, config.heartbeat_delay),
            config,
        )
    }

    #[tokio::test]
    async fn add_rejects_duplicates_and_non_new_sessions() {
        let (pool, config) = test_pool();
        let session = pooled_session("a", &config);
        pool.add(&session).unwrap();
        assert_eq!(
            pool.add(&session),
            Err(SessionError::DuplicateSession("a".to_owned()))
        );

        let opened = pooled_session("b", &config);
        opened.open().await.unwrap();
        assert_eq!(pool.add(&opened), Err(SessionError::NotNew));
    }

    #[tokio::test]
    async fn remove_is_tolerant_of_absent_ids() {
        let (pool, config) = test_pool();
        assert!(!pool.remove("ghost").await);
        let session = pooled_session("a", &config);
        pool.add(&session).unwrap();
        assert!(pool.remove("a").await);
        assert!(session.is_closed());
        assert!(pool.get("a").is_none());
    }

    #[tokio::test]
    async fn gc_pass_visits_each_session_at_most_once() {
        let (pool, config) = test_pool();
        for id in ["a", "b", "c"] {
            pool.add(&pooled_session(id, &config)).unwrap();
        }
        // sessions are fresh, nothing is reaped, the pass terminates
        assert!(pool.sweep(now_ms()).is_empty());
        assert_eq!(pool.len(), 3);
        // a second pass with the same timestamp sees only visited entries
        assert!(pool.sweep(now_ms()).is_empty());
    }

    #[tokio::test]
    async fn gc_reaps_expired_and_closed_sessions() {
        let (pool, config) = test_pool();
        let fresh = pooled_session("fresh", &config);
        let stale = pooled_session("stale", &config);
        let closing = pooled_session("closing", &config);
        pool.add(&fresh).unwrap();
        pool.add(&stale).unwrap();
        pool.add(&closing).unwrap();

        stale.set_expiry(Duration::from_millis(1));
        closing.close().await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.gc().await;
        assert!(pool.get("fresh").is_some());
        assert!(pool.get("stale").is_none());
        assert!(pool.get("closing").is_none());
        assert!(stale.is_closed());
    }

    #[tokio::test]
    async fn stale_heap_entries_are_skipped() {
        let (pool, config) = test_pool();
        let session = pooled_session("a", &config);
        pool.add(&session).unwrap();
        assert!(pool.remove("a").await);
        // the heap still holds the dead entry; a sweep must not panic or
        // resurrect it
        assert!(pool.sweep(now_ms() + 10).is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn drain_closes_everything_and_refuses_new_sessions() {
        let (pool, config) = test_pool();
        let a = pooled_session("a", &config);
        let b = pooled_session("b", &config);
        pool.add(&a).unwrap();
        pool.add(&b).unwrap();
        pool.stop().await;
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(
            a.close_reason().unwrap().frame(),
            "c[3000,\"Go away!\"]"
        );
        assert_eq!(
            pool.add(&pooled_session("c", &config)),
            Err(SessionError::PoolStopping)
        );
    }
}
