//! Connection pool: a LIFO stack per destination key with idle eviction and
//! a per-key capacity cap.

use crate::connect_key::ConnectKey;
use crate::error::ClientError;
use crate::persist::PersistConn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) struct ConnPool {
    buckets: Mutex<HashMap<ConnectKey, Vec<Arc<PersistConn>>>>,
    idle_timeout: Duration,
    max_per_key: usize,
}

impl ConnPool {
    pub(crate) fn new(idle_timeout: Duration, max_per_key: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            idle_timeout,
            max_per_key,
        }
    }

    /// Pops the most recently released live connection for `key`.
    ///
    /// Closed entries are discarded and entries past the idle window are
    /// closed with the idle-timeout cause. The returned connection has its
    /// idle timer stopped and idle timestamp cleared.
    pub(crate) fn get(&self, key: &ConnectKey) -> Option<Arc<PersistConn>> {
        let mut buckets = self.buckets.lock().unwrap();

        let idle_begin = if self.idle_timeout.is_zero() {
            None
        } else {
            Instant::now().checked_sub(self.idle_timeout)
        };

        let mut found = None;
        let mut drop_key = false;
        if let Some(list) = buckets.get_mut(key) {
            while let Some(conn) = list.pop() {
                if conn.is_closed() {
                    continue;
                }
                let too_old = match (idle_begin, conn.idle_at()) {
                    (Some(begin), Some(idle_at)) => idle_at < begin,
                    _ => false,
                };
                if too_old {
                    conn.close(ClientError::IdleTimeout);
                    continue;
                }
                conn.clear_idle();
                found = Some(conn);
                break;
            }
            drop_key = list.is_empty();
        }
        if drop_key {
            buckets.remove(key);
        }
        found
    }

    /// Returns a connection to its bucket, marking it reused and arming the
    /// idle timer. Evicts the oldest entries when the bucket would exceed the
    /// per-key cap, closing each with the out-of-pool cause.
    pub(crate) fn put(&self, conn: &Arc<PersistConn>) {
        let mut buckets = self.buckets.lock().unwrap();

        conn.mark_idle(self.idle_timeout);

        let list = buckets.entry(conn.key.clone()).or_default();
        if self.max_per_key > 0 && list.len() >= self.max_per_key {
            let cut = list.len() - self.max_per_key + 1;
            for evicted in list.drain(..cut) {
                evicted.close(ClientError::OutOfPool);
            }
        }
        list.push(Arc::clone(conn));
    }

    /// Splices `conn` out of its bucket by identity. Returns false when the
    /// connection is not pooled, e.g. a `get` already handed it to a caller.
    pub(crate) fn remove(&self, conn: &Arc<PersistConn>) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let Some(list) = buckets.get_mut(&conn.key) else {
            return false;
        };
        let Some(pos) = list.iter().position(|c| Arc::ptr_eq(c, conn)) else {
            return false;
        };
        list.remove(pos);
        true
    }

    /// Number of idle connections pooled for `key`.
    pub(crate) fn idle_count(&self, key: &ConnectKey) -> usize {
        self.buckets
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |list| list.len())
    }
}
