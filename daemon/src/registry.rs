//! The process-wide set of live connections.
//!
//! One mutex and one condition variable cover the whole table. Enumeration
//! bumps a per-entry counter and runs the visitor with the lock dropped, so
//! visitors may block; `remove` waits until nobody is visiting the entry
//! before it unlinks. A reader-writer lock would not do here: visitors run
//! arbitrary code.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::conn::{ConnRef, Connection};

struct Entry {
    conn: ConnRef,
    enum_count: u32,
}

pub struct Registry {
    inner: Mutex<HashMap<u64, Entry>>,
    cv: Condvar,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        }
    }

    pub fn insert(&self, conn: &ConnRef) {
        let mut inner = self.inner.lock().unwrap();
        let prev = inner.insert(
            conn.id(),
            Entry {
                conn: conn.clone(),
                enum_count: 0,
            },
        );
        debug_assert!(prev.is_none());
    }

    /// Unlink `conn`, waiting until no enumerator is visiting it.
    pub fn remove(&self, conn: &Connection) {
        let mut inner = self.inner.lock().unwrap();
        while inner.get(&conn.id()).is_some_and(|e| e.enum_count != 0) {
            inner = self.cv.wait(inner).unwrap();
        }
        if inner.remove(&conn.id()).is_some() {
            self.cv.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every connection; stop early (returning false) as soon as the
    /// visitor does. The visitor runs without the registry lock and must
    /// not call back into this registry.
    pub fn enumerate<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(&ConnRef) -> bool,
    {
        let ids: Vec<u64> = self.inner.lock().unwrap().keys().copied().collect();

        for id in ids {
            let conn = {
                let mut inner = self.inner.lock().unwrap();
                match inner.get_mut(&id) {
                    Some(entry) => {
                        entry.enum_count += 1;
                        entry.conn.clone()
                    }
                    // Removed since the snapshot.
                    None => continue,
                }
            };

            let keep_going = visit(&conn);

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.get_mut(&id) {
                    entry.enum_count -= 1;
                }
                self.cv.notify_all();
            }

            if !keep_going {
                return false;
            }
        }
        true
    }

    /// Cancel every registered connection. The workers notice and tear
    /// themselves down; wait for that with [`wait_empty`](Self::wait_empty).
    pub fn cancel_all(&self) {
        self.enumerate(|conn| {
            conn.cancel();
            true
        });
    }

    pub fn wait_empty(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.is_empty() {
            inner = self.cv.wait(inner).unwrap();
        }
    }
}
