//! Single-occupancy, re-entrant session lock.
//!
//! One client at a time may hold the session; the holder may re-acquire
//! freely (each re-acquire must be matched by a release before the lock
//! frees). Release by a non-holder is a no-op rather than an error, so a
//! client that lost the session cannot free it out from under the holder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a session client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Mint a fresh, process-unique identity.
    pub fn new() -> ClientId {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientId {
    fn default() -> ClientId {
        ClientId::new()
    }
}

#[derive(Debug, Default)]
struct Occupancy {
    holder: Option<ClientId>,
    depth: u32,
}

/// The lock itself. Fairness is best-effort: waiters are woken one at a
/// time but the OS picks which.
#[derive(Debug, Default)]
pub struct TicketLock {
    occupancy: Mutex<Occupancy>,
    freed: Condvar,
}

impl TicketLock {
    pub fn new() -> TicketLock {
        TicketLock::default()
    }

    /// Block until `client` holds the lock. Re-entrant for the holder.
    pub fn acquire(&self, client: ClientId) {
        let mut occ = self
            .occupancy
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            match occ.holder {
                None => {
                    occ.holder = Some(client);
                    occ.depth = 1;
                    return;
                }
                Some(holder) if holder == client => {
                    occ.depth += 1;
                    return;
                }
                Some(_) => {
                    occ = self
                        .freed
                        .wait(occ)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Release one level of `client`'s hold. No-op for non-holders.
    pub fn release(&self, client: ClientId) {
        let mut occ = self
            .occupancy
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if occ.holder != Some(client) {
            return;
        }
        occ.depth -= 1;
        if occ.depth == 0 {
            occ.holder = None;
            self.freed.notify_one();
        }
    }

    /// Whether `client` currently holds the lock.
    pub fn holds(&self, client: ClientId) -> bool {
        self.occupancy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .holder
            == Some(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn reentrant_acquire_needs_matching_releases() {
        let lock = TicketLock::new();
        let a = ClientId::new();
        lock.acquire(a);
        lock.acquire(a);
        assert!(lock.holds(a));
        lock.release(a);
        assert!(lock.holds(a));
        lock.release(a);
        assert!(!lock.holds(a));
    }

    #[test]
    fn release_by_non_holder_is_a_no_op() {
        let lock = TicketLock::new();
        let a = ClientId::new();
        let b = ClientId::new();
        lock.acquire(a);
        lock.release(b);
        assert!(lock.holds(a));
        lock.release(a);
    }

    #[test]
    fn waiter_gets_the_lock_after_release() {
        let lock = Arc::new(TicketLock::new());
        let a = ClientId::new();
        let b = ClientId::new();
        lock.acquire(a);

        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.acquire(b);
                lock.release(b);
            })
        };

        // Give the waiter time to block, then free the lock.
        std::thread::sleep(Duration::from_millis(50));
        lock.release(a);
        waiter.join().unwrap();
        assert!(!lock.holds(a));
        assert!(!lock.holds(b));
    }

    #[test]
    fn only_one_client_holds_at_a_time() {
        let lock = Arc::new(TicketLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                let me = ClientId::new();
                for _ in 0..50 {
                    lock.acquire(me);
                    let inside = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(inside, 0);
                    counter.fetch_sub(1, Ordering::SeqCst);
                    lock.release(me);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
