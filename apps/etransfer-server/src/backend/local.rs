//! In-process lock table and quota ledger used by the single-process
//! backends.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Admission, LedgerSnapshot};

struct Lease {
    holder: String,
    expires: Instant,
}

/// Per-id advisory locks with lease expiry
#[derive(Default)]
pub struct LockTable {
    leases: Mutex<HashMap<String, Lease>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, id: &str, holder: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        // Leases whose release never ran
        leases.retain(|_, lease| lease.expires > now);

        match leases.get(id) {
            Some(lease) if lease.holder != holder => false,
            _ => {
                leases.insert(
                    id.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires: now + ttl,
                    },
                );
                true
            }
        }
    }

    pub fn unlock(&self, id: &str, holder: &str) {
        let mut leases = self.leases.lock();
        if leases.get(id).is_some_and(|lease| lease.holder == holder) {
            leases.remove(id);
        }
    }

    /// Number of live leases
    pub fn held(&self) -> usize {
        let now = Instant::now();
        self.leases.lock().values().filter(|l| l.expires > now).count()
    }

    /// Number of entries in the table, expired or not
    pub fn entries(&self) -> usize {
        self.leases.lock().len()
    }
}

struct Reservation {
    bytes: u64,
    expires: Instant,
}

#[derive(Default)]
struct LedgerState {
    used: u64,
    revision: u64,
    pending: HashMap<String, Reservation>,
}

impl LedgerState {
    fn prune(&mut self, now: Instant) -> u64 {
        let before = self.pending.len();
        self.pending.retain(|_, r| r.expires > now);
        (before - self.pending.len()) as u64
    }

    fn pending(&self) -> u64 {
        self.pending
            .values()
            .fold(0u64, |sum, r| sum.saturating_add(r.bytes))
    }

    fn total(&self) -> u64 {
        self.used.saturating_add(self.pending())
    }

    fn set_used(&mut self, bytes: u64) {
        self.used = bytes;
        self.revision += 1;
    }
}

/// Committed usage plus in-flight reservations, checked and updated under
/// one mutex
#[derive(Default)]
pub struct LocalLedger {
    state: Mutex<LedgerState>,
}

impl LocalLedger {
    pub fn try_reserve(
        &self,
        token: &str,
        bytes: u64,
        ceiling: Option<u64>,
        ttl: Duration,
    ) -> Admission {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now);

        let total = state.total();
        let prospective = total.saturating_add(bytes);

        match ceiling {
            Some(max) if prospective > max => Admission::Rejected { used: total },
            _ => {
                state.pending.insert(
                    token.to_string(),
                    Reservation {
                        bytes,
                        expires: now + ttl,
                    },
                );
                Admission::Admitted { used: prospective }
            }
        }
    }

    pub fn commit(&self, token: &str, bytes: u64) -> u64 {
        let mut state = self.state.lock();
        state.pending.remove(token);
        let used = state.used.saturating_add(bytes);
        state.set_used(used);
        state.total()
    }

    pub fn cancel(&self, token: &str) {
        self.state.lock().pending.remove(token);
    }

    pub fn prune(&self) -> u64 {
        self.state.lock().prune(Instant::now())
    }

    pub fn release(&self, bytes: u64) -> u64 {
        let mut state = self.state.lock();
        let used = state.used.saturating_sub(bytes);
        state.set_used(used);
        state.total()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        LedgerSnapshot {
            used: state.used,
            pending: state.pending(),
            revision: state.revision,
        }
    }

    pub fn usage(&self) -> u64 {
        self.snapshot().total()
    }

    pub fn set_usage(&self, bytes: u64) {
        self.state.lock().set_used(bytes);
    }

    pub fn replace_usage(&self, revision: u64, bytes: u64) -> bool {
        let mut state = self.state.lock();
        if state.revision != revision {
            return false;
        }
        state.set_used(bytes);
        true
    }
}
