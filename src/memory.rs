//! Process-wide memory budget accounting.
//!
//! Every in-core allocation that scales with the working set (stream blocks,
//! cache slot arrays) is charged against a [`MemoryManager`] before the
//! allocation is made and released when it is dropped. The manager is an
//! explicit object threaded through construction; [`MemoryManager::global`]
//! provides the process-wide default instance used by convenience APIs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use log;

use crate::error::{Error, Result};

/// Byte-budget enforcer for in-core allocations.
///
/// The counter is atomic; no lock is taken on the charge/release path.
pub struct MemoryManager {
    limit: AtomicU64,
    used: AtomicU64,
}

impl MemoryManager {
    /// Creates a manager with the given budget in bytes.
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(MemoryManager {
            limit: AtomicU64::new(limit),
            used: AtomicU64::new(0),
        })
    }

    /// The process-wide default instance. Unlimited until configured via
    /// [`MemoryManager::set_limit`].
    pub fn global() -> &'static Arc<MemoryManager> {
        static GLOBAL: OnceLock<Arc<MemoryManager>> = OnceLock::new();
        GLOBAL.get_or_init(|| MemoryManager::new(u64::MAX))
    }

    /// Charges `bytes` against the budget.
    ///
    /// Fails with [`Error::OutOfMemory`] when the budget would be exceeded;
    /// the counter is left unchanged in that case.
    pub fn register(&self, bytes: u64) -> Result<()> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let limit = self.limit.load(Ordering::Relaxed);
            let available = limit - used.min(limit);
            if bytes > available {
                log::warn!(
                    "memory budget exceeded: requested {} bytes, {} available",
                    bytes,
                    available
                );
                return Err(Error::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
            match self.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    /// Releases a previously registered charge.
    pub fn deregister(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Currently charged bytes.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// The configured budget in bytes.
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Bytes still available under the budget.
    pub fn available(&self) -> u64 {
        let limit = self.limit();
        limit - self.used().min(limit)
    }

    /// Reconfigures the budget. Existing charges are kept; a limit below the
    /// currently used amount only affects future registrations.
    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }
}

/// RAII charge against a [`MemoryManager`]; released on drop.
pub struct MemoryCharge {
    manager: Arc<MemoryManager>,
    bytes: u64,
}

impl MemoryCharge {
    /// Registers `bytes` with the manager, returning the guard on success.
    pub fn take(manager: &Arc<MemoryManager>, bytes: u64) -> Result<Self> {
        manager.register(bytes)?;
        return Ok(MemoryCharge {
            manager: manager.clone(),
            bytes,
        });
    }

    /// The charged amount in bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryCharge {
    fn drop(&mut self) {
        self.manager.deregister(self.bytes);
    }
}
