//! Sources of heap statistics.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::lock;
use crate::error::ProbeError;

/// Heap usage as reported by the host, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub used: u64,
    pub total: u64,
    /// The most the heap may grow to.
    pub limit: u64,
}

impl HeapStats {
    pub fn new(used: u64, total: u64, limit: u64) -> Self {
        Self { used, total, limit }
    }

    /// Used bytes as a percentage of the limit.
    pub fn usage_percent(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used as f64 / self.limit as f64 * 100.0
    }
}

/// Heap introspection offered by the host.
///
/// `Ok(None)` means the host has no such introspection at all, which turns
/// the memory monitor off. Errors are transient and only logged.
pub trait HeapProbe: Send + Sync {
    fn sample(&self) -> Result<Option<HeapStats>, ProbeError>;
}

/// A host without heap introspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProbe;

impl HeapProbe for UnsupportedProbe {
    fn sample(&self) -> Result<Option<HeapStats>, ProbeError> {
        Ok(None)
    }
}

/// Always reports the same numbers.
#[derive(Debug, Clone, Copy)]
pub struct StaticHeapProbe(pub HeapStats);

impl HeapProbe for StaticHeapProbe {
    fn sample(&self) -> Result<Option<HeapStats>, ProbeError> {
        Ok(Some(self.0))
    }
}

/// Replays a prepared sequence of readings, then keeps repeating the last
/// one.
#[derive(Debug, Default)]
pub struct ScriptedHeapProbe {
    script: Mutex<VecDeque<Result<HeapStats, String>>>,
    last: Mutex<Option<HeapStats>>,
}

impl ScriptedHeapProbe {
    pub fn new(readings: impl IntoIterator<Item = HeapStats>) -> Self {
        Self {
            script: Mutex::new(readings.into_iter().map(Ok).collect()),
            last: Mutex::new(None),
        }
    }

    pub fn push(&self, reading: HeapStats) {
        lock(&self.script).push_back(Ok(reading));
    }

    /// Queues a failed reading.
    pub fn push_error(&self, message: impl Into<String>) {
        lock(&self.script).push_back(Err(message.into()));
    }
}

impl HeapProbe for ScriptedHeapProbe {
    fn sample(&self) -> Result<Option<HeapStats>, ProbeError> {
        let next = lock(&self.script).pop_front();
        match next {
            Some(Ok(stats)) => {
                *lock(&self.last) = Some(stats);
                Ok(Some(stats))
            }
            Some(Err(message)) => Err(ProbeError::Unavailable(message)),
            None => Ok(*lock(&self.last)),
        }
    }
}

#[cfg(feature = "system")]
pub use system::SystemHeapProbe;

#[cfg(feature = "system")]
mod system {
    use std::sync::Mutex;

    use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    use super::{HeapProbe, HeapStats};
    use crate::core::lock;
    use crate::error::ProbeError;

    /// Resident memory of the current process against total system memory.
    pub struct SystemHeapProbe {
        system: Mutex<System>,
        pid: Pid,
    }

    impl SystemHeapProbe {
        pub fn new() -> Result<Self, ProbeError> {
            let pid = sysinfo::get_current_pid().map_err(|e| ProbeError::Unavailable(e.to_string()))?;
            Ok(Self {
                system: Mutex::new(System::new()),
                pid,
            })
        }
    }

    impl HeapProbe for SystemHeapProbe {
        fn sample(&self) -> Result<Option<HeapStats>, ProbeError> {
            let mut system = lock(&self.system);

            system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[self.pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );

            let Some(process) = system.process(self.pid) else {
                return Err(ProbeError::Unavailable(format!("process {} not found", self.pid)));
            };

            let limit = system.total_memory();
            if limit == 0 {
                return Ok(None);
            }

            Ok(Some(HeapStats {
                used: process.memory(),
                total: process.virtual_memory().min(limit),
                limit,
            }))
        }
    }

    impl std::fmt::Debug for SystemHeapProbe {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SystemHeapProbe").field("pid", &self.pid).finish()
        }
    }
}
