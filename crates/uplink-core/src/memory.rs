//! System memory utilisation

use std::sync::{Mutex, PoisonError};
use sysinfo::System;

/// Source of the utilised-memory percentage (0-100)
pub trait MemoryProbe: Send + Sync {
    fn used_percent(&self) -> f32;
}

/// Reads memory figures from the OS
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn used_percent(&self) -> f32 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        used_percent(system.total_memory(), system.available_memory())
    }
}

/// Share of `total` that is not available, counting reclaimable cache as free
pub fn used_percent(total: u64, available: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(available);
    (used as f64 / total as f64 * 100.0) as f32
}
