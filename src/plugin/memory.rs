// Memory input
//
// Collects system memory usage metrics including RAM and swap

use async_trait::async_trait;
use sysinfo::System;
use tracing::debug;

use super::Input;
use crate::model::{Accumulator, Tags};

/// Memory usage input
///
/// Reports, in bytes unless noted:
/// - `mem_total`, `mem_used`, `mem_available`, `mem_free`
/// - `mem_util`: percentage of total memory in use
/// - `swap_total`, `swap_used`, `swap_util`
///
/// # Platform Support
/// - Linux: Full support via /proc/meminfo
/// - macOS: Full support via vm_stat
/// - Windows: Full support via GlobalMemoryStatusEx
pub struct MemoryInput {
    /// System information provider, refreshed on every round
    system: System,
}

impl MemoryInput {
    pub fn new() -> Self {
        MemoryInput { system: System::new() }
    }
}

impl Default for MemoryInput {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentage of `used` over `total`, 0 when `total` is 0.
pub(crate) fn percentage(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}

#[async_trait]
impl Input for MemoryInput {
    fn default_prefix(&self) -> &str {
        "system_"
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()> {
        self.system.refresh_memory();
        let sys = &self.system;

        let total = sys.total_memory();
        let used = sys.used_memory();
        let swap_total = sys.total_swap();
        let swap_used = sys.used_swap();

        acc.add_value("mem_total", Tags::new(), total as f64);
        acc.add_value("mem_used", Tags::new(), used as f64);
        acc.add_value("mem_available", Tags::new(), sys.available_memory() as f64);
        acc.add_value("mem_free", Tags::new(), sys.free_memory() as f64);
        acc.add_value("mem_util", Tags::new(), percentage(used, total));
        acc.add_value("swap_total", Tags::new(), swap_total as f64);
        acc.add_value("swap_used", Tags::new(), swap_used as f64);
        acc.add_value("swap_util", Tags::new(), percentage(swap_used, swap_total));

        debug!(
            "Memory: {}/{} bytes ({:.1}%)",
            used,
            total,
            percentage(used, total)
        );
        Ok(())
    }
}
