// Load average input
//
// Reports system load average (1min, 5min, 15min) and the same values
// normalized by the number of CPU cores.

use async_trait::async_trait;
use sysinfo::System;
use tracing::debug;

use super::Input;
use crate::model::{Accumulator, Tags};

/// Load average input
///
/// # Interpretation
/// - Values represent the average number of processes waiting for CPU time
/// - `load*_per_core` above 1.0 means the host is overloaded
///
/// # Platform Support
/// - Linux: Full support via /proc/loadavg
/// - macOS: Full support via sysctl
/// - Windows: Not available (reports 0.0)
#[derive(Default)]
pub struct LoadAverageInput;

impl LoadAverageInput {
    pub fn new() -> Self {
        LoadAverageInput
    }
}

#[async_trait]
impl Input for LoadAverageInput {
    fn default_prefix(&self) -> &str {
        "system_"
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()> {
        let load = System::load_average();
        let cores = num_cpus::get().max(1) as f64;

        for (name, value) in [("load1", load.one), ("load5", load.five), ("load15", load.fifteen)] {
            acc.add_value(name, Tags::new(), value);
            acc.add_value(&format!("{name}_per_core"), Tags::new(), value / cores);
        }
        acc.add_value("cpu_cores", Tags::new(), cores);

        debug!(
            "Load average: 1min={:.2}, 5min={:.2}, 15min={:.2} (CPUs: {})",
            load.one, load.five, load.fifteen, cores
        );
        Ok(())
    }
}
