// Disk space input
//
// Collects disk usage metrics for all mounted filesystems, one tag set per
// mount point. In daemonset mode the host filesystem is mounted under
// `hostfs`; only those mounts are reported and the prefix is stripped from
// the `mount` tag.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

use super::memory::percentage;
use super::Input;
use crate::config::AgentConfig;
use crate::model::{Accumulator, Tags};

/// Disk space input
///
/// # What is Collected (per mount)
/// - `disk_total`, `disk_used`, `disk_free` in bytes
/// - `disk_util`: usage percentage
///
/// Tags: `mount`, `fstype`, `device`.
pub struct DiskInput {
    /// Set in daemonset mode
    hostfs: Option<PathBuf>,
}

impl DiskInput {
    pub fn new(config: &AgentConfig) -> Self {
        DiskInput {
            hostfs: config.is_daemonset().then(|| config.hostfs.clone()),
        }
    }

    /// Mount point as seen from the host, or `None` if it is not a host mount.
    fn host_mount(&self, mount: &Path) -> Option<String> {
        match &self.hostfs {
            None => Some(mount.display().to_string()),
            Some(hostfs) => {
                let rest = mount.strip_prefix(hostfs).ok()?;
                Some(Path::new("/").join(rest).display().to_string())
            }
        }
    }
}

#[async_trait]
impl Input for DiskInput {
    fn default_prefix(&self) -> &str {
        "system_"
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()> {
        let disks = Disks::new_with_refreshed_list();

        for disk in disks.list() {
            let Some(mount) = self.host_mount(disk.mount_point()) else {
                continue;
            };
            let total = disk.total_space();
            let free = disk.available_space();
            let used = total.saturating_sub(free);

            let tags = Tags::from([
                ("mount".to_string(), mount),
                ("fstype".to_string(), disk.file_system().to_string_lossy().to_string()),
                ("device".to_string(), disk.name().to_string_lossy().to_string()),
            ]);

            acc.add_value("disk_total", tags.clone(), total as f64);
            acc.add_value("disk_used", tags.clone(), used as f64);
            acc.add_value("disk_free", tags.clone(), free as f64);
            acc.add_value("disk_util", tags, percentage(used, total));
        }

        debug!("Collected usage for {} disk(s)", disks.list().len());
        Ok(())
    }
}
