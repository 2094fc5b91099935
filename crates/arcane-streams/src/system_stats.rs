//! Host-level stats collector behind the `system/stats` stream.
//!
//! A background sampler refreshes the CPU reading every second (sysinfo
//! needs two spaced refreshes for a meaningful percentage); the broadcast
//! tick assembles the full snapshot at the subscriber-chosen interval.
//! Container limits win over host totals when the node runs in a cgroup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::hub::{Frame, Hub};

/// CPU sampling cadence.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// How long a subscriber may go without answering a ping.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Smallest allowed broadcast interval.
pub const MIN_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot shape on the wire. Memory and disk values are bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub cpu_usage: f64,
    pub memory_usage: u64,
    pub memory_total: u64,
    pub disk_usage: u64,
    pub disk_total: u64,
    pub cpu_count: usize,
    pub architecture: String,
    pub platform: String,
    pub hostname: String,
    pub gpu_count: usize,
    pub gpus: Vec<GpuStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStats {
    pub name: String,
    pub index: u32,
    pub memory_used: u64,
    pub memory_total: u64,
}

/// Collects host metrics with per-cache locks written by the sampler.
pub struct SystemStatsCollector {
    system: Mutex<System>,
    cpu_usage: RwLock<f64>,
    disk_mount: RwLock<Option<PathBuf>>,
    gpus: RwLock<Option<Vec<GpuStats>>>,
}

impl Default for SystemStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemStatsCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            cpu_usage: RwLock::new(0.0),
            disk_mount: RwLock::new(None),
            gpus: RwLock::new(None),
        }
    }

    /// One CPU sample; called by the 1 s ticker.
    pub fn sample_cpu(&self) {
        let usage = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.global_cpu_usage() as f64
        };
        *self.cpu_usage.write() = usage;
    }

    /// Assembles a full snapshot from the caches and fresh memory/disk
    /// readings.
    pub async fn snapshot(&self) -> SystemStats {
        let (memory_usage, memory_total, cpu_count) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            let (usage, total) = match system.cgroup_limits() {
                Some(limits) => (
                    limits.total_memory.saturating_sub(limits.free_memory),
                    limits.total_memory,
                ),
                None => (system.used_memory(), system.total_memory()),
            };
            (usage, total, system.cpus().len())
        };

        let (disk_usage, disk_total) = self.disk_reading();
        let gpus = self.gpu_inventory().await;

        SystemStats {
            cpu_usage: *self.cpu_usage.read(),
            memory_usage,
            memory_total,
            disk_usage,
            disk_total,
            cpu_count,
            architecture: std::env::consts::ARCH.to_string(),
            platform: std::env::consts::OS.to_string(),
            hostname: System::host_name().unwrap_or_default(),
            gpu_count: gpus.len(),
            gpus,
        }
    }

    /// Reads usage of the root-most data disk, remembering which mount
    /// was chosen so later readings stay comparable.
    fn disk_reading(&self) -> (u64, u64) {
        let disks = Disks::new_with_refreshed_list();
        let cached = self.disk_mount.read().clone();
        let chosen = match cached {
            Some(mount) => disks
                .iter()
                .find(|disk| disk.mount_point() == mount.as_path()),
            None => disks
                .iter()
                .find(|disk| disk.mount_point() == std::path::Path::new("/"))
                .or_else(|| disks.iter().max_by_key(|disk| disk.total_space())),
        };
        match chosen {
            Some(disk) => {
                *self.disk_mount.write() = Some(disk.mount_point().to_path_buf());
                let total = disk.total_space();
                (total.saturating_sub(disk.available_space()), total)
            }
            None => (0, 0),
        }
    }

    /// GPU inventory, probed once and cached. Hosts without `nvidia-smi`
    /// report an empty list.
    async fn gpu_inventory(&self) -> Vec<GpuStats> {
        if let Some(cached) = self.gpus.read().clone() {
            return cached;
        }
        let probed = probe_nvidia_smi().await.unwrap_or_default();
        *self.gpus.write() = Some(probed.clone());
        probed
    }
}

async fn probe_nvidia_smi() -> Option<Vec<GpuStats>> {
    let output = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!("nvidia-smi probe failed");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut gpus = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            continue;
        }
        let (Ok(index), Ok(used), Ok(total)) = (
            fields[0].parse::<u32>(),
            fields[2].parse::<u64>(),
            fields[3].parse::<u64>(),
        ) else {
            continue;
        };
        gpus.push(GpuStats {
            name: fields[1].to_string(),
            index,
            // nvidia-smi reports MiB with nounits.
            memory_used: used * 1024 * 1024,
            memory_total: total * 1024 * 1024,
        });
    }
    Some(gpus)
}

/// Spawns the collector graph for one `system/stats` hub: the 1 s CPU
/// sampler, the snapshot broadcast at `interval` (clamped to ≥ 1 s), and
/// a keepalive ping at nine tenths of the pong wait.
pub fn spawn_system_stats(
    collector: Arc<SystemStatsCollector>,
    hub: Arc<Hub>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = interval.max(MIN_BROADCAST_INTERVAL);
    tokio::spawn(async move {
        let mut cpu_tick = tokio::time::interval(CPU_SAMPLE_INTERVAL);
        let mut broadcast_tick = tokio::time::interval(interval);
        let mut ping_tick = tokio::time::interval(PONG_WAIT * 9 / 10);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = cpu_tick.tick() => collector.sample_cpu(),
                _ = broadcast_tick.tick() => {
                    let stats = collector.snapshot().await;
                    match serde_json::to_string(&stats) {
                        Ok(text) => {
                            if hub.broadcast(Frame::Text(text)).is_err() {
                                trace!("system stats frame dropped");
                            }
                        }
                        Err(err) => debug!(error = %err, "system stats not serializable"),
                    }
                }
                _ = ping_tick.tick() => {
                    let _ = hub.broadcast(Frame::Ping);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_has_host_facts_and_wire_shape() {
        let collector = SystemStatsCollector::new();
        collector.sample_cpu();
        let stats = collector.snapshot().await;
        assert!(stats.memory_total > 0);
        assert!(stats.cpu_count >= 1);
        assert_eq!(stats.gpu_count, stats.gpus.len());

        let json = serde_json::to_value(&stats).unwrap();
        for key in [
            "cpuUsage",
            "memoryUsage",
            "memoryTotal",
            "diskUsage",
            "diskTotal",
            "cpuCount",
            "architecture",
            "platform",
            "hostname",
            "gpuCount",
            "gpus",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }

    #[tokio::test]
    async fn collector_stops_on_cancel() {
        let (hub, _task) = crate::hub::Hub::spawn(crate::hub::HubConfig::default(), || {});
        let cancel = CancellationToken::new();
        let task = spawn_system_stats(
            Arc::new(SystemStatsCollector::new()),
            hub,
            Duration::from_secs(1),
            cancel.clone(),
        );
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("collector did not stop")
            .unwrap();
    }
}
