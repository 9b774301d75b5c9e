// src/core/score.rs

//! Computes the scalar load score a node reports during elections and score
//! reporting. Lower is better; scores are only comparable within a cluster.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, System};
use tracing::warn;

/// A point-in-time load summary for one node. Sent inside vote requests and
/// periodic score reports.
#[derive(
    Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, Default, PartialEq,
)]
pub struct ResourceScore {
    pub server_id: String,
    pub score: f64,
    pub load_avg: f64,
    pub io_wait: f64,
    pub net_usage_mb: f64,
    pub shards_storage_mb: f64,
}

impl ResourceScore {
    /// Folds the raw telemetry into the weighted scalar. Each component is
    /// capped so a single runaway metric cannot dominate.
    pub fn from_telemetry(
        server_id: String,
        load_avg: f64,
        io_wait: f64,
        net_usage_mb: f64,
        shards_storage_mb: f64,
    ) -> Self {
        let score = 0.3 * (load_avg * 10.0).min(100.0)
            + 0.2 * io_wait
            + 0.1 * net_usage_mb.min(100.0)
            + 0.4 * shards_storage_mb.min(100.0);
        Self {
            server_id,
            score,
            load_avg,
            io_wait,
            net_usage_mb,
            shards_storage_mb,
        }
    }
}

/// Produces and caches `ResourceScore` snapshots for the local node.
pub struct ResourceScorer {
    server_id: String,
    shards_dir: PathBuf,
    update_interval: Duration,
    cached: Mutex<Option<(ResourceScore, Instant)>>,
}

impl ResourceScorer {
    pub fn new(server_id: String, shards_dir: PathBuf, update_interval: Duration) -> Self {
        Self {
            server_id,
            shards_dir,
            update_interval,
            cached: Mutex::new(None),
        }
    }

    /// Returns the current score, recomputing it when the cache is stale or
    /// `force_fresh` is set. Telemetry collection touches the filesystem and
    /// so runs on the blocking pool.
    pub async fn snapshot(&self, force_fresh: bool) -> ResourceScore {
        if !force_fresh {
            let cached = self.cached.lock();
            if let Some((score, taken_at)) = cached.as_ref() {
                if taken_at.elapsed() < self.update_interval {
                    return score.clone();
                }
            }
        }

        let server_id = self.server_id.clone();
        let shards_dir = self.shards_dir.clone();
        let score = match tokio::task::spawn_blocking(move || collect_score(server_id, &shards_dir))
            .await
        {
            Ok(score) => score,
            Err(e) => {
                warn!("Score collection task failed: {e}; reusing last snapshot");
                let cached = self.cached.lock();
                return cached
                    .as_ref()
                    .map(|(score, _)| score.clone())
                    .unwrap_or_else(|| ResourceScore {
                        server_id: self.server_id.clone(),
                        ..Default::default()
                    });
            }
        };

        *self.cached.lock() = Some((score.clone(), Instant::now()));
        score
    }
}

fn collect_score(server_id: String, shards_dir: &Path) -> ResourceScore {
    // Zero on platforms without a load-average primitive.
    let load_avg = System::load_average().one;
    let io_wait = io_wait_percent();

    let networks = Networks::new_with_refreshed_list();
    let net_bytes: u64 = networks
        .list()
        .iter()
        .map(|(_, data)| data.total_received() + data.total_transmitted())
        .sum();
    let net_usage_mb = net_bytes as f64 / (1024.0 * 1024.0);

    let shards_storage_mb = dir_size_bytes(shards_dir) as f64 / (1024.0 * 1024.0);

    ResourceScore::from_telemetry(server_id, load_avg, io_wait, net_usage_mb, shards_storage_mb)
}

/// Sums the sizes of regular files directly under `dir`. Missing or unreadable
/// directories count as empty.
fn dir_size_bytes(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

/// Cumulative I/O-wait share of CPU time, as a percentage.
#[cfg(target_os = "linux")]
fn io_wait_percent() -> f64 {
    let Ok(stat) = std::fs::read_to_string("/proc/stat") else {
        return 0.0;
    };
    let Some(cpu_line) = stat.lines().find(|l| l.starts_with("cpu ")) else {
        return 0.0;
    };
    let fields: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    // user nice system idle iowait ...
    if fields.len() < 5 {
        return 0.0;
    }
    let total: u64 = fields.iter().sum();
    if total == 0 {
        return 0.0;
    }
    fields[4] as f64 / total as f64 * 100.0
}

#[cfg(not(target_os = "linux"))]
fn io_wait_percent() -> f64 {
    0.0
}

/// Host-level figures for the stats RPC, gathered on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct HostTelemetry {
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub shards_disk_free_mb: u64,
    pub shards_disk_total_mb: u64,
    pub master_data_disk_free_mb: u64,
    pub master_data_disk_total_mb: u64,
}

pub fn collect_host_telemetry(shards_dir: &Path, master_data_dir: &Path) -> HostTelemetry {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();

    let memory_utilization = if sys.total_memory() > 0 {
        sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let (shards_free, shards_total) = disk_space_for(&disks, shards_dir);
    let (master_free, master_total) = disk_space_for(&disks, master_data_dir);

    HostTelemetry {
        cpu_utilization: sys.global_cpu_usage() as f64,
        memory_utilization,
        shards_disk_free_mb: shards_free / (1024 * 1024),
        shards_disk_total_mb: shards_total / (1024 * 1024),
        master_data_disk_free_mb: master_free / (1024 * 1024),
        master_data_disk_total_mb: master_total / (1024 * 1024),
    }
}

/// Picks the disk whose mount point is the longest prefix of `dir`.
fn disk_space_for(disks: &Disks, dir: &Path) -> (u64, u64) {
    let resolved = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    disks
        .list()
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| (disk.available_space(), disk.total_space()))
        .unwrap_or((0, 0))
}
