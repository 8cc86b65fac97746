//! CFS burst updates for container cgroups.
//!
//! Layout consumed under the configured root:
//!
//! ```text
//! <cgroup_root>/burstable/pod<UID>/
//! ├── <container-a>/
//! │   ├── cpu.cfs_quota_us   ← read, e.g. "100000\n"
//! │   └── cpu.cfs_burst_us   ← read and written, e.g. "50000"
//! └── <container-b>/
//!     └── ...
//! ```
//!
//! Pods and containers come and go while we look at them, so a missing pod
//! directory or quota file is a skip, never a failure.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub const CFS_QUOTA_FILE: &str = "cpu.cfs_quota_us";
pub const CFS_BURST_FILE: &str = "cpu.cfs_burst_us";

/// QoS class directory holding the pods we manage.
const BURSTABLE_DIR: &str = "burstable";

#[derive(Debug, derive_more::Display)]
pub enum CgroupError {
    #[display("pod cgroup directory {} is unavailable", path.display())]
    PodDirUnavailable { path: PathBuf, not_found: bool },
    #[display("failed to read {}", path.display())]
    ReadBurst { path: PathBuf },
    #[display("failed to write {}", path.display())]
    WriteBurst { path: PathBuf },
}

impl core::error::Error for CgroupError {}

impl CgroupError {
    /// The pod has no cgroup directory yet, or it is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PodDirUnavailable { not_found: true, .. })
    }
}

/// What happened to a single container directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerOutcome {
    /// No quota file, the container cgroup is not there (yet or anymore).
    Missing,
    /// Quota is `-1` or `0`, nothing to burst against.
    Unlimited,
    /// Quota or burst file holds something that is not an integer.
    Malformed,
    /// Burst already holds the target value.
    Unchanged,
    /// Burst differs from the target; written unless in dry-run mode.
    Updated { from: i64, to: i64 },
}

/// Per-pod tally of container outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSummary {
    pub containers: usize,
    pub skipped: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub failed: usize,
}

impl PodSummary {
    fn record(&mut self, outcome: &ContainerOutcome) {
        self.containers += 1;
        match outcome {
            ContainerOutcome::Missing
            | ContainerOutcome::Unlimited
            | ContainerOutcome::Malformed => self.skipped += 1,
            ContainerOutcome::Unchanged => self.unchanged += 1,
            ContainerOutcome::Updated { .. } => self.updated += 1,
        }
    }
}

/// `quota * percent / 100`, truncated.
pub fn target_burst(quota: i64, percent: u32) -> i64 {
    quota.saturating_mul(i64::from(percent)) / 100
}

/// Reads quota and burst files of container cgroups and rewrites the burst value.
#[derive(Debug, Clone)]
pub struct BurstUpdater {
    cgroup_root: PathBuf,
    dry_run: bool,
}

impl BurstUpdater {
    pub fn new(cgroup_root: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            dry_run,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// `<cgroup_root>/burstable/pod<UID>`
    pub fn pod_dir(&self, pod_uid: &str) -> PathBuf {
        self.cgroup_root
            .join(BURSTABLE_DIR)
            .join(format!("pod{pod_uid}"))
    }

    /// Apply `percent` to every container directory of the pod.
    ///
    /// A container whose burst file cannot be read or written is recorded as
    /// failed and its siblings are still processed; all such failures are
    /// returned together once the pod is done.
    ///
    /// # Errors
    ///
    /// - [`CgroupError::PodDirUnavailable`] if the pod directory cannot be listed
    /// - [`CgroupError::ReadBurst`] / [`CgroupError::WriteBurst`] for container failures
    pub fn update_pod(
        &self,
        pod_uid: &str,
        percent: u32,
    ) -> Result<PodSummary, Report<CgroupError>> {
        let pod_dir = self.pod_dir(pod_uid);
        let mut container_dirs = list_container_dirs(&pod_dir).map_err(|e| {
            let not_found = e.kind() == io::ErrorKind::NotFound;
            Report::new(e).change_context(CgroupError::PodDirUnavailable {
                path: pod_dir.clone(),
                not_found,
            })
        })?;
        container_dirs.sort();

        let mut summary = PodSummary::default();
        let mut failures: Option<Report<CgroupError>> = None;

        for dir in &container_dirs {
            match self.update_container(dir, percent) {
                Ok(outcome) => summary.record(&outcome),
                Err(report) => {
                    summary.containers += 1;
                    summary.failed += 1;
                    match failures.as_mut() {
                        Some(failures) => failures.extend_one(report),
                        None => failures = Some(report),
                    }
                }
            }
        }

        match failures {
            Some(failures) => Err(failures.attach_printable(format!("{summary:?}"))),
            None => Ok(summary),
        }
    }

    /// Compute and, when it differs, write the burst value of one container.
    ///
    /// # Errors
    ///
    /// - [`CgroupError::ReadBurst`] if the quota file exists but the burst file cannot be read
    /// - [`CgroupError::WriteBurst`] if the new value cannot be written
    pub fn update_container(
        &self,
        container_dir: &Path,
        percent: u32,
    ) -> Result<ContainerOutcome, Report<CgroupError>> {
        let quota_path = container_dir.join(CFS_QUOTA_FILE);
        let Ok(raw_quota) = fs::read_to_string(&quota_path) else {
            return Ok(ContainerOutcome::Missing);
        };
        let Some(quota) = parse_value(&raw_quota, &quota_path) else {
            return Ok(ContainerOutcome::Malformed);
        };
        if quota <= 0 {
            return Ok(ContainerOutcome::Unlimited);
        }

        let target = target_burst(quota, percent);

        let burst_path = container_dir.join(CFS_BURST_FILE);
        let raw_burst = fs::read_to_string(&burst_path).change_context(CgroupError::ReadBurst {
            path: burst_path.clone(),
        })?;
        let Some(current) = parse_value(&raw_burst, &burst_path) else {
            return Ok(ContainerOutcome::Malformed);
        };

        debug!(
            file = %burst_path.display(),
            quota,
            percent,
            current,
            target,
            "container burst"
        );

        if current == target {
            return Ok(ContainerOutcome::Unchanged);
        }

        if self.dry_run {
            info!(
                file = %burst_path.display(),
                from = current,
                to = target,
                "dry run, burst not written"
            );
        } else {
            match write_value(&burst_path, target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %burst_path.display(), "container gone before burst write");
                    return Ok(ContainerOutcome::Missing);
                }
                Err(e) => {
                    return Err(Report::new(e).change_context(CgroupError::WriteBurst {
                        path: burst_path.clone(),
                    }));
                }
            }
            info!(
                file = %burst_path.display(),
                from = current,
                to = target,
                "burst updated"
            );
        }

        Ok(ContainerOutcome::Updated {
            from: current,
            to: target,
        })
    }
}

fn list_container_dirs(pod_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(pod_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn parse_value(raw: &str, path: &Path) -> Option<i64> {
    match raw.trim().parse::<i64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(file = %path.display(), content = raw, "malformed cgroup value: {e}");
            None
        }
    }
}

fn write_value(path: &Path, value: i64) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.to_string().as_bytes())
}
