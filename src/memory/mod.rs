//! Health Memory: the persisted record of probe-cycle outcomes.
//!
//! One JSON document per project. It is read once at start-up (falling back
//! to the default record when absent or unreadable), mutated once per cycle
//! and rewritten in full after each mutation via write-to-temp + rename.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::probes::{BuildStatus, ProbeKind, ProbeResult};

pub mod report;

pub use report::{HealthReport, HealthStatus};

/// The persisted record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub consecutive_passes: u32,
    pub consecutive_fails: u32,
    /// Most recent first.
    #[serde(deserialize_with = "lenient_history")]
    pub test_history: VecDeque<RunSummary>,
    pub build_health: BuildHealth,
    pub change_impact: ChangeImpact,
}

/// Trimmed summary of one cycle.
///
/// Entries written by older tools may lack any of these keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunSummary {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub passed: bool,
    pub passed_count: usize,
    pub failed_count: usize,
    pub probes: Vec<ProbeSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeSummary {
    pub name: String,
    pub kind: ProbeKind,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Keep the usable history entries and drop the rest, so one malformed
/// entry does not cost the whole record.
fn lenient_history<'de, D>(deserializer: D) -> Result<VecDeque<RunSummary>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(run) => Some(run),
            Err(e) => {
                debug!(error = %e, "skipping unreadable history entry");
                None
            }
        })
        .collect())
}

/// Last-known environment flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildHealth {
    pub server_running: bool,
    pub css_working: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_clean_build: Option<DateTime<Utc>>,
    pub build_failures: u32,
    /// Cache clears attempted since the last fully passing cycle.
    pub auto_fixes: u32,
}

impl BuildHealth {
    pub fn is_healthy(&self) -> bool {
        self.server_running && self.css_working
    }
}

/// Source changes observed since the last successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangeImpact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change_time: Option<DateTime<Utc>>,
    pub changes_without_testing: u32,
}

/// Sibling file a save writes before renaming over `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

/// Name used for the synthetic result recorded when a cycle itself fails.
pub const CYCLE_FAILURE_PROBE: &str = "Runner";

/// Owns the in-memory record and its backing file.
#[derive(Debug)]
pub struct HealthStore {
    path: PathBuf,
    cap: usize,
    memory: HealthMemory,
}

impl HealthStore {
    /// Read the record at `path`. Never fails: a missing or unparsable file
    /// means "no prior history".
    pub fn load(path: impl Into<PathBuf>, cap: usize) -> Self {
        let path = path.into();
        let memory = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HealthMemory>(&raw) {
                Ok(memory) => {
                    debug!(path = %path.display(), runs = memory.total_runs, "loaded health memory");
                    memory
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "health memory unreadable, starting fresh");
                    HealthMemory::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no health memory yet");
                HealthMemory::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read health memory, starting fresh");
                HealthMemory::default()
            }
        };

        Self {
            path,
            cap: cap.max(1),
            memory,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory(&self) -> &HealthMemory {
        &self.memory
    }

    /// Fold one cycle's results into the record.
    pub fn record_run(&mut self, results: &[ProbeResult], build: BuildStatus) {
        let now = Utc::now();
        let passed_count = results.iter().filter(|r| r.passed).count();
        let all_passed = passed_count == results.len();

        let m = &mut self.memory;
        m.total_runs += 1;
        m.last_run = Some(now);

        if all_passed {
            m.consecutive_passes += 1;
            m.consecutive_fails = 0;
            m.build_health.auto_fixes = 0;
        } else {
            m.consecutive_fails += 1;
            m.consecutive_passes = 0;
        }

        m.test_history.push_front(RunSummary {
            id: Uuid::new_v4(),
            timestamp: now,
            passed: all_passed,
            passed_count,
            failed_count: results.len() - passed_count,
            probes: results
                .iter()
                .map(|r| ProbeSummary {
                    name: r.name.clone(),
                    kind: r.kind,
                    passed: r.passed,
                    duration_ms: r.duration_ms,
                })
                .collect(),
        });
        m.test_history.truncate(self.cap);

        m.build_health.server_running = build.server_running;
        m.build_health.css_working = build.css_working;
        if build.is_healthy() {
            m.build_health.last_clean_build = Some(now);
        } else {
            m.build_health.build_failures += 1;
        }

        info!(
            total_runs = m.total_runs,
            passed = all_passed,
            consecutive_passes = m.consecutive_passes,
            consecutive_fails = m.consecutive_fails,
            "recorded run"
        );
    }

    /// Record a cycle that failed before producing probe results.
    pub fn record_failure(&mut self, message: &str) {
        let result = ProbeResult::fail(CYCLE_FAILURE_PROBE, ProbeKind::Process, message);
        // Environment flags are unknown; keep the last observed ones.
        let build = BuildStatus {
            server_running: self.memory.build_health.server_running,
            css_working: self.memory.build_health.css_working,
        };
        self.record_run(std::slice::from_ref(&result), build);
    }

    /// Count one automatic cache clear against the remediation limit.
    pub fn record_auto_fix(&mut self) {
        self.memory.build_health.auto_fixes += 1;
    }

    pub fn record_change(&mut self, path: &Path) {
        let impact = &mut self.memory.change_impact;
        impact.last_change = Some(path.display().to_string());
        impact.last_change_time = Some(Utc::now());
        impact.changes_without_testing += 1;
    }

    pub fn reset_change_counter(&mut self) {
        self.memory.change_impact.changes_without_testing = 0;
    }

    /// Names of probes that failed in the most recent run.
    pub fn last_failures(&self) -> Vec<(String, ProbeKind)> {
        self.memory
            .test_history
            .front()
            .map(|run| {
                run.probes
                    .iter()
                    .filter(|p| !p.passed)
                    .map(|p| (p.name.clone(), p.kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rewrite the backing file in full.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.memory)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let tmp_path = temp_path(&self.path);
        std::fs::write(&tmp_path, json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), "health memory saved");
        Ok(())
    }

    pub fn health_report(&self, window: usize) -> HealthReport {
        HealthReport::from_memory(&self.memory, window)
    }
}
