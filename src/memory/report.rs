//! Read-only health summary derived from a [`HealthMemory`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::HealthMemory;

/// Overall classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Environment flags good and the current streak is passing.
    Healthy,
    /// Environment flags good but the last run failed.
    Degraded,
    /// An environment flag is bad.
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Percentage of passing runs among the most recent `window`.
    pub pass_rate: f64,
    pub window: usize,
    pub total_runs: u64,
    pub consecutive_passes: u32,
    pub consecutive_fails: u32,
    pub build_failures: u32,
    pub changes_without_testing: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub last_clean_build: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub fn from_memory(memory: &HealthMemory, window: usize) -> Self {
        let status = if !memory.build_health.is_healthy() {
            HealthStatus::Critical
        } else if memory.consecutive_passes > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        let recent: Vec<bool> = memory
            .test_history
            .iter()
            .take(window)
            .map(|r| r.passed)
            .collect();
        let pass_rate = if recent.is_empty() {
            0.0
        } else {
            recent.iter().filter(|&&p| p).count() as f64 * 100.0 / recent.len() as f64
        };

        Self {
            status,
            pass_rate,
            window: recent.len(),
            total_runs: memory.total_runs,
            consecutive_passes: memory.consecutive_passes,
            consecutive_fails: memory.consecutive_fails,
            build_failures: memory.build_health.build_failures,
            changes_without_testing: memory.change_impact.changes_without_testing,
            last_run: memory.last_run,
            last_clean_build: memory.build_health.last_clean_build,
        }
    }

    /// Print the report in the console table style.
    pub fn print(&self) {
        println!("Health:      {}", self.status);
        println!(
            "Pass rate:   {:.0}% (last {} run(s))",
            self.pass_rate, self.window
        );
        println!(
            "Runs:        {} total, {} passing / {} failing in a row",
            self.total_runs, self.consecutive_passes, self.consecutive_fails
        );
        println!("Build fails: {}", self.build_failures);
        if self.changes_without_testing > 0 {
            println!("Untested:    {} change(s)", self.changes_without_testing);
        }
        match self.last_run {
            Some(t) => println!("Last run:    {}", t.to_rfc3339()),
            None => println!("Last run:    never"),
        }
    }
}
