//! Runner / Reporter: one end-to-end probe cycle.
//!
//! The runner owns the probe set, the health store and the recovery advisor.
//! A cycle is: run probes -> `record_run` -> reset the change counter when
//! everything passed -> `save`. Memory is written once, after all results
//! are folded in.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::SmokeConfig;
use crate::memory::{HealthReport, HealthStore};
use crate::probes::{BuildStatus, ProbeResult, ProbeSet};
use crate::recovery::{self, RecoveryAdvisor, RecoveryStep, Remediation};

/// Everything one cycle produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub passed: bool,
    pub passed_count: usize,
    pub failed_count: usize,
    pub results: Vec<ProbeResult>,
    pub build: BuildStatus,
    pub health: HealthReport,
}

impl CycleReport {
    /// Process exit code: 0 when every probe passed, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.passed {
            0
        } else {
            1
        }
    }
}

pub struct Runner {
    config: SmokeConfig,
    probes: ProbeSet,
    store: HealthStore,
    advisor: RecoveryAdvisor,
}

impl Runner {
    pub fn new(config: SmokeConfig, probes: ProbeSet, store: HealthStore) -> Self {
        let advisor = RecoveryAdvisor::new(&config.recovery);
        Self {
            config,
            probes,
            store,
            advisor,
        }
    }

    /// Build the configured probe set and load the memory file.
    pub fn from_config(config: SmokeConfig) -> Result<Self> {
        let probes = ProbeSet::from_config(&config).context("failed to build probe set")?;
        let store = HealthStore::load(config.memory_path(), config.memory.history_cap);
        Ok(Self::new(config, probes, store))
    }

    pub fn config(&self) -> &SmokeConfig {
        &self.config
    }

    pub fn store(&self) -> &HealthStore {
        &self.store
    }

    pub fn advisor(&self) -> &RecoveryAdvisor {
        &self.advisor
    }

    pub fn health(&self) -> HealthReport {
        self.store.health_report(self.config.memory.pass_rate_window)
    }

    /// Print the health carried over from previous runs.
    pub fn init(&self) {
        info!(
            memory = %self.store.path().display(),
            probes = self.probes.len(),
            base_url = %self.config.target.base_url,
            "runner initialized"
        );
        println!("\n=== smokewatch: current health ===");
        self.health().print();
        println!();
    }

    /// Run one full cycle and persist the outcome.
    pub async fn run_all_tests(&mut self) -> Result<CycleReport> {
        let outcome = self.probes.run().await;
        let passed = outcome.all_passed();

        self.store.record_run(&outcome.results, outcome.build);
        if passed {
            self.store.reset_change_counter();
        }
        self.store.save().context("failed to save health memory")?;

        let passed_count = outcome.results.iter().filter(|r| r.passed).count();
        Ok(CycleReport {
            passed,
            passed_count,
            failed_count: outcome.results.len() - passed_count,
            results: outcome.results,
            build: outcome.build,
            health: self.health(),
        })
    }

    /// [`Runner::run_all_tests`] with a panic inside the cycle recorded as a
    /// failed run and returned as an error.
    pub async fn run_isolated(&mut self) -> Result<CycleReport> {
        let outcome = AssertUnwindSafe(self.run_all_tests()).catch_unwind().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = format!("cycle panicked: {}", panic_message(&*panic));
                self.record_failure(&message);
                Err(anyhow!(message))
            }
        }
    }

    pub fn display_results(&self, report: &CycleReport) {
        let verbose = self.config.logging.verbose;

        println!("\nsmokewatch probe results");
        println!("{:<25} | {:<10} | Details", "Probe", "Status");
        println!("{:-<25}-|-{:-<10}-|-{:-<40}", "", "", "");
        for r in &report.results {
            let status = if r.passed { "PASS" } else { "FAIL" };
            let details = if r.passed && !verbose {
                ""
            } else {
                r.details.as_str()
            };
            match r.duration_ms {
                Some(ms) if verbose => {
                    println!("{:<25} | {:<10} | {} ({}ms)", r.name, status, details, ms)
                }
                _ => println!("{:<25} | {:<10} | {}", r.name, status, details),
            }
        }

        println!(
            "\nPassed: {}/{}",
            report.passed_count,
            report.results.len()
        );
        if !report.build.server_running {
            println!("Server:      DOWN");
        }
        if !report.build.css_working {
            println!("Stylesheet:  BROKEN");
        }
        report.health.print();
        println!();
    }

    /// Print remediation steps for the failed probes of `report`, then try
    /// the bounded auto-fix when enabled.
    pub fn generate_recovery_plan(&mut self, report: &CycleReport) -> Vec<RecoveryStep> {
        let steps = self.advisor.plan(&report.results);
        recovery::print_plan(&steps);
        if !steps.is_empty() {
            self.try_auto_fix();
        }
        steps
    }

    /// Recovery plan for the failures recorded by the most recent run.
    pub fn recovery_for_last_run(&self) -> Vec<RecoveryStep> {
        let failures = self.store.last_failures();
        self.advisor
            .plan_for(failures.iter().map(|(name, kind)| (name.as_str(), *kind)))
    }

    /// Run the bounded auto-fix if it is enabled. Each attempt is counted
    /// and persisted.
    pub fn try_auto_fix(&mut self) -> Option<Remediation> {
        if !self.advisor.auto_fix_enabled() {
            return None;
        }
        let outcome = self
            .advisor
            .auto_remediate(&self.config.target.workdir, &self.store.memory().build_health);
        println!("{}", outcome);
        if outcome.attempted() {
            self.store.record_auto_fix();
            if let Err(e) = self.store.save() {
                warn!(error = %e, "failed to save health memory after auto-fix");
            }
        }
        Some(outcome)
    }

    pub fn record_change(&mut self, path: &Path) {
        self.store.record_change(path);
    }

    /// Record a cycle that errored out before producing results.
    pub fn record_failure(&mut self, message: &str) {
        error!(error = %message, "probe cycle failed");
        self.store.record_failure(message);
        if let Err(e) = self.store.save() {
            warn!(error = %e, "failed to save health memory after cycle failure");
        }
    }

    pub fn save(&self) -> Result<()> {
        self.store.save()
    }

    /// Final save.
    pub fn shutdown(&self) -> Result<()> {
        self.store.save()?;
        info!(memory = %self.store.path().display(), "runner shut down");
        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvFlag;
    use crate::memory::HealthStatus;
    use crate::probes::testing::ScriptedProbe;
    use crate::probes::{Probe, ProbeError, ProbeKind};
    use std::any::Any;
    use std::sync::atomic::Ordering;

    struct Exploding;

    #[async_trait::async_trait]
    impl Probe for Exploding {
        fn name(&self) -> &str {
            "Exploding"
        }

        fn kind(&self) -> ProbeKind {
            ProbeKind::Http
        }

        async fn check(&self) -> Result<String, ProbeError> {
            panic!("checker blew up")
        }
    }

    fn runner(dir: &tempfile::TempDir, probes: ProbeSet) -> Runner {
        let mut config = SmokeConfig::default();
        config.target.workdir = dir.path().to_path_buf();
        let store = HealthStore::load(config.memory_path(), config.memory.history_cap);
        Runner::new(config, probes, store)
    }

    #[tokio::test]
    async fn test_fresh_memory_two_pass_one_fail() {
        let dir = tempfile::TempDir::new().unwrap();
        let probes = ProbeSet::new()
            .with(ScriptedProbe::new("Critical Files", true))
            .with(ScriptedProbe::new("Package Manifest", true).kind(ProbeKind::Config))
            .with(ScriptedProbe::new("Build Directory", false));
        let mut r = runner(&dir, probes);

        let report = r.run_all_tests().await.unwrap();
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.passed_count, 2);
        assert_eq!(report.failed_count, 1);

        let reloaded = HealthStore::load(r.store().path(), 30);
        let m = reloaded.memory();
        assert_eq!(m.total_runs, 1);
        assert_eq!(m.consecutive_fails, 1);
        assert_eq!(m.consecutive_passes, 0);
        assert_eq!(m.test_history.len(), 1);
        assert!(!m.test_history[0].passed);
    }

    #[tokio::test]
    async fn test_all_pass_exit_zero_and_healthy() {
        let dir = tempfile::TempDir::new().unwrap();
        let probes = ProbeSet::new()
            .with(ScriptedProbe::new("Health Endpoint", true).flag(EnvFlag::Server))
            .with(ScriptedProbe::new("Stylesheet", true).flag(EnvFlag::Stylesheet));
        let mut r = runner(&dir, probes);

        let report = r.run_all_tests().await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.health.status, HealthStatus::Healthy);
        assert_eq!(report.health.pass_rate, 100.0);
    }

    #[tokio::test]
    async fn test_change_counter_reset_only_after_passing_cycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let failing = ProbeSet::new().with(ScriptedProbe::new("p", false));
        let mut r = runner(&dir, failing);

        r.record_change(Path::new("src/app/page.tsx"));
        r.run_all_tests().await.unwrap();
        assert_eq!(r.store().memory().change_impact.changes_without_testing, 1);

        let mut r = runner(&dir, ProbeSet::new().with(ScriptedProbe::new("p", true)));
        assert_eq!(r.store().memory().total_runs, 1);
        r.run_all_tests().await.unwrap();
        assert_eq!(r.store().memory().change_impact.changes_without_testing, 0);
    }

    #[tokio::test]
    async fn test_each_cycle_runs_every_probe_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = ScriptedProbe::new("p", true);
        let calls = probe.calls.clone();
        let mut r = runner(&dir, ProbeSet::new().with(probe));

        r.run_all_tests().await.unwrap();
        r.run_all_tests().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.store().memory().consecutive_passes, 2);
    }

    #[tokio::test]
    async fn test_recovery_plan_for_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let probes = ProbeSet::new()
            .with(ScriptedProbe::new("Critical Files", true))
            .with(ScriptedProbe::new("Build Directory", false));
        let mut r = runner(&dir, probes);

        let report = r.run_all_tests().await.unwrap();
        let steps = r.generate_recovery_plan(&report);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].probe, "Build Directory");

        let from_memory = r.recovery_for_last_run();
        assert_eq!(from_memory, steps);
    }

    #[test]
    fn test_record_failure_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut r = runner(&dir, ProbeSet::new());
        r.record_failure("probe set panicked");

        let reloaded = HealthStore::load(r.store().path(), 30);
        assert_eq!(reloaded.memory().consecutive_fails, 1);
        assert_eq!(reloaded.memory().total_runs, 1);
    }

    #[tokio::test]
    async fn test_untagged_failures_clear_cache_at_most_limit_times() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = SmokeConfig::default();
        config.target.workdir = dir.path().to_path_buf();
        config.recovery.auto_fix = true;
        config.recovery.max_auto_fixes = 3;
        let store = HealthStore::load(config.memory_path(), config.memory.history_cap);
        let probes =
            ProbeSet::new().with(ScriptedProbe::new("Dev Server", false).kind(ProbeKind::Process));
        let mut r = Runner::new(config, probes, store);

        let mut cleared = 0;
        for _ in 0..10 {
            std::fs::create_dir_all(dir.path().join(".next")).unwrap();
            let report = r.run_all_tests().await.unwrap();
            assert_eq!(r.store().memory().build_health.build_failures, 0);
            r.generate_recovery_plan(&report);
            if !dir.path().join(".next").exists() {
                cleared += 1;
            }
        }
        assert_eq!(cleared, 3);

        let reloaded = HealthStore::load(r.store().path(), 30);
        assert_eq!(reloaded.memory().build_health.auto_fixes, 3);
    }

    #[tokio::test]
    async fn test_auto_fix_budget_restored_after_passing_cycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = SmokeConfig::default();
        config.target.workdir = dir.path().to_path_buf();
        config.recovery.auto_fix = true;
        config.recovery.max_auto_fixes = 1;
        let store = HealthStore::load(config.memory_path(), config.memory.history_cap);
        let failing = ProbeSet::new().with(ScriptedProbe::new("p", false));
        let mut r = Runner::new(config.clone(), failing, store);

        std::fs::create_dir_all(dir.path().join(".next")).unwrap();
        r.run_all_tests().await.unwrap();
        assert!(matches!(r.try_auto_fix(), Some(Remediation::Cleared(_))));
        std::fs::create_dir_all(dir.path().join(".next")).unwrap();
        assert!(matches!(r.try_auto_fix(), Some(Remediation::LimitReached { .. })));

        let store = HealthStore::load(config.memory_path(), config.memory.history_cap);
        let passing = ProbeSet::new().with(ScriptedProbe::new("p", true));
        let mut r = Runner::new(config, passing, store);
        r.run_all_tests().await.unwrap();
        assert!(matches!(r.try_auto_fix(), Some(Remediation::Cleared(_))));
    }

    #[tokio::test]
    async fn test_panicking_cycle_becomes_recorded_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut r = runner(&dir, ProbeSet::new().with(Exploding));

        let err = r.run_isolated().await.unwrap_err();
        assert_eq!(err.to_string(), "cycle panicked: checker blew up");

        let reloaded = HealthStore::load(r.store().path(), 30);
        let m = reloaded.memory();
        assert_eq!(m.total_runs, 1);
        assert_eq!(m.consecutive_fails, 1);
        assert_eq!(
            m.test_history[0].probes[0].name,
            crate::memory::CYCLE_FAILURE_PROBE
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
