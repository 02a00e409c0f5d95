//! File-Change Watcher.
//!
//! OS events from `notify` are forwarded over an unbounded channel into a
//! single async loop that owns the [`Runner`]. The loop is the only place
//! cycles start, so at most one is ever in flight: changes that arrive while
//! one runs are buffered and folded into `changeImpact` afterwards.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::FutureExt;
use notify::{Event, EventKind, RecommendedWatcher, Watcher as _};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::WatchMode;
use crate::recovery;
use crate::runner::{panic_message, CycleReport, Runner};

pub mod classify;
pub mod state;

pub use classify::{watch_targets, ChangeClassifier};
pub use state::{ChangeAction, ChangeClass, Debouncer, FireAction, Phase};

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStats {
    pub changes_seen: u64,
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub alerts: u64,
}

enum WatchEvent {
    Shutdown,
    Change(PathBuf),
    Deadline,
}

pub struct Watcher {
    runner: Runner,
    debouncer: Debouncer,
    classifier: ChangeClassifier,
    mode: WatchMode,
    alert_threshold: u32,
    root: PathBuf,
    tx: mpsc::UnboundedSender<PathBuf>,
    rx: mpsc::UnboundedReceiver<PathBuf>,
    fs_watcher: Option<RecommendedWatcher>,
    shutdown: CancellationToken,
    stats: WatchStats,
}

impl Watcher {
    pub fn new(runner: Runner) -> Result<Self> {
        let config = runner.config();
        let watch = &config.watch;
        // notify reports paths under whatever root it was given; use the
        // canonical one so classification can strip it.
        let root = std::fs::canonicalize(&config.target.workdir)
            .unwrap_or_else(|_| config.target.workdir.clone());

        // Saving memory must not look like a source change.
        let memory = config.memory_path();
        let memory = memory
            .parent()
            .and_then(|dir| std::fs::canonicalize(dir).ok())
            .zip(memory.file_name())
            .map(|(dir, name)| dir.join(name))
            .unwrap_or(memory);
        let classifier = ChangeClassifier::new(root.clone(), watch)?
            .ignoring(crate::memory::temp_path(&memory))
            .ignoring(memory);
        let debouncer = Debouncer::new(
            std::time::Duration::from_millis(watch.debounce_ms),
            watch.critical_debounce_factor,
            std::time::Duration::from_millis(watch.min_interval_ms),
        );
        let mode = watch.mode;
        let alert_threshold = watch.alert_threshold;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            runner,
            debouncer,
            classifier,
            mode,
            alert_threshold,
            root,
            tx,
            rx,
            fs_watcher: None,
            shutdown: CancellationToken::new(),
            stats: WatchStats::default(),
        })
    }

    /// Inject change events without going through the OS watcher.
    pub fn sender(&self) -> mpsc::UnboundedSender<PathBuf> {
        self.tx.clone()
    }

    /// Cancelling this token stops [`Watcher::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn stats(&self) -> WatchStats {
        self.stats
    }

    /// Register the configured patterns with the OS and print current health.
    pub fn init(&mut self) -> Result<()> {
        let tx = self.tx.clone();
        let mut fs_watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            },
            notify::Config::default(),
        )
        .context("failed to create file watcher")?;

        let mut registered = 0usize;
        for (relative, mode) in watch_targets(&self.runner.config().watch.patterns) {
            let path = if relative.as_os_str().is_empty() {
                self.root.clone()
            } else {
                self.root.join(&relative)
            };
            if !path.exists() {
                debug!(path = %path.display(), "watch target missing, skipping");
                continue;
            }
            fs_watcher
                .watch(&path, mode)
                .with_context(|| format!("failed to watch {}", path.display()))?;
            registered += 1;
        }
        if registered == 0 {
            warn!(root = %self.root.display(), "no watch targets exist yet");
        }

        self.fs_watcher = Some(fs_watcher);
        info!(
            root = %self.root.display(),
            targets = registered,
            mode = ?self.mode,
            "watching for changes"
        );
        self.runner.init();
        Ok(())
    }

    /// Event loop. Returns when the shutdown token is cancelled.
    pub async fn run(&mut self) -> Result<WatchStats> {
        loop {
            let deadline = self.debouncer.deadline();
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => WatchEvent::Shutdown,
                path = self.rx.recv() => match path {
                    Some(path) => WatchEvent::Change(path),
                    None => WatchEvent::Shutdown,
                },
                _ = sleep_until(deadline) => WatchEvent::Deadline,
            };

            match event {
                WatchEvent::Shutdown => break,
                WatchEvent::Change(path) => self.on_change(path),
                WatchEvent::Deadline => match self.debouncer.fire(Instant::now()) {
                    FireAction::Run => {
                        if self.run_cycle().await {
                            break;
                        }
                    }
                    FireAction::RateLimited { wait } => {
                        self.stats.cycles_skipped += 1;
                        info!(
                            wait_ms = wait.as_millis() as u64,
                            "previous cycle finished too recently, skipping"
                        );
                    }
                    FireAction::NotDue => {}
                },
            }
        }

        info!(
            changes = self.stats.changes_seen,
            cycles = self.stats.cycles_run,
            skipped = self.stats.cycles_skipped,
            "watcher stopped"
        );
        Ok(self.stats)
    }

    fn on_change(&mut self, path: PathBuf) {
        let class = self.classifier.classify(&path);
        match self.debouncer.on_change(Instant::now(), class) {
            ChangeAction::Ignored => {
                trace!(path = %path.display(), "ignored change");
            }
            ChangeAction::Armed(deadline) => {
                self.stats.changes_seen += 1;
                debug!(
                    path = %path.display(),
                    critical = class == ChangeClass::Critical,
                    in_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "change detected, debounce armed"
                );
                self.runner.record_change(&path);
                if let Err(e) = self.runner.save() {
                    warn!(error = %e, "failed to save health memory");
                }
            }
            ChangeAction::Deferred => {
                // Only reachable from run_cycle.
                self.stats.changes_seen += 1;
            }
        }
    }

    /// Run one cycle while buffering changes. Returns true when shutdown
    /// interrupted it.
    async fn run_cycle(&mut self) -> bool {
        info!("running probe cycle");
        let mut deferred: Vec<PathBuf> = Vec::new();

        let outcome = {
            let cycle = AssertUnwindSafe(self.runner.run_all_tests()).catch_unwind();
            tokio::pin!(cycle);
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break None,
                    res = &mut cycle => break Some(res),
                    Some(path) = self.rx.recv() => {
                        let class = self.classifier.classify(&path);
                        if self.debouncer.on_change(Instant::now(), class) == ChangeAction::Deferred {
                            self.stats.changes_seen += 1;
                            deferred.push(path);
                        }
                    }
                }
            }
        };
        self.debouncer.finish(Instant::now());

        let Some(outcome) = outcome else {
            info!("probe cycle interrupted by shutdown");
            return true;
        };
        self.stats.cycles_run += 1;

        let report = match outcome {
            Ok(Ok(report)) => {
                self.runner.display_results(&report);
                Some(report)
            }
            Ok(Err(e)) => {
                self.runner.record_failure(&format!("{e:#}"));
                None
            }
            Err(panic) => {
                self.runner
                    .record_failure(&format!("cycle panicked: {}", panic_message(&*panic)));
                None
            }
        };

        if !deferred.is_empty() {
            debug!(count = deferred.len(), "recording changes seen during cycle");
            for path in &deferred {
                self.runner.record_change(path);
            }
            if let Err(e) = self.runner.save() {
                warn!(error = %e, "failed to save health memory");
            }
        }

        self.check_alert(report.as_ref());
        false
    }

    fn check_alert(&mut self, report: Option<&CycleReport>) {
        if self.mode != WatchMode::Smart {
            return;
        }
        let fails = self.runner.store().memory().consecutive_fails;
        if fails == 0 || fails < self.alert_threshold {
            return;
        }

        self.stats.alerts += 1;
        warn!(
            consecutive_fails = fails,
            threshold = self.alert_threshold,
            "probe cycles keep failing"
        );
        println!("\n!!! {} consecutive failing cycles !!!", fails);
        match report {
            Some(report) => {
                self.runner.generate_recovery_plan(report);
            }
            None => {
                let steps = self.runner.recovery_for_last_run();
                recovery::print_plan(&steps);
                self.runner.try_auto_fix();
            }
        }
    }

    /// Stop OS notifications, drop any pending window and persist memory.
    pub fn shutdown(&mut self) -> Result<()> {
        self.fs_watcher.take();
        self.debouncer.cancel();
        self.runner.shutdown()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmokeConfig;
    use crate::memory::HealthStore;
    use crate::probes::testing::ScriptedProbe;
    use crate::probes::ProbeSet;

    fn watcher(dir: &tempfile::TempDir) -> Watcher {
        let mut config = SmokeConfig::default();
        config.target.workdir = dir.path().to_path_buf();
        let store = HealthStore::load(config.memory_path(), 30);
        let probes = ProbeSet::new().with(ScriptedProbe::new("p", true));
        Watcher::new(Runner::new(config, probes, store)).unwrap()
    }

    #[tokio::test]
    async fn test_init_and_shutdown_persist_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/app")).unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let mut w = watcher(&dir);
        w.init().unwrap();
        assert!(w.fs_watcher.is_some());

        w.shutdown().unwrap();
        assert!(w.fs_watcher.is_none());
        assert!(w.runner().store().path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_changes_never_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut w = watcher(&dir);
        let tx = w.sender();
        let token = w.shutdown_token();

        let driver = async move {
            tx.send(dir.path().join("README.md")).unwrap();
            tx.send(dir.path().join("node_modules/x/index.js")).unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            token.cancel();
        };
        let (stats, ()) = tokio::join!(w.run(), driver);
        let stats = stats.unwrap();
        assert_eq!(stats.changes_seen, 0);
        assert_eq!(stats.cycles_run, 0);
    }

    #[tokio::test]
    async fn test_literal_file_created_by_rename_after_init_is_seen() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut w = watcher(&dir);
        w.init().unwrap();

        // Not present at init; arrives the way editors save.
        let staged = dir.path().join("package.json.swp");
        std::fs::write(&staged, "{}").unwrap();
        std::fs::rename(&staged, dir.path().join("package.json")).unwrap();

        let seen = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Some(path) = w.rx.recv().await {
                if path.file_name().is_some_and(|n| n == "package.json") {
                    return Some(path);
                }
            }
            None
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(w.classifier.classify(&seen), ChangeClass::Critical);
        w.shutdown().unwrap();
    }
}
