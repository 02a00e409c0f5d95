//! Recovery Advisor: failing probe -> remediation suggestions.
//!
//! Lookup is by exact probe name first (configured rules shadow the built-in
//! table), then by probe kind. The only side effect lives in
//! [`RecoveryAdvisor::auto_remediate`], which clears one build-cache
//! directory and refuses once either `buildFailures` or the count of earlier
//! clears (`autoFixes`) has reached the configured limit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::memory::BuildHealth;
use crate::probes::{ProbeKind, ProbeResult};

/// Suggestions for one failing probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStep {
    pub probe: String,
    pub suggestions: Vec<String>,
}

/// What the automatic remediation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remediation {
    Disabled,
    LimitReached { failures: u32, attempts: u32, max: u32 },
    NothingToClear,
    Cleared(PathBuf),
    Failed { path: PathBuf, error: String },
}

impl Remediation {
    /// Whether a cache removal was attempted.
    pub fn attempted(&self) -> bool {
        matches!(self, Remediation::Cleared(_) | Remediation::Failed { .. })
    }
}

impl std::fmt::Display for Remediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remediation::Disabled => write!(f, "auto-fix disabled"),
            Remediation::LimitReached {
                failures,
                attempts,
                max,
            } => write!(
                f,
                "auto-fix skipped: {attempts} clear(s) and {failures} build failure(s) since the last clean run (limit {max}), fix manually"
            ),
            Remediation::NothingToClear => write!(f, "auto-fix: no build cache to clear"),
            Remediation::Cleared(path) => write!(f, "auto-fix: cleared {}", path.display()),
            Remediation::Failed { path, error } => {
                write!(f, "auto-fix failed to clear {}: {error}", path.display())
            }
        }
    }
}

fn default_rules() -> HashMap<String, Vec<String>> {
    let table: &[(&str, &[&str])] = &[
        (
            "Critical Files",
            &[
                "git status  # look for deleted or moved files",
                "git checkout -- <missing file>",
            ],
        ),
        (
            "Stylesheet",
            &[
                "git checkout -- src/app/globals.css",
                "rm -rf .next && npm run dev",
            ],
        ),
        (
            "Package Manifest",
            &["git diff package.json", "npm install"],
        ),
        (
            "Tailwind Config",
            &[
                "npx tailwindcss init -p",
                "make sure `content` lists ./src/**/*.{ts,tsx}",
            ],
        ),
        (
            "Health Endpoint",
            &[
                "npm run dev",
                "lsof -i :3000  # is another process holding the port?",
            ],
        ),
        (
            "Home Page",
            &[
                "check the dev server log for compile errors",
                "rm -rf .next && npm run dev",
            ],
        ),
        (
            "Build Directory",
            &["rm -rf .next && npm run build"],
        ),
        (
            "Dev Server",
            &[
                "rm -rf .next node_modules/.cache && npm run dev",
                "npm install",
                "pkill -f 'next dev'  # stale server holding the port",
            ],
        ),
        (
            crate::memory::CYCLE_FAILURE_PROBE,
            &[
                "smokewatch run --verbose",
                "RUST_LOG=debug smokewatch run",
            ],
        ),
    ];

    table
        .iter()
        .map(|(name, steps)| {
            (
                name.to_string(),
                steps.iter().map(|s| s.to_string()).collect(),
            )
        })
        .collect()
}

fn kind_fallback(kind: ProbeKind) -> Vec<String> {
    let steps: &[&str] = match kind {
        ProbeKind::Filesystem => &["git status  # restore missing files"],
        ProbeKind::Config => &["validate the config file syntax", "npm install"],
        ProbeKind::Http => &[
            "npm run dev",
            "curl -i <url>  # inspect the failing response",
        ],
        ProbeKind::Process => &[
            "rm -rf .next && npm run dev",
            "npm install",
        ],
    };
    steps.iter().map(|s| s.to_string()).collect()
}

/// Static rule table plus the bounded auto-fix.
#[derive(Debug, Clone)]
pub struct RecoveryAdvisor {
    rules: HashMap<String, Vec<String>>,
    auto_fix: bool,
    max_auto_fixes: u32,
    cache_dirs: Vec<String>,
}

impl RecoveryAdvisor {
    pub fn new(config: &RecoveryConfig) -> Self {
        let mut rules = default_rules();
        for rule in &config.rules {
            rules.insert(rule.probe.clone(), rule.suggestions.clone());
        }
        Self {
            rules,
            auto_fix: config.auto_fix,
            max_auto_fixes: config.max_auto_fixes,
            cache_dirs: config.cache_dirs.clone(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&RecoveryConfig::default())
    }

    pub fn auto_fix_enabled(&self) -> bool {
        self.auto_fix
    }

    pub fn suggestions_for(&self, probe: &str, kind: ProbeKind) -> Vec<String> {
        self.rules
            .get(probe)
            .cloned()
            .unwrap_or_else(|| kind_fallback(kind))
    }

    /// One step per failing result, in result order.
    pub fn plan(&self, results: &[ProbeResult]) -> Vec<RecoveryStep> {
        self.plan_for(
            results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| (r.name.as_str(), r.kind)),
        )
    }

    pub fn plan_for<'a>(
        &self,
        failures: impl IntoIterator<Item = (&'a str, ProbeKind)>,
    ) -> Vec<RecoveryStep> {
        failures
            .into_iter()
            .map(|(name, kind)| RecoveryStep {
                probe: name.to_string(),
                suggestions: self.suggestions_for(name, kind),
            })
            .collect()
    }

    /// Clear the first existing build-cache directory under `workdir`.
    ///
    /// Refused once `health.build_failures` or `health.auto_fixes` reaches
    /// `max_auto_fixes`. The caller counts each attempt with
    /// `HealthStore::record_auto_fix`.
    pub fn auto_remediate(&self, workdir: &Path, health: &BuildHealth) -> Remediation {
        if !self.auto_fix {
            return Remediation::Disabled;
        }
        if health.build_failures >= self.max_auto_fixes || health.auto_fixes >= self.max_auto_fixes
        {
            warn!(
                failures = health.build_failures,
                attempts = health.auto_fixes,
                max = self.max_auto_fixes,
                "auto-fix limit reached"
            );
            return Remediation::LimitReached {
                failures: health.build_failures,
                attempts: health.auto_fixes,
                max: self.max_auto_fixes,
            };
        }

        let Some(dir) = self
            .cache_dirs
            .iter()
            .map(|d| workdir.join(d))
            .find(|p| p.is_dir())
        else {
            return Remediation::NothingToClear;
        };

        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(path = %dir.display(), "cleared build cache");
                Remediation::Cleared(dir)
            }
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to clear build cache");
                Remediation::Failed {
                    path: dir,
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Print a recovery plan in the console report style.
pub fn print_plan(steps: &[RecoveryStep]) {
    if steps.is_empty() {
        return;
    }
    println!("\n=== Recovery Plan ===");
    for step in steps {
        println!("{} failing:", step.probe);
        for suggestion in &step.suggestions {
            println!("   -> {}", suggestion);
        }
    }
    println!("=====================");
}
