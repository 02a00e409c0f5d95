//! Probe set: independent pass/fail checks against a project and its server.
//!
//! Every probe reports failure as a [`ProbeError`]; [`ProbeSet::run`] is the
//! boundary that turns those into failing [`ProbeResult`]s, so nothing a
//! probe does can abort a cycle.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{EnvFlag, SmokeConfig};

pub mod files;
pub mod http;
pub mod manifest;
pub mod process;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("missing: {}", .0.join(", "))]
    MissingPaths(Vec<String>),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} is missing {}", .fields.join(", "))]
    MissingFields { path: String, fields: Vec<String> },

    #[error("request failed: {0}")]
    Request(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("expected status {expected}, got {actual}")]
    UnexpectedStatus { expected: String, actual: u16 },

    #[error("unexpected response body: {0}")]
    Body(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited before becoming ready (code {code:?})")]
    ExitedEarly { code: Option<i32> },
}

/// Broad category of a probe, used for scheduling and fallback advice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Filesystem,
    Config,
    Http,
    Process,
}

impl ProbeKind {
    /// Local probes touch only the filesystem and may run concurrently.
    pub fn is_local(self) -> bool {
        matches!(self, ProbeKind::Filesystem | ProbeKind::Config)
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Filesystem => write!(f, "filesystem"),
            ProbeKind::Config => write!(f, "config"),
            ProbeKind::Http => write!(f, "http"),
            ProbeKind::Process => write!(f, "process"),
        }
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub name: String,
    pub kind: ProbeKind,
    pub passed: bool,
    pub details: String,
    pub duration_ms: Option<u64>,
}

impl ProbeResult {
    pub fn pass(name: impl Into<String>, kind: ProbeKind, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            passed: true,
            details: details.into(),
            duration_ms: None,
        }
    }

    pub fn fail(name: impl Into<String>, kind: ProbeKind, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            passed: false,
            details: details.into(),
            duration_ms: None,
        }
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(elapsed.as_millis() as u64);
        self
    }
}

/// Environment-level flags derived from one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub server_running: bool,
    pub css_working: bool,
}

impl BuildStatus {
    pub fn healthy() -> Self {
        Self {
            server_running: true,
            css_working: true,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.server_running && self.css_working
    }
}

/// Shared inputs for probes.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub base_url: String,
    pub workdir: PathBuf,
}

impl ProbeContext {
    pub fn from_config(config: &SmokeConfig) -> Self {
        Self {
            base_url: config.target.base_url.clone(),
            workdir: config.target.workdir.clone(),
        }
    }

    /// Join a route onto the base URL without doubling slashes.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Trait for all probes.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProbeKind;

    /// Environment flag this probe feeds, if any.
    fn flag(&self) -> Option<EnvFlag> {
        None
    }

    /// Run the check. `Ok` carries the detail line for a pass.
    async fn check(&self) -> Result<String, ProbeError>;
}

/// Probe results plus the environment flags derived from them.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub results: Vec<ProbeResult>,
    pub build: BuildStatus,
}

impl ProbeOutcome {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

/// An ordered list of probes executed as one unit.
#[derive(Default)]
pub struct ProbeSet {
    probes: Vec<Box<dyn Probe>>,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, probe: impl Probe + 'static) {
        self.probes.push(Box::new(probe));
    }

    pub fn with(mut self, probe: impl Probe + 'static) -> Self {
        self.push(probe);
        self
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Build the configured probe set.
    pub fn from_config(config: &SmokeConfig) -> Result<Self> {
        let ctx = ProbeContext::from_config(config);
        let mut set = Self::new();

        for spec in &config.probes.files {
            set.push(files::FilesProbe::new(spec, &ctx));
        }
        for spec in &config.probes.manifest {
            set.push(manifest::ManifestProbe::new(spec, &ctx));
        }
        for spec in &config.probes.content {
            set.push(manifest::ContentProbe::new(spec, &ctx));
        }
        for spec in &config.probes.http {
            set.push(http::HttpProbe::new(spec, &ctx)?);
        }
        if let Some(spec) = &config.probes.dev_server {
            if spec.command.is_empty() {
                warn!(probe = %spec.name, "dev server probe has no command, skipping");
            } else {
                set.push(process::DevServerProbe::new(spec, &ctx));
            }
        }

        debug!(count = set.len(), "probe set built");
        Ok(set)
    }

    /// Run every probe and derive the build status.
    ///
    /// Local probes run concurrently; HTTP and process probes run one after
    /// another afterwards so they never contend for the same port or
    /// working directory. Results come back in declaration order.
    pub async fn run(&self) -> ProbeOutcome {
        let (local, remote): (Vec<_>, Vec<_>) = self
            .probes
            .iter()
            .enumerate()
            .partition(|(_, p)| p.kind().is_local());

        let mut indexed: Vec<(usize, ProbeResult)> =
            join_all(local.into_iter().map(|(i, p)| async move {
                (i, execute(p.as_ref()).await)
            }))
            .await;

        for (i, probe) in remote {
            indexed.push((i, execute(probe.as_ref()).await));
        }
        indexed.sort_by_key(|(i, _)| *i);

        let mut build = BuildStatus::healthy();
        for (i, result) in &indexed {
            if result.passed {
                continue;
            }
            match self.probes[*i].flag() {
                Some(EnvFlag::Server) => build.server_running = false,
                Some(EnvFlag::Stylesheet) => build.css_working = false,
                None => {}
            }
        }

        let results: Vec<ProbeResult> = indexed.into_iter().map(|(_, r)| r).collect();
        info!(
            total = results.len(),
            failed = results.iter().filter(|r| !r.passed).count(),
            "probe set complete"
        );

        ProbeOutcome { results, build }
    }
}

async fn execute(probe: &dyn Probe) -> ProbeResult {
    let start = Instant::now();
    let result = match probe.check().await {
        Ok(details) => ProbeResult::pass(probe.name(), probe.kind(), details),
        Err(e) => {
            debug!(probe = probe.name(), error = %e, "probe failed");
            ProbeResult::fail(probe.name(), probe.kind(), e.to_string())
        }
    };
    result.with_duration(start.elapsed())
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProbe;
    use super::*;

    #[tokio::test]
    async fn test_results_keep_declaration_order() {
        let set = ProbeSet::new()
            .with(ScriptedProbe::new("server", true).kind(ProbeKind::Http))
            .with(ScriptedProbe::new("files", true))
            .with(ScriptedProbe::new("dev", false).kind(ProbeKind::Process))
            .with(ScriptedProbe::new("config", true).kind(ProbeKind::Config));

        let outcome = set.run().await;
        let names: Vec<&str> = outcome.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["server", "files", "dev", "config"]);
        assert!(!outcome.all_passed());
        assert!(outcome.results.iter().all(|r| r.duration_ms.is_some()));
    }

    #[tokio::test]
    async fn test_failure_becomes_result_not_error() {
        let set = ProbeSet::new().with(ScriptedProbe::new("broken", false));
        let outcome = set.run().await;
        assert_eq!(outcome.results.len(), 1);
        assert!(!outcome.results[0].passed);
        assert_eq!(outcome.results[0].details, "missing: broken");
    }

    #[tokio::test]
    async fn test_build_status_from_flagged_probes() {
        let set = ProbeSet::new()
            .with(ScriptedProbe::new("health", false).flag(EnvFlag::Server))
            .with(ScriptedProbe::new("css", true).flag(EnvFlag::Stylesheet))
            .with(ScriptedProbe::new("other", false));
        let outcome = set.run().await;
        assert!(!outcome.build.server_running);
        assert!(outcome.build.css_working);
        assert!(!outcome.build.is_healthy());

        // Unflagged failures leave the environment healthy.
        let set = ProbeSet::new().with(ScriptedProbe::new("other", false));
        assert!(set.run().await.build.is_healthy());
    }

    #[test]
    fn test_context_url_joining() {
        let ctx = ProbeContext {
            base_url: "http://localhost:3000/".to_string(),
            workdir: PathBuf::from("."),
        };
        assert_eq!(ctx.url("/api/health"), "http://localhost:3000/api/health");
        assert_eq!(ctx.url("api/health"), "http://localhost:3000/api/health");
        assert_eq!(ctx.url("http://other:1/x"), "http://other:1/x");
    }

    #[test]
    fn test_from_default_config() {
        let set = ProbeSet::from_config(&SmokeConfig::default()).unwrap();
        // 2 files + manifest + content + 2 http + dev server
        assert_eq!(set.len(), 7);
    }
}
