//! TOML configuration for smokewatch.
//!
//! A layered configuration model: an explicit path (flag or
//! `SMOKEWATCH_CONFIG`), then `./smokewatch.toml`, then compiled-in defaults.
//! Every section is `#[serde(default)]` so partial files only override what
//! they name.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// File looked up in the working directory when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "smokewatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a smokewatch process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmokeConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SmokeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded smokewatch configuration");
        Ok(config)
    }

    /// Resolve the configuration.
    ///
    /// An explicit path must load; a missing or broken `./smokewatch.toml`
    /// only warns and falls back to defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Apply CLI / environment overrides on top of the file configuration.
    pub fn apply_overrides(
        &mut self,
        base_url: Option<String>,
        verbose: bool,
        memory_path: Option<PathBuf>,
    ) {
        if let Some(url) = base_url {
            self.target.base_url = url;
        }
        if verbose {
            self.logging.verbose = true;
        }
        if let Some(path) = memory_path {
            self.memory.path = path;
        }
    }

    /// Memory file path, resolved against the working directory when relative.
    pub fn memory_path(&self) -> PathBuf {
        if self.memory.path.is_absolute() {
            self.memory.path.clone()
        } else {
            self.target.workdir.join(&self.memory.path)
        }
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// The application under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Base URL HTTP probes are issued against.
    pub base_url: String,
    /// Project root that filesystem, config and process probes resolve from.
    pub workdir: PathBuf,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            workdir: PathBuf::from("."),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Health Memory persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// JSON document holding the Health Memory record.
    pub path: PathBuf,
    /// Maximum number of run summaries kept in `testHistory`.
    pub history_cap: usize,
    /// How many recent runs feed the pass-rate percentage.
    pub pass_rate_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".smokewatch-memory.json"),
            history_cap: 30,
            pass_rate_window: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Environment-level flag a probe reports into `buildHealth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvFlag {
    /// The target server process answers requests.
    Server,
    /// The stylesheet pipeline is intact.
    Stylesheet,
}

/// The probe set, grouped by kind.
///
/// Defaults apply only when the whole `[probes]` table is absent; a file
/// that names any probe kind gets exactly the probes it lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbesConfig {
    #[serde(default)]
    pub files: Vec<FilesProbeConfig>,
    #[serde(default)]
    pub manifest: Vec<ManifestProbeConfig>,
    #[serde(default)]
    pub content: Vec<ContentProbeConfig>,
    #[serde(default)]
    pub http: Vec<HttpProbeConfig>,
    #[serde(default)]
    pub dev_server: Option<DevServerProbeConfig>,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            files: vec![
                FilesProbeConfig {
                    name: "Critical Files".to_string(),
                    paths: vec![
                        "package.json".to_string(),
                        "next.config.js".to_string(),
                        "src/app/layout.tsx".to_string(),
                        "src/app/page.tsx".to_string(),
                    ],
                    flag: None,
                },
                FilesProbeConfig {
                    name: "Stylesheet".to_string(),
                    paths: vec!["src/app/globals.css".to_string()],
                    flag: Some(EnvFlag::Stylesheet),
                },
            ],
            manifest: vec![ManifestProbeConfig {
                name: "Package Manifest".to_string(),
                path: "package.json".to_string(),
                scripts: vec!["build".to_string(), "dev".to_string()],
                dependencies: vec!["next".to_string(), "react".to_string()],
                flag: None,
            }],
            content: vec![ContentProbeConfig {
                name: "Tailwind Config".to_string(),
                path: "tailwind.config.js".to_string(),
                contains: vec!["content".to_string()],
                flag: Some(EnvFlag::Stylesheet),
            }],
            http: vec![
                HttpProbeConfig {
                    name: "Health Endpoint".to_string(),
                    path: "/api/health".to_string(),
                    expect_json_keys: vec!["status".to_string()],
                    flag: Some(EnvFlag::Server),
                    ..HttpProbeConfig::default()
                },
                HttpProbeConfig {
                    name: "Home Page".to_string(),
                    path: "/".to_string(),
                    expect_body_contains: Some("<html".to_string()),
                    ..HttpProbeConfig::default()
                },
            ],
            dev_server: Some(DevServerProbeConfig::default()),
        }
    }
}

/// All listed paths must exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesProbeConfig {
    pub name: String,
    pub paths: Vec<String>,
    pub flag: Option<EnvFlag>,
}

/// Typed check of a `package.json` manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestProbeConfig {
    pub name: String,
    pub path: String,
    /// Keys required under `scripts`.
    pub scripts: Vec<String>,
    /// Packages required in `dependencies` or `devDependencies`.
    pub dependencies: Vec<String>,
    pub flag: Option<EnvFlag>,
}

/// A config file (JS or JSON) must contain every listed substring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentProbeConfig {
    pub name: String,
    pub path: String,
    pub contains: Vec<String>,
    pub flag: Option<EnvFlag>,
}

/// HTTP method used by an HTTP probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Request against `base_url + path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProbeConfig {
    pub name: String,
    pub method: HttpMethod,
    pub path: String,
    /// JSON body sent with POST requests.
    pub body: Option<serde_json::Value>,
    /// Exact status expected; any 2xx when unset.
    pub expect_status: Option<u16>,
    /// Top-level keys the JSON response must carry.
    pub expect_json_keys: Vec<String>,
    pub expect_body_contains: Option<String>,
    pub timeout_ms: u64,
    pub flag: Option<EnvFlag>,
}

impl Default for HttpProbeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            method: HttpMethod::Get,
            path: "/".to_string(),
            body: None,
            expect_status: None,
            expect_json_keys: Vec::new(),
            expect_body_contains: None,
            timeout_ms: 10_000,
            flag: None,
        }
    }
}

/// Spawn a build/dev-server process and wait for a ready marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevServerProbeConfig {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Any of these substrings on stdout/stderr counts as ready.
    pub ready_markers: Vec<String>,
    pub timeout_ms: u64,
    pub flag: Option<EnvFlag>,
}

impl Default for DevServerProbeConfig {
    fn default() -> Self {
        Self {
            name: "Dev Server".to_string(),
            command: vec![
                "npm".to_string(),
                "run".to_string(),
                "dev".to_string(),
                "--".to_string(),
                "--port".to_string(),
                "3005".to_string(),
            ],
            ready_markers: vec!["Ready".to_string(), "ready started".to_string()],
            timeout_ms: 30_000,
            flag: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

/// Which watcher variant runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Every matching change is treated the same.
    Auto,
    /// Critical files shorten the debounce and sustained failures alert.
    #[default]
    Smart,
}

/// File-change watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub mode: WatchMode,
    /// Glob patterns (relative to the workdir) that trigger a cycle.
    pub patterns: Vec<String>,
    /// Subset treated as critical by the smart variant.
    pub critical: Vec<String>,
    pub debounce_ms: u64,
    /// Multiplier applied to the debounce for critical changes.
    pub critical_debounce_factor: f64,
    /// Minimum time between the end of one cycle and the start of the next.
    pub min_interval_ms: u64,
    /// `consecutiveFails` at which the smart variant raises an alert.
    pub alert_threshold: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Smart,
            patterns: vec![
                "src/**/*.tsx".to_string(),
                "src/**/*.ts".to_string(),
                "src/**/*.css".to_string(),
                "package.json".to_string(),
                "next.config.js".to_string(),
                "tailwind.config.js".to_string(),
            ],
            critical: vec![
                "src/app/layout.tsx".to_string(),
                "src/app/globals.css".to_string(),
                "package.json".to_string(),
                "next.config.js".to_string(),
                "tailwind.config.js".to_string(),
            ],
            debounce_ms: 2_000,
            critical_debounce_factor: 0.5,
            min_interval_ms: 10_000,
            alert_threshold: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Recovery Advisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempt the bounded automatic remediation after a failed cycle.
    pub auto_fix: bool,
    /// Auto-fix is skipped once `buildFailures` reaches this value.
    pub max_auto_fixes: u32,
    /// Build-cache directories (relative to the workdir) the auto-fix clears.
    pub cache_dirs: Vec<String>,
    /// Extra rules; they take precedence over the built-in table.
    pub rules: Vec<RecoveryRuleConfig>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_fix: false,
            max_auto_fixes: 3,
            cache_dirs: vec![".next".to_string(), "node_modules/.cache".to_string()],
            rules: Vec::new(),
        }
    }
}

/// Remediation suggestions for one probe name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryRuleConfig {
    pub probe: String,
    pub suggestions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging and report verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
    /// Print detail strings for passing probes too.
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            verbose: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
