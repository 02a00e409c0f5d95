//! Config content probes: typed `package.json` checks and substring checks
//! for JS/JSON config files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use super::{Probe, ProbeContext, ProbeError, ProbeKind};
use crate::config::{ContentProbeConfig, EnvFlag, ManifestProbeConfig};

/// The subset of `package.json` the manifest probe looks at.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PackageManifest {
    pub name: Option<String>,
    pub scripts: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, String>,
    pub dev_dependencies: BTreeMap<String, String>,
}

impl PackageManifest {
    pub fn parse(path: &str, raw: &str) -> Result<Self, ProbeError> {
        serde_json::from_str(raw).map_err(|source| ProbeError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Required fields absent from the manifest, as `scripts.<x>` /
    /// `dependencies.<x>` names.
    pub fn missing(&self, scripts: &[String], dependencies: &[String]) -> Vec<String> {
        let mut missing: Vec<String> = scripts
            .iter()
            .filter(|s| !self.scripts.contains_key(s.as_str()))
            .map(|s| format!("scripts.{s}"))
            .collect();
        missing.extend(
            dependencies
                .iter()
                .filter(|d| {
                    !self.dependencies.contains_key(d.as_str())
                        && !self.dev_dependencies.contains_key(d.as_str())
                })
                .map(|d| format!("dependencies.{d}")),
        );
        missing
    }
}

async fn read(root: &std::path::Path, path: &str) -> Result<String, ProbeError> {
    tokio::fs::read_to_string(root.join(path))
        .await
        .map_err(|source| ProbeError::Read {
            path: path.to_string(),
            source,
        })
}

/// Verifies a `package.json` declares the expected scripts and packages.
pub struct ManifestProbe {
    name: String,
    root: PathBuf,
    spec: ManifestProbeConfig,
}

impl ManifestProbe {
    pub fn new(spec: &ManifestProbeConfig, ctx: &ProbeContext) -> Self {
        Self {
            name: spec.name.clone(),
            root: ctx.workdir.clone(),
            spec: spec.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Probe for ManifestProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProbeKind {
        ProbeKind::Config
    }

    fn flag(&self) -> Option<EnvFlag> {
        self.spec.flag
    }

    async fn check(&self) -> Result<String, ProbeError> {
        let raw = read(&self.root, &self.spec.path).await?;
        let manifest = PackageManifest::parse(&self.spec.path, &raw)?;

        let missing = manifest.missing(&self.spec.scripts, &self.spec.dependencies);
        if !missing.is_empty() {
            return Err(ProbeError::MissingFields {
                path: self.spec.path.clone(),
                fields: missing,
            });
        }

        Ok(format!(
            "{}: {} script(s), {} dependenc(ies) verified",
            manifest.name.as_deref().unwrap_or(&self.spec.path),
            self.spec.scripts.len(),
            self.spec.dependencies.len()
        ))
    }
}

/// Verifies a config file contains each required substring.
pub struct ContentProbe {
    name: String,
    root: PathBuf,
    spec: ContentProbeConfig,
}

impl ContentProbe {
    pub fn new(spec: &ContentProbeConfig, ctx: &ProbeContext) -> Self {
        Self {
            name: spec.name.clone(),
            root: ctx.workdir.clone(),
            spec: spec.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Probe for ContentProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProbeKind {
        ProbeKind::Config
    }

    fn flag(&self) -> Option<EnvFlag> {
        self.spec.flag
    }

    async fn check(&self) -> Result<String, ProbeError> {
        let raw = read(&self.root, &self.spec.path).await?;
        let missing: Vec<String> = self
            .spec
            .contains
            .iter()
            .filter(|needle| !raw.contains(needle.as_str()))
            .map(|needle| format!("\"{needle}\""))
            .collect();

        if missing.is_empty() {
            Ok(format!("{} contains required entries", self.spec.path))
        } else {
            Err(ProbeError::MissingFields {
                path: self.spec.path.clone(),
                fields: missing,
            })
        }
    }
}
