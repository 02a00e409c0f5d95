use super::{Probe, ProbeContext, ProbeError, ProbeKind};
use crate::config::{EnvFlag, FilesProbeConfig};
use std::path::PathBuf;

/// Passes when every listed path exists under the working directory.
pub struct FilesProbe {
    name: String,
    root: PathBuf,
    paths: Vec<String>,
    flag: Option<EnvFlag>,
}

impl FilesProbe {
    pub fn new(spec: &FilesProbeConfig, ctx: &ProbeContext) -> Self {
        Self {
            name: spec.name.clone(),
            root: ctx.workdir.clone(),
            paths: spec.paths.clone(),
            flag: spec.flag,
        }
    }
}

#[async_trait::async_trait]
impl Probe for FilesProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProbeKind {
        ProbeKind::Filesystem
    }

    fn flag(&self) -> Option<EnvFlag> {
        self.flag
    }

    async fn check(&self) -> Result<String, ProbeError> {
        let mut missing = Vec::new();
        for path in &self.paths {
            if !tokio::fs::try_exists(self.root.join(path))
                .await
                .unwrap_or(false)
            {
                missing.push(path.clone());
            }
        }

        if missing.is_empty() {
            Ok(format!("{} path(s) present", self.paths.len()))
        } else {
            Err(ProbeError::MissingPaths(missing))
        }
    }
}
