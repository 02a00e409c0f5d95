//! Map changed paths onto [`ChangeClass`] and derive what to register with
//! the OS watcher.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use notify::RecursiveMode;

use super::state::ChangeClass;
use crate::config::{WatchConfig, WatchMode};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).with_context(|| format!("invalid watch pattern: {p}")))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    root: PathBuf,
    watched: Vec<Pattern>,
    critical: Vec<Pattern>,
    /// Exact paths that never count as a change, relative to `root` when
    /// under it.
    ignored: Vec<PathBuf>,
}

impl ChangeClassifier {
    /// `auto` mode has no critical set: every matching change is standard.
    pub fn new(root: impl Into<PathBuf>, config: &WatchConfig) -> Result<Self> {
        let critical = match config.mode {
            WatchMode::Auto => Vec::new(),
            WatchMode::Smart => compile(&config.critical)?,
        };
        Ok(Self {
            root: root.into(),
            watched: compile(&config.patterns)?,
            critical,
            ignored: Vec::new(),
        })
    }

    /// Always classify `path` as ignored, whatever the patterns say.
    pub fn ignoring(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        self.ignored.push(relative.to_path_buf());
        self
    }

    pub fn classify(&self, path: &Path) -> ChangeClass {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if self.ignored.iter().any(|p| p == relative) {
            return ChangeClass::Ignored;
        }
        let matches = |set: &[Pattern]| {
            set.iter()
                .any(|p| p.matches_path_with(relative, MATCH_OPTIONS))
        };

        if matches(&self.critical) {
            ChangeClass::Critical
        } else if matches(&self.watched) {
            ChangeClass::Standard
        } else {
            ChangeClass::Ignored
        }
    }
}

/// Directories to hand to `notify`, relative to the watch root (the empty
/// path is the root itself).
///
/// A pattern's literal prefix (components before the first wildcard) is
/// watched recursively when the pattern has a wildcard. A literal file is
/// covered by a non-recursive watch on its parent directory, which survives
/// editors that save by rename and sees files created later. Targets under
/// an already-recursive directory are dropped.
pub fn watch_targets(patterns: &[String]) -> Vec<(PathBuf, RecursiveMode)> {
    let mut recursive: Vec<PathBuf> = Vec::new();
    let mut parents: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let mut prefix = PathBuf::new();
        let mut wildcard = false;
        for component in Path::new(pattern).components() {
            let Component::Normal(part) = component else {
                continue;
            };
            let part = part.to_string_lossy();
            if part.contains(['*', '?', '[']) {
                wildcard = true;
                break;
            }
            prefix.push(&*part);
        }

        if wildcard {
            if !recursive.contains(&prefix) {
                recursive.push(prefix);
            }
        } else {
            let parent = prefix.parent().map(Path::to_path_buf).unwrap_or_default();
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }
    }

    // Shortest first so parents are seen before their children.
    recursive.sort_by_key(|p| p.components().count());
    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in recursive {
        if !dirs.iter().any(|d| dir.starts_with(d)) {
            dirs.push(dir);
        }
    }
    parents.retain(|p| !dirs.iter().any(|d| p.starts_with(d)));

    dirs.into_iter()
        .map(|d| (d, RecursiveMode::Recursive))
        .chain(parents.into_iter().map(|p| (p, RecursiveMode::NonRecursive)))
        .collect()
}
