//! Rule files on disk
//!
//! Every `*.yaml`/`*.yml` file in the automation directory holds one rule.
//! Only the `enabled` flag is ever written back.

use serde_yaml::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::rule::{Rule, RuleConfig};
use crate::{AutomationError, AutomationResult};

#[derive(Debug, Clone)]
pub struct RuleStore {
    dir: PathBuf,
}

impl RuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every valid rule, sorted by file name
    ///
    /// Files that fail to parse or validate are logged and skipped, as are
    /// rules whose name was already taken by an earlier file.
    pub async fn load_all(&self) -> AutomationResult<Vec<Rule>> {
        if !self.dir.is_dir() {
            warn!(dir = %self.dir.display(), "Automation directory not found, no rules loaded");
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|source| AutomationError::Io {
                path: self.dir.clone(),
                source,
            })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_rule_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut rules = Vec::with_capacity(files.len());
        let mut names = HashSet::new();
        for path in files {
            match Self::load_file(&path).await {
                Ok(rule) if !names.insert(rule.name.clone()) => {
                    warn!(rule = %rule.name, path = %path.display(), "Duplicate rule name, skipping");
                }
                Ok(rule) => {
                    debug!(rule = %rule.name, path = %path.display(), enabled = rule.enabled, "Loaded rule");
                    rules.push(rule);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid rule");
                }
            }
        }

        info!(dir = %self.dir.display(), count = rules.len(), "Loaded automation rules");
        Ok(rules)
    }

    /// Parse and validate one rule file
    pub async fn load_file(path: &Path) -> AutomationResult<Rule> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| AutomationError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config: RuleConfig =
            serde_yaml::from_str(&content).map_err(|source| AutomationError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        Rule::from_config(config, path)
    }

    /// Rewrite the `enabled` flag of the rule stored at `path`
    ///
    /// The rest of the file is kept as parsed. The new content goes to a
    /// temporary file that is renamed over the original.
    pub async fn persist_enabled(path: &Path, enabled: bool) -> AutomationResult<()> {
        let io_err = |source| AutomationError::Io {
            path: path.to_path_buf(),
            source,
        };
        let yaml_err = |source| AutomationError::Yaml {
            path: path.to_path_buf(),
            source,
        };

        let content = fs::read_to_string(path).await.map_err(io_err)?;
        let mut document: Value = serde_yaml::from_str(&content).map_err(yaml_err)?;
        let Value::Mapping(map) = &mut document else {
            return Err(AutomationError::InvalidConfig(format!(
                "{} is not a mapping",
                path.display()
            )));
        };
        map.insert(Value::String("enabled".into()), Value::Bool(enabled));
        let content = serde_yaml::to_string(&document).map_err(yaml_err)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!("{}.tmp", file_name));

        fs::write(&temp_path, &content).await.map_err(io_err)?;
        fs::rename(&temp_path, path).await.map_err(io_err)?;

        debug!(path = %path.display(), enabled, "Persisted rule enabled flag");
        Ok(())
    }
}

fn is_rule_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_all_skips_invalid_and_duplicates() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yaml", "name: first\ntrigger: { message: t/a }\n");
        write(dir.path(), "b.yml", "name: no-trigger\n");
        write(dir.path(), "c.yaml", "name: first\ntrigger: { message: t/c }\n");
        write(dir.path(), "d.yaml", ": not yaml : [\n");
        write(dir.path(), "e.yaml", "name: second\ntrigger: { event: A/B/C/D }\n");
        write(dir.path(), "notes.txt", "ignored\n");

        let rules = RuleStore::new(dir.path()).load_all().await.unwrap();
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(rules[0].source, dir.path().join("a.yaml"));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let store = RuleStore::new(dir.path().join("nope"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_enabled() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "rule.yaml",
            "name: heater\ndescription: keep me\ntrigger:\n  message: t\n",
        );

        RuleStore::persist_enabled(&path, false).await.unwrap();
        let rule = RuleStore::load_file(&path).await.unwrap();
        assert!(!rule.enabled);
        assert_eq!(rule.description, "keep me");
        assert!(!dir.path().join("rule.yaml.tmp").exists());

        RuleStore::persist_enabled(&path, true).await.unwrap();
        assert!(RuleStore::load_file(&path).await.unwrap().enabled);
    }
}
