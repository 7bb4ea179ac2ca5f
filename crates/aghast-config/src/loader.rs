//! YAML loader with custom tag support
//!
//! Tags are resolved while walking the parsed document:
//! - `!include path` loads another file, relative to the including file
//! - `!secret key` substitutes a value from secrets.yaml
//! - `!env_var VAR` substitutes an environment variable
//!
//! Unknown tags are kept, with their inner value processed.

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being loaded, innermost last
    include_stack: Vec<PathBuf>,
}

impl YamlLoader {
    /// Loader rooted at `config_dir`, reading its secrets.yaml
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            include_stack: Vec::new(),
        }
    }

    /// Load a file; relative paths resolve against the config directory
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve(path.as_ref());
        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }
        debug!(path = %path.display(), "Loading YAML file");

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.include_stack.push(path.clone());
        let result = self.load_string(&content, &path);
        self.include_stack.pop();
        result
    }

    /// Parse `content` as if it were read from `source_path`
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source,
        })?;
        self.process(value, source_path)
    }

    fn process(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut out = Mapping::with_capacity(map.len());
                for (key, value) in map {
                    let key = self.process(key, source_path)?;
                    let value = self.process(value, source_path)?;
                    out.insert(key, value);
                }
                Ok(Value::Mapping(out))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.process(v, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn process_tagged(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Resolving tag");

        match tag.as_str() {
            "!include" => {
                let target = self.include_target(&tagged.value, source_path)?;
                self.load_file(target)
            }
            "!secret" => {
                let key = tag_argument(&tag, tagged.value)?;
                let secret = self.secrets.get(&key)?;
                debug!(key = %key, "Substituted secret");
                Ok(Value::String(secret.to_string()))
            }
            "!env_var" => {
                let var = tag_argument(&tag, tagged.value)?;
                let value = std::env::var(&var)
                    .map_err(|_| ConfigError::EnvVarNotFound { var: var.clone() })?;
                debug!(var = %var, "Substituted environment variable");
                Ok(Value::String(value))
            }
            _ => {
                let value = self.process(tagged.value, source_path)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }

    /// Include paths are relative to the including file
    fn include_target(&self, value: &Value, source_path: &Path) -> ConfigResult<PathBuf> {
        let Value::String(raw) = value else {
            return Err(ConfigError::InvalidIncludePath {
                path: format!("{:?}", value),
                reason: "path must be a string".to_string(),
            });
        };

        let raw = Path::new(raw);
        if raw.is_absolute() {
            return Ok(raw.to_path_buf());
        }
        let base = source_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(&self.config_dir);
        Ok(base.join(raw))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

fn tag_argument(tag: &str, value: Value) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: "argument must be a string".to_string(),
        }),
    }
}

/// Load one file with tag processing
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_file(file)
}

/// Load a YAML string with tag processing
pub fn load_yaml_string(
    config_dir: impl Into<PathBuf>,
    content: &str,
    source_name: &str,
) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_string(content, Path::new(source_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn get<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.as_mapping().unwrap().get(key).unwrap()
    }

    #[test]
    fn test_include_relative_to_including_file() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "conf/broker.yaml", "address: broker.local:1883\n");
        write_file(dir.path(), "conf/main.yaml", "broker: !include broker.yaml\n");
        write_file(dir.path(), "aghast.yaml", "hub: !include conf/main.yaml\n");

        let value = load_yaml(dir.path(), "aghast.yaml").unwrap();
        let broker = get(get(&value, "hub"), "broker");
        assert_eq!(
            get(broker, "address"),
            &Value::String("broker.local:1883".into())
        );
    }

    #[test]
    fn test_secret() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "secrets.yaml", "mqtt_password: s3cret\n");
        write_file(dir.path(), "aghast.yaml", "password: !secret mqtt_password\n");

        let value = load_yaml(dir.path(), "aghast.yaml").unwrap();
        assert_eq!(get(&value, "password"), &Value::String("s3cret".into()));
    }

    #[test]
    fn test_missing_secret() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "aghast.yaml", "password: !secret nope\n");

        let result = load_yaml(dir.path(), "aghast.yaml");
        assert!(matches!(result, Err(ConfigError::SecretNotFound { .. })));
    }

    #[test]
    fn test_env_var() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("AGHAST_LOADER_TEST_VAR", "from-env");
        write_file(
            dir.path(),
            "aghast.yaml",
            "client_id: !env_var AGHAST_LOADER_TEST_VAR\n",
        );

        let value = load_yaml(dir.path(), "aghast.yaml").unwrap();
        assert_eq!(get(&value, "client_id"), &Value::String("from-env".into()));
        std::env::remove_var("AGHAST_LOADER_TEST_VAR");
    }

    #[test]
    fn test_circular_include_detection() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.yaml", "b: !include b.yaml\n");
        write_file(dir.path(), "b.yaml", "a: !include a.yaml\n");

        let result = load_yaml(dir.path(), "a.yaml");
        assert!(matches!(result, Err(ConfigError::CircularInclude { .. })));
    }

    #[test]
    fn test_unknown_tag_kept() {
        let dir = TempDir::new().unwrap();
        let value = load_yaml_string(dir.path(), "x: !custom 5\n", "inline.yaml").unwrap();
        assert!(matches!(get(&value, "x"), Value::Tagged(_)));
    }
}
