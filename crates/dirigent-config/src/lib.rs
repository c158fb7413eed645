//! Configuration loading for Dirigent
//!
//! Runtime settings come from the environment (`PORT`, `STORE`, `DB_PATH`,
//! `API_KEY`, `POLICY_MODE`); policy profiles, per-backend adapter config,
//! and secrets come from JSON files under `config/`. Missing files fall back
//! to empty defaults; malformed files are a startup error.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use dirigent_core::adapter::{BackendContext, StaticContextProvider};
use dirigent_core::policy::{PolicyMode, PolicyProfile};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("environment variable {var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which request store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Durable,
}

/// Environment-derived server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub store: StoreKind,
    pub db_path: PathBuf,
    /// Unset disables authentication
    pub api_key: Option<String>,
    pub policy_mode: PolicyMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            store: StoreKind::Memory,
            db_path: PathBuf::from("data/dirigent.db"),
            api_key: None,
            policy_mode: PolicyMode::Enforce,
        }
    }
}

impl ServerConfig {
    /// Read settings from the process environment, using documented defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = non_empty_env("PORT") {
            config.port = port.parse().map_err(|_| ConfigError::Env {
                var: "PORT",
                reason: format!("'{port}' is not a valid port number"),
            })?;
        }
        if let Some(store) = non_empty_env("STORE") {
            config.store = match store.to_ascii_lowercase().as_str() {
                "memory" => StoreKind::Memory,
                "durable" => StoreKind::Durable,
                other => {
                    return Err(ConfigError::Env {
                        var: "STORE",
                        reason: format!("'{other}' is not one of: memory, durable"),
                    });
                }
            };
        }
        if let Some(path) = non_empty_env("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        config.api_key = non_empty_env("API_KEY");
        if let Some(mode) = non_empty_env("POLICY_MODE") {
            config.policy_mode = match mode.to_ascii_lowercase().as_str() {
                "enforce" => PolicyMode::Enforce,
                "warn" => PolicyMode::Warn,
                "disabled" => PolicyMode::Disabled,
                other => {
                    return Err(ConfigError::Env {
                        var: "POLICY_MODE",
                        reason: format!("'{other}' is not one of: enforce, warn, disabled"),
                    });
                }
            };
        }

        Ok(config)
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Default locations of the JSON config files.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub policy: PathBuf,
    pub backends: PathBuf,
    pub secrets: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            policy: PathBuf::from("config/policy.json"),
            backends: PathBuf::from("config/backends.json"),
            secrets: PathBuf::from("config/secrets.json"),
        }
    }
}

/// `config/policy.json`: declarative policy profiles.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub profiles: Vec<PolicyProfile>,
}

/// `config/backends.json` and `config/secrets.json`: one JSON object per
/// backend name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendMap {
    #[serde(flatten)]
    pub entries: HashMap<String, Value>,
}

/// Load the policy file; a missing file yields no profiles.
pub fn load_policy(path: &Path) -> Result<PolicyFile, ConfigError> {
    let Some(content) = read_optional(path)? else {
        tracing::info!(path = %path.display(), "policy file missing; no profiles loaded");
        return Ok(PolicyFile::default());
    };
    let file: PolicyFile = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate_policy(&file)?;
    Ok(file)
}

/// Load a backend-keyed JSON object file; a missing file yields no entries.
pub fn load_backend_map(path: &Path) -> Result<BackendMap, ConfigError> {
    let Some(content) = read_optional(path)? else {
        tracing::info!(path = %path.display(), "backend config file missing; using defaults");
        return Ok(BackendMap::default());
    };
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn validate_policy(file: &PolicyFile) -> Result<(), ConfigError> {
    for profile in &file.profiles {
        if profile.id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "policy profile id must not be empty".to_string(),
            ));
        }
        if profile.message.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "policy profile '{}' message must not be empty",
                profile.id
            )));
        }
    }
    Ok(())
}

/// Combine backend config and secrets into a context provider for adapters.
pub fn context_provider(backends: &BackendMap, secrets: &BackendMap) -> StaticContextProvider {
    let mut provider = StaticContextProvider::new();
    let names: std::collections::HashSet<&String> = backends
        .entries
        .keys()
        .chain(secrets.entries.keys())
        .collect();
    for name in names {
        provider.insert(
            name.clone(),
            BackendContext {
                config: backends.entries.get(name).cloned().unwrap_or(Value::Null),
                secrets: secrets.entries.get(name).cloned().unwrap_or(Value::Null),
            },
        );
    }
    provider
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirigent_core::adapter::ContextProvider;
    use serde_json::json;

    fn write_temp(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("dirigent-config-test-{name}"));
        fs::write(&path, content).expect("write temp config");
        path
    }

    #[test]
    fn test_missing_policy_file_defaults_to_empty() {
        let file = load_policy(Path::new("/nonexistent/policy.json")).expect("default");
        assert!(file.profiles.is_empty());
    }

    #[test]
    fn test_policy_file_parses_profiles() {
        let path = write_temp(
            "policy.json",
            r#"{
                "profiles": [
                    {"id": "no-prod", "effect": "deny", "message": "prod frozen",
                     "backends": ["prod"]}
                ]
            }"#,
        );
        let file = load_policy(&path).expect("parsed");
        assert_eq!(file.profiles.len(), 1);
        assert_eq!(file.profiles[0].id, "no-prod");
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_malformed_policy_file_is_an_error() {
        let path = write_temp("policy-bad.json", "{not json");
        assert!(matches!(
            load_policy(&path),
            Err(ConfigError::Parse { .. })
        ));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_empty_profile_id_is_rejected() {
        let path = write_temp(
            "policy-empty-id.json",
            r#"{"profiles": [{"id": " ", "effect": "deny", "message": "m"}]}"#,
        );
        assert!(matches!(
            load_policy(&path),
            Err(ConfigError::Invalid(_))
        ));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_context_provider_merges_config_and_secrets() {
        tokio_test::block_on(async {
            let backends = BackendMap {
                entries: HashMap::from([("aws".to_string(), json!({"region": "eu-west-1"}))]),
            };
            let secrets = BackendMap {
                entries: HashMap::from([
                    ("aws".to_string(), json!({"token": "t"})),
                    ("gcp".to_string(), json!({"sa": "svc"})),
                ]),
            };
            let provider = context_provider(&backends, &secrets);

            let aws = provider.context_for("aws").await.unwrap();
            assert_eq!(aws.config["region"], "eu-west-1");
            assert_eq!(aws.secrets["token"], "t");

            // secrets-only backends still resolve
            let gcp = provider.context_for("gcp").await.unwrap();
            assert!(gcp.config.is_null());
            assert_eq!(gcp.secrets["sa"], "svc");
        });
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.policy_mode, PolicyMode::Enforce);
        assert!(config.api_key.is_none());
    }
}
