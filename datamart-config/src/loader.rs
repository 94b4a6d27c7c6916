//! Configuration loading.
//!
//! Evaluation order:
//! 1. `.env` in the working directory is loaded into the process
//!    environment (existing variables win),
//! 2. `$DATAMART_CONFIG_PATH` (TOML or JSON file),
//! 3. `$DATAMART_CONFIG_JSON` (inline JSON),
//! 4. the first of `datamart.toml`, `datamart.json`, `config/datamart.toml`,
//!    `config/datamart.json` that exists,
//! 5. defaults.
//!
//! Then `DATAMART_IDENTITY`, `DATAMART_CACHE_ROOT`,
//! `DATAMART_PERMANENT_ROOT` and `DATAMART_CONCURRENCY` override single
//! fields, and the result is validated.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::{
    error::ConfigLoadError,
    models::{Config, ConfigSource},
    util::{non_blank, parse_override},
    validation::validate,
};

pub const CONFIG_PATH_VAR: &str = "DATAMART_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "DATAMART_CONFIG_JSON";
pub const IDENTITY_VAR: &str = "DATAMART_IDENTITY";
pub const CACHE_ROOT_VAR: &str = "DATAMART_CACHE_ROOT";
pub const PERMANENT_ROOT_VAR: &str = "DATAMART_PERMANENT_ROOT";
pub const CONCURRENCY_VAR: &str = "DATAMART_CONCURRENCY";

const DEFAULT_FILES: &[&str] = &[
    "datamart.toml",
    "datamart.json",
    "config/datamart.toml",
    "config/datamart.json",
];

/// A loaded configuration and where it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub source: ConfigSource,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base_dir: PathBuf,
    vars: Option<HashMap<String, String>>,
    load_env_file: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Reads the process environment; relative paths resolve against the
    /// working directory.
    pub fn new() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            vars: None,
            load_env_file: true,
        }
    }

    /// Look for `.env` and default files under `dir` instead.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Read variables from `vars` instead of the process environment. No
    /// `.env` file is loaded.
    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self.load_env_file = false;
        self
    }

    pub fn skip_env_file(mut self) -> Self {
        self.load_env_file = false;
        self
    }

    /// Shorthand for `ConfigLoader::new().load()`.
    pub fn load_from_env() -> Result<ConfigLoad, ConfigLoadError> {
        Self::new().load()
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded =
            self.load_env_file && dotenvy::from_path(self.base_dir.join(".env")).is_ok();

        let (mut config, source) = self.load_document()?;
        self.apply_overrides(&mut config)?;
        validate(&config)?;
        debug!(?source, identity = %config.identity, "configuration loaded");
        Ok(ConfigLoad {
            config,
            source,
            env_file_loaded,
        })
    }

    fn var(&self, name: &str) -> Option<String> {
        let raw = match &self.vars {
            Some(vars) => vars.get(name).cloned(),
            None => env::var(name).ok(),
        };
        non_blank(raw)
    }

    fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn load_document(&self) -> Result<(Config, ConfigSource), ConfigLoadError> {
        if let Some(path) = self.var(CONFIG_PATH_VAR) {
            let path = self.resolve(path);
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = self.var(CONFIG_JSON_VAR) {
            let config = parse_json(&raw)
                .context("failed to parse DATAMART_CONFIG_JSON")
                .map_err(ConfigLoadError::Parse)?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Config::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        DEFAULT_FILES
            .iter()
            .map(|candidate| self.base_dir.join(candidate))
            .find(|path| path.is_file())
    }

    fn apply_overrides(&self, config: &mut Config) -> Result<(), ConfigLoadError> {
        if let Some(identity) = self.var(IDENTITY_VAR) {
            config.identity = identity.trim().to_string();
        }
        if let Some(root) = self.var(CACHE_ROOT_VAR) {
            config.cache.root = PathBuf::from(root);
        }
        if let Some(root) = self.var(PERMANENT_ROOT_VAR) {
            config.cache.permanent_root = PathBuf::from(root);
        }
        if let Some(raw) = self.var(CONCURRENCY_VAR) {
            config.discovery.concurrency = parse_override(CONCURRENCY_VAR, &raw)?;
        }
        Ok(())
    }
}

/// Read a TOML or JSON document, picking the parser by extension.
pub fn load_from_file(path: &Path) -> Result<Config, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            parse_json(&contents).with_context(|| format!("invalid config {}", path.display()))
        }
        Some("toml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    };
    parsed.map_err(ConfigLoadError::Parse)
}

/// TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Config> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<Config> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
}
