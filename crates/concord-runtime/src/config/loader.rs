//! Layered configuration loading with figment.
//!
//! Layers, lowest first:
//!
//! 1. built-in defaults, or a whole [`ConcordConfig`] given to [`ConfigLoader::merge`]
//! 2. `concord.{profile}.toml` / `.yaml` next to the main file
//! 3. `concord.toml` / `concord.yaml` / `concord.yml`
//! 4. `CONCORD_*` environment variables, `__` between keys
//!    (`CONCORD_ANALYSIS__CALL_GRAPH_DEPTH=8`)
//! 5. single keys set with [`ConfigLoader::set`]
//!
//! Files are looked up in the search paths in order (by default the working
//! directory, then `<config dir>/concord`); the first directory holding a
//! main file is used. TOML needs the `toml-config` feature (on by default),
//! YAML the `yaml-config` feature.
//!
//! ```rust,ignore
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .set("wake.plugin_set", ["weather", "persona_tools"])
//!     .load()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "toml-config", feature = "yaml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use serde::Serialize;
use tracing::{debug, info};

use super::error::{ConfigError, ConfigResult};
use super::schema::ConcordConfig;
use super::validation::validate_config;

/// Environment variable selecting the profile.
pub const PROFILE_ENV: &str = "CONCORD_PROFILE";

const ENV_PREFIX: &str = "CONCORD_";

/// Main file names, in lookup order within one directory.
const MAIN_FILES: &[&str] = &["concord.toml", "concord.yaml", "concord.yml"];

/// Deployment profile; selects the `concord.{profile}.*` overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    /// Parses a profile name; `dev` and `prod` are accepted as short forms.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "development" | "dev" => Self::Development,
            "production" | "prod" => Self::Production,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Reads `CONCORD_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_ENV)
            .map(|name| Self::parse(&name))
            .unwrap_or_default()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a [`ConcordConfig`] from defaults, files, environment and code.
#[derive(Debug)]
pub struct ConfigLoader {
    base: ConcordConfig,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    file: Option<PathBuf>,
    env: bool,
    overrides: Figment,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Profile from `CONCORD_PROFILE`, default search paths, environment on.
    pub fn new() -> Self {
        Self {
            base: ConcordConfig::default(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            file: None,
            env: true,
            overrides: Figment::new(),
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Adds a directory to search; replaces the default search paths.
    pub fn search_path(mut self, path: impl AsRef<Path>) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Loads exactly this file instead of searching. It must exist.
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn without_env(mut self) -> Self {
        self.env = false;
        self
    }

    /// Replaces the built-in defaults with `config`; files and environment
    /// still apply on top.
    pub fn merge(mut self, config: ConcordConfig) -> Self {
        self.base = config;
        self
    }

    /// Sets one dotted key above every other layer.
    pub fn set<T: Serialize>(mut self, key: &str, value: T) -> Self {
        self.overrides = self.overrides.merge(Serialized::default(key, value));
        self
    }

    /// Extracts and validates the configuration.
    pub fn load(self) -> ConfigResult<ConcordConfig> {
        let profile = self.profile.clone();
        let config: ConcordConfig = self
            .figment()?
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        validate_config(&config)?;

        debug!(
            profile = %profile,
            wake_prefixes = config.wake.wake_prefix.len(),
            call_graph_depth = config.analysis.call_graph_depth,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn figment(self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(&self.base));

        for path in self.files()? {
            info!(path = %path.display(), "Loading configuration file");
            figment = merge_file(figment, &path)?;
        }

        if self.env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment.merge(self.overrides))
    }

    /// The files to load, profile overlay first.
    fn files(&self) -> ConfigResult<Vec<PathBuf>> {
        let main = match &self.file {
            Some(path) if path.exists() => path.clone(),
            Some(path) => return Err(ConfigError::FileNotFound(path.clone())),
            None => match self.find_main_file() {
                Some(path) => path,
                None => {
                    debug!("No configuration file found, using defaults");
                    return Ok(Vec::new());
                }
            },
        };

        let mut files = Vec::with_capacity(2);
        if let Some(overlay) = self.profile_overlay(&main) {
            files.push(overlay);
        }
        files.push(main);
        Ok(files)
    }

    fn find_main_file(&self) -> Option<PathBuf> {
        let defaults;
        let dirs = if self.search_paths.is_empty() {
            defaults = default_search_paths();
            &defaults
        } else {
            &self.search_paths
        };
        dirs.iter()
            .flat_map(|dir| MAIN_FILES.iter().map(move |name| dir.join(name)))
            .find(|path| path.is_file() && supported(path))
    }

    /// `concord.toml` -> `concord.production.toml`, when present.
    fn profile_overlay(&self, main: &Path) -> Option<PathBuf> {
        let stem = main.file_stem()?.to_str()?;
        let ext = main.extension()?.to_str()?;
        let overlay = main.with_file_name(format!("{stem}.{}.{ext}", self.profile));
        overlay.is_file().then_some(overlay)
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    std::env::current_dir()
        .ok()
        .into_iter()
        .chain(dirs::config_dir().map(|dir| dir.join("concord")))
        .collect()
}

fn supported(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => cfg!(feature = "toml-config"),
        Some("yaml" | "yml") => cfg!(feature = "yaml-config"),
        _ => false,
    }
}

#[allow(unused_variables)]
fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    match path.extension().and_then(|e| e.to_str()) {
        #[cfg(feature = "toml-config")]
        Some("toml") => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        Some("yaml" | "yml") => Ok(figment.merge(Yaml::file(path))),
        ext => Err(ConfigError::ParseError(format!(
            "{}: format .{} is not supported or its feature is disabled",
            path.display(),
            ext.unwrap_or("")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    fn empty_dir() -> PathBuf {
        std::env::temp_dir().join("concord-no-such-dir")
    }

    #[test]
    fn test_defaults_without_files() {
        let config = ConfigLoader::new()
            .search_path(empty_dir())
            .without_env()
            .load()
            .unwrap();
        assert_eq!(config, ConcordConfig::default());
    }

    #[test]
    fn test_profile_names() {
        assert_eq!(Profile::parse("PROD"), Profile::Production);
        assert_eq!(Profile::parse("dev"), Profile::Development);
        assert_eq!(Profile::parse("Staging"), Profile::Custom("staging".into()));
        assert_eq!(Profile::Production.to_string(), "production");
    }

    #[test]
    fn test_missing_file_is_reported() {
        let path = std::env::temp_dir().join("concord-missing.toml");
        let result = ConfigLoader::new().file(&path).without_env().load();
        assert!(matches!(result, Err(ConfigError::FileNotFound(p)) if p == path));
    }

    #[test]
    fn test_base_config_is_validated() {
        let mut bad = ConcordConfig::default();
        bad.analysis.call_graph_depth = 0;
        let result = ConfigLoader::new()
            .search_path(empty_dir())
            .without_env()
            .merge(bad)
            .load();
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_keyed_overrides() {
        let mut base = ConcordConfig::default();
        base.preview.default_sender_id = "tester".into();

        let config = ConfigLoader::new()
            .search_path(empty_dir())
            .without_env()
            .merge(base)
            .set("logging.level", "trace")
            .set("wake.plugin_set", ["weather"])
            .load()
            .unwrap();

        assert_eq!(config.logging.level, LogLevel::Trace);
        assert_eq!(config.wake.plugin_allowlist(), Some(vec!["weather".to_string()]));
        assert_eq!(config.preview.default_sender_id, "tester");
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_profile_overlay_under_main_file() {
        let dir = std::env::temp_dir().join(format!("concord-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("concord.toml"),
            r#"
[logging]
level = "debug"

[wake]
wake_prefix = ["!", "bot "]
plugin_set = ["weather"]
"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("concord.production.toml"),
            r#"
[logging]
level = "warn"

[analysis]
call_graph_depth = 3
"#,
        )
        .unwrap();

        let loaded = ConfigLoader::new()
            .profile("prod")
            .search_path(&dir)
            .without_env()
            .set("analysis.call_graph_depth", 9)
            .load();
        std::fs::remove_dir_all(&dir).ok();
        let config = loaded.unwrap();

        // The main file wins over the overlay; keyed overrides win over both.
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.wake.wake_prefix, vec!["!".to_string(), "bot ".to_string()]);
        assert_eq!(config.wake.plugin_allowlist(), Some(vec!["weather".to_string()]));
        assert!(config.wake.ignore_bot_self_message);
        assert_eq!(config.analysis.call_graph_depth, 9);
    }
}
