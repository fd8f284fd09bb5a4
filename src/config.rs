//! Project configuration.
//!
//! Configuration is read once, from an optional `tsumiki.toml` at the project
//! root, and then shared as an immutable value. Every field has a default, so
//! a project without a config file builds with the conventional layout:
//!
//! ```toml
//! output_dir = "dist"
//! server_port = 8080
//! batch_delay_ms = 200
//! cache_dir = ".cache"
//! persist_cache = true
//!
//! [sources]
//! html = "src"
//! styles = "src/scss"
//! scripts = "src/js"
//! images = "src/img"
//! ```

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the configuration file looked up at the project root.
pub const CONFIG_FILE: &str = "tsumiki.toml";

/// Root directories of the source trees consumed by the asset tasks,
/// relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceRoots {
    pub html: Utf8PathBuf,
    pub styles: Utf8PathBuf,
    pub scripts: Utf8PathBuf,
    pub images: Utf8PathBuf,
}

impl Default for SourceRoots {
    fn default() -> Self {
        Self {
            html: "src".into(),
            styles: "src/scss".into(),
            scripts: "src/js".into(),
            images: "src/img".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Project root. Every other path is resolved against it.
    #[serde(skip)]
    pub root: Utf8PathBuf,
    /// Directory the published outputs are written to.
    pub output_dir: Utf8PathBuf,
    pub sources: SourceRoots,
    /// Port of the development HTTP server.
    pub server_port: u16,
    /// Changes within this window are grouped into one build.
    pub batch_delay_ms: u64,
    /// Directory holding the persisted artifact cache.
    pub cache_dir: Utf8PathBuf,
    pub persist_cache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            output_dir: "dist".into(),
            sources: SourceRoots::default(),
            server_port: 8080,
            batch_delay_ms: 200,
            cache_dir: ".cache".into(),
            persist_cache: true,
        }
    }
}

impl Config {
    /// Parse a configuration from TOML text, rooted at `root`.
    pub fn from_toml(root: impl Into<Utf8PathBuf>, text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.root = root.into();
        Ok(config)
    }

    /// Load the configuration of the project at `root`.
    ///
    /// If `file` is given it must exist. Otherwise `tsumiki.toml` is looked
    /// up in `root`, and defaults are used when it is absent.
    pub fn load(root: &Utf8Path, file: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let path = match file {
            Some(file) => root.join(file),
            None => {
                let path = root.join(CONFIG_FILE);
                if !path.is_file() {
                    tracing::debug!("no {CONFIG_FILE} in {root}, using defaults");
                    return Ok(Self {
                        root: root.to_owned(),
                        ..Self::default()
                    });
                }
                path
            }
        };

        let text = fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
        Self::from_toml(root, &text)
    }

    /// Absolute (or root-relative) path of the output directory.
    pub fn output_path(&self) -> Utf8PathBuf {
        self.root.join(&self.output_dir)
    }

    pub fn cache_path(&self) -> Utf8PathBuf {
        self.root.join(&self.cache_dir)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}
