//! Host configuration, loaded from TOML.
//!
//! Every key is optional:
//!
//! ```toml
//! bind = "0.0.0.0:8080"
//! mount = "/app"
//! context_path = "/app"
//! web_root = "./site"
//! template_dir = "templates"
//! template_cache = true
//! expose_errors = false
//! max_request_bytes = 1048576
//! slow_request_ms = 3000
//! session_ttl_secs = 1800
//!
//! [params]
//! greeting = "hello"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    bind: String,
    mount: String,
    context_path: String,
    web_root: PathBuf,
    template_dir: PathBuf,
    template_cache: bool,
    expose_errors: bool,
    max_request_bytes: usize,
    slow_request_ms: u64,
    session_ttl_secs: u64,
    params: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
            mount: "/".to_owned(),
            context_path: String::new(),
            web_root: PathBuf::from("."),
            template_dir: PathBuf::from("templates"),
            template_cache: false,
            expose_errors: true,
            max_request_bytes: 8 * 1024 * 1024,
            slow_request_ms: 3000,
            session_ttl_secs: 30 * 60,
            params: HashMap::new(),
        }
    }
}

impl Config {
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, wrong value types or unknown keys.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn bind(&self) -> &str {
        &self.bind
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }

    /// The template directory resolved against the web root.
    pub fn template_root(&self) -> PathBuf {
        self.web_root.join(&self.template_dir)
    }

    pub fn template_cache(&self) -> bool {
        self.template_cache
    }

    pub fn expose_errors(&self) -> bool {
        self.expose_errors
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    pub fn slow_request(&self) -> Duration {
        Duration::from_millis(self.slow_request_ms)
    }

    /// Idle time after which a session is dropped.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
}
