//! Bootstrap configuration.
//!
//! The binary takes one TOML file describing the runtime (worker count,
//! log sink) and the services to create at startup. The first `[[service]]`
//! entry becomes the bootstrap service.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use murmur_core::service::ServiceConf;
use serde::Deserialize;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Worker threads; 0 picks the available parallelism.
    #[serde(default)]
    pub thread: u32,
    #[serde(default)]
    pub logfile: Option<PathBuf>,
    #[serde(default)]
    pub loglevel: Option<String>,
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConf>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            thread = 2
            loglevel = "INFO"

            [[service]]
            type = "echo"
            name = "bootstrap"

            [[service]]
            type = "kv"
            name = "db"
            unique = true
            memlimit = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(config.thread, 2);
        assert!(config.enable_stdout);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].stype, "echo");
        assert!(config.services[1].unique);
        assert_eq!(config.services[1].memlimit, 1048576);
    }
}
