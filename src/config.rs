use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::api::DEFAULT_API_BASE;
use crate::fetcher::FetchConfig;
use crate::pipeline::CrawlSettings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bilicomments-env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_JOBS_DB: &str = "jobs.db";
const DEFAULT_CREDENTIAL_SUBDIR: &str = "credentials";

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub output_root: Option<PathBuf>,
    pub jobs_db: Option<PathBuf>,
    pub credential_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub output_root: PathBuf,
    pub jobs_db: PathBuf,
    pub credential_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub api_base: String,
}

impl RuntimeConfig {
    pub fn crawl_settings(&self, fetch: FetchConfig) -> CrawlSettings {
        CrawlSettings {
            api_base: self.api_base.clone(),
            credential_dir: self.credential_dir.clone(),
            output_root: self.output_root.clone(),
            fetch,
        }
    }
}

/// Parses a `KEY="value"` file. A missing file is `Ok(None)`; unknown keys
/// are ignored.
pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value_raw)) = trimmed.split_once('=') else {
            continue;
        };
        let value = value_raw.trim().trim_matches('"');
        let non_empty = || (!value.is_empty()).then(|| value.to_string());
        match key.trim() {
            "OUTPUT_ROOT" => cfg.output_root = non_empty().map(PathBuf::from),
            "JOBS_DB" => cfg.jobs_db = non_empty().map(PathBuf::from),
            "CREDENTIAL_DIR" => cfg.credential_dir = non_empty().map(PathBuf::from),
            "BILICOMMENTS_HOST" => cfg.host = non_empty(),
            "BILICOMMENTS_PORT" => {
                let port: u16 = value.parse().with_context(|| {
                    format!("Parsing BILICOMMENTS_PORT from {}", path.display())
                })?;
                cfg.port = Some(port);
            }
            "API_BASE" => cfg.api_base = non_empty(),
            _ => {}
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?
        .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?;
    let output_root = cfg
        .output_root
        .ok_or_else(|| anyhow!("OUTPUT_ROOT not set in {}", path.display()))?;
    let jobs_db = cfg
        .jobs_db
        .unwrap_or_else(|| output_root.join(DEFAULT_JOBS_DB));
    let credential_dir = cfg
        .credential_dir
        .unwrap_or_else(|| output_root.join(DEFAULT_CREDENTIAL_SUBDIR));
    Ok(RuntimeConfig {
        jobs_db,
        credential_dir,
        host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cfg.port.unwrap_or(DEFAULT_PORT),
        api_base: cfg
            .api_base
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        output_root,
    })
}
