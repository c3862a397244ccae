use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::cli::GlobalArgs;
use crate::sync::backoff::{Backoff, DEFAULT_MAX_RETRIES};
use crate::sync::scheduler::ScheduleOptions;
use crate::sync::store::StoreConfig;

const DEFAULT_CONCURRENCY: u64 = 1;
const DEFAULT_WAVE_DELAY_MS: u64 = 200;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 4;
const DEFAULT_TOKEN_FILE: &str = "token.json";

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub concurrency: usize,
    pub wave_delay: Duration,
    pub max_retries: u32,
    pub http_timeout: Duration,
    pub upload_concurrency: usize,
    pub report_dir: PathBuf,
    pub report_name: Option<String>,
    pub concatenate: bool,
    pub drive_api_base: Option<String>,
    pub admin_base: Option<String>,
    pub drive_token: Option<String>,
    pub token_file: PathBuf,
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read_u64 = |name: &str, default: u64| -> u64 {
            lookup(name)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let read_string = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        Self {
            concurrency: read_u64("SITEMIG_CONCURRENCY", DEFAULT_CONCURRENCY).max(1) as usize,
            wave_delay: Duration::from_millis(read_u64(
                "SITEMIG_WAVE_DELAY_MS",
                DEFAULT_WAVE_DELAY_MS,
            )),
            max_retries: read_u64("SITEMIG_MAX_RETRIES", u64::from(DEFAULT_MAX_RETRIES))
                .min(u64::from(u32::MAX)) as u32,
            http_timeout: Duration::from_secs(
                read_u64("SITEMIG_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS).max(1),
            ),
            upload_concurrency: read_u64("SITEMIG_UPLOAD_CONCURRENCY", DEFAULT_UPLOAD_CONCURRENCY)
                .max(1) as usize,
            report_dir: read_string("SITEMIG_REPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            report_name: None,
            concatenate: true,
            drive_api_base: read_string("SITEMIG_DRIVE_API_BASE"),
            admin_base: read_string("SITEMIG_ADMIN_BASE"),
            drive_token: read_string("SITEMIG_DRIVE_TOKEN"),
            token_file: read_string("SITEMIG_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE)),
        }
    }

    /// Command line flags win over the environment.
    pub fn apply(mut self, args: &GlobalArgs) -> Self {
        if let Some(concurrency) = args.concurrency {
            self.concurrency = concurrency.max(1);
        }
        if let Some(ms) = args.wave_delay_ms {
            self.wave_delay = Duration::from_millis(ms);
        }
        if let Some(max_retries) = args.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(dir) = &args.report_dir {
            self.report_dir = dir.clone();
        }
        if let Some(name) = &args.report_name {
            self.report_name = Some(name.clone());
        }
        if args.no_concatenate {
            self.concatenate = false;
        }
        self
    }

    pub fn schedule_options(&self) -> ScheduleOptions {
        ScheduleOptions::new(self.concurrency, self.wave_delay)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::default()
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            upload_concurrency: self.upload_concurrency,
        }
    }

    pub fn report_name_or(&self, default: &str) -> String {
        self.report_name
            .clone()
            .unwrap_or_else(|| default.to_string())
    }

    /// Bearer token for the document store: the flag (a raw token or a token
    /// JSON file), then `SITEMIG_DRIVE_TOKEN`, then the token file.
    pub fn resolve_token(&self, flag: Option<&str>) -> anyhow::Result<String> {
        if let Some(value) = flag.map(str::trim).filter(|v| !v.is_empty()) {
            let path = Path::new(value);
            if path.is_file() {
                return read_token_file(path);
            }
            return Ok(value.to_string());
        }
        if let Some(token) = &self.drive_token {
            return Ok(token.trim().to_string());
        }
        if self.token_file.is_file() {
            return read_token_file(&self.token_file);
        }
        anyhow::bail!(
            "no access token: pass --token, set SITEMIG_DRIVE_TOKEN or provide {}",
            self.token_file.display()
        )
    }
}

#[derive(Deserialize)]
struct TokenFile {
    access_token: String,
}

fn read_token_file(path: &Path) -> anyhow::Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read token file {}", path.display()))?;
    let token: TokenFile = serde_json::from_str(&raw)
        .with_context(|| format!("token file {} has no access_token", path.display()))?;
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> RunConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config(&[]);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.wave_delay, Duration::from_millis(200));
        assert_eq!(config.max_retries, 20);
        assert_eq!(config.http_timeout, Duration::from_secs(60));
        assert_eq!(config.report_dir, PathBuf::from("."));
        assert!(config.concatenate);
        assert_eq!(config.report_name_or("upload-report"), "upload-report");
    }

    #[test]
    fn reads_environment_overrides() {
        let config = config(&[
            ("SITEMIG_CONCURRENCY", "8"),
            ("SITEMIG_WAVE_DELAY_MS", "0"),
            ("SITEMIG_MAX_RETRIES", "3"),
            ("SITEMIG_REPORT_DIR", "/tmp/reports"),
            ("SITEMIG_DRIVE_API_BASE", "http://127.0.0.1:9000"),
            ("SITEMIG_UPLOAD_CONCURRENCY", "oops"),
        ]);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.wave_delay, Duration::ZERO);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.report_dir, PathBuf::from("/tmp/reports"));
        assert_eq!(config.drive_api_base.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.upload_concurrency, 4);
    }

    #[test]
    fn flags_override_environment() {
        let args = GlobalArgs {
            concurrency: Some(0),
            wave_delay_ms: Some(50),
            max_retries: Some(1),
            report_dir: None,
            report_name: Some("nightly".into()),
            no_concatenate: true,
        };
        let config = config(&[("SITEMIG_CONCURRENCY", "8")]).apply(&args);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.wave_delay, Duration::from_millis(50));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.report_name_or("upload-report"), "nightly");
        assert!(!config.concatenate);
    }

    #[test]
    fn token_sources_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("token.json");
        std::fs::write(&file, r#"{"access_token":"from-file","expiry_date":1}"#).unwrap();

        let mut config = config(&[("SITEMIG_DRIVE_TOKEN", "from-env")]);
        config.token_file = file.clone();
        assert_eq!(config.resolve_token(Some("raw")).unwrap(), "raw");
        assert_eq!(
            config.resolve_token(file.to_str()).unwrap(),
            "from-file"
        );
        assert_eq!(config.resolve_token(None).unwrap(), "from-env");

        config.drive_token = None;
        assert_eq!(config.resolve_token(None).unwrap(), "from-file");
        config.token_file = dir.path().join("missing.json");
        assert!(config.resolve_token(None).is_err());
    }
}
