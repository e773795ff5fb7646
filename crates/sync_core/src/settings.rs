use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid url for {field}: {source}")]
    Url {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value for {field}: {value}")]
    Value { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub hub_base_url: String,
    pub api_base_url: String,
    pub page_size: u32,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
    pub invoke_timeout: Duration,
    pub reconnect_delays: Vec<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            hub_base_url: "http://localhost:5000/hubs".into(),
            api_base_url: "http://localhost:5000/api".into(),
            page_size: 15,
            poll_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(10),
            invoke_timeout: Duration::from_secs(30),
            reconnect_delays: [0, 2, 10, 30].map(Duration::from_secs).to_vec(),
        }
    }
}

/// Keys accepted in `sync.toml`; every one is optional.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    hub_base_url: Option<String>,
    api_base_url: Option<String>,
    page_size: Option<u32>,
    poll_interval_ms: Option<u64>,
    ready_timeout_ms: Option<u64>,
    invoke_timeout_ms: Option<u64>,
    reconnect_delays_ms: Option<Vec<u64>>,
}

impl SyncSettings {
    /// Defaults, then the file at `path` when it exists, then `SYNC_*`
    /// environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let mut settings = Self::default();

        if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let file_cfg: FileSettings =
                toml::from_str(&raw).map_err(|source| SettingsError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            settings.apply_file(file_cfg)?;
        }

        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_file(&mut self, file_cfg: FileSettings) -> Result<(), SettingsError> {
        if let Some(v) = file_cfg.hub_base_url {
            self.hub_base_url = v;
        }
        if let Some(v) = file_cfg.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = file_cfg.page_size {
            self.page_size = positive("page_size", v)?;
        }
        if let Some(v) = file_cfg.poll_interval_ms {
            self.poll_interval = nonzero_millis("poll_interval_ms", v)?;
        }
        if let Some(v) = file_cfg.ready_timeout_ms {
            self.ready_timeout = nonzero_millis("ready_timeout_ms", v)?;
        }
        if let Some(v) = file_cfg.invoke_timeout_ms {
            self.invoke_timeout = nonzero_millis("invoke_timeout_ms", v)?;
        }
        if let Some(v) = file_cfg.reconnect_delays_ms {
            self.reconnect_delays = v.into_iter().map(Duration::from_millis).collect();
        }
        Ok(())
    }

    fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SettingsError> {
        if let Some(v) = lookup("SYNC_HUB_BASE_URL") {
            self.hub_base_url = v;
        }
        if let Some(v) = lookup("SYNC_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("SYNC_PAGE_SIZE") {
            let parsed = v.trim().parse::<u32>().map_err(|_| SettingsError::Value {
                field: "SYNC_PAGE_SIZE",
                value: v.clone(),
            })?;
            self.page_size = positive("SYNC_PAGE_SIZE", parsed)?;
        }
        if let Some(v) = lookup("SYNC_POLL_INTERVAL_MS") {
            let field = "SYNC_POLL_INTERVAL_MS";
            self.poll_interval = nonzero_millis(field, parse_number(field, &v)?)?;
        }
        if let Some(v) = lookup("SYNC_READY_TIMEOUT_MS") {
            let field = "SYNC_READY_TIMEOUT_MS";
            self.ready_timeout = nonzero_millis(field, parse_number(field, &v)?)?;
        }
        if let Some(v) = lookup("SYNC_INVOKE_TIMEOUT_MS") {
            let field = "SYNC_INVOKE_TIMEOUT_MS";
            self.invoke_timeout = nonzero_millis(field, parse_number(field, &v)?)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        parse_url("hub_base_url", &self.hub_base_url)?;
        self.api_base()?;
        Ok(())
    }

    /// `{hubBase}/{hub}`; a trailing slash on the base is tolerated.
    pub fn hub_url(&self, hub: &str) -> Result<Url, SettingsError> {
        let raw = format!("{}/{}", self.hub_base_url.trim().trim_end_matches('/'), hub);
        parse_url("hub_base_url", &raw)
    }

    pub fn api_base(&self) -> Result<Url, SettingsError> {
        parse_url("api_base_url", &self.api_base_url)
    }
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, SettingsError> {
    Url::parse(raw.trim()).map_err(|source| SettingsError::Url { field, source })
}

fn parse_number(field: &'static str, raw: &str) -> Result<u64, SettingsError> {
    raw.trim().parse::<u64>().map_err(|_| SettingsError::Value {
        field,
        value: raw.to_string(),
    })
}

// Zero would make the poll interval panic and every wait time out at once.
fn nonzero_millis(field: &'static str, value: u64) -> Result<Duration, SettingsError> {
    if value == 0 {
        return Err(SettingsError::Value {
            field,
            value: value.to_string(),
        });
    }
    Ok(Duration::from_millis(value))
}

fn positive(field: &'static str, value: u32) -> Result<u32, SettingsError> {
    if value == 0 {
        return Err(SettingsError::Value {
            field,
            value: value.to_string(),
        });
    }
    Ok(value)
}
