//! Runtime configuration shared by the `backend` and `reelctl` binaries.
//!
//! Settings live in a `KEY=VALUE` env file (the same format systemd's
//! `EnvironmentFile=` understands). Values exported in the process environment
//! take precedence over the file so containers can override single keys.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/reelstory-env";
pub const CONFIG_PATH_VAR: &str = "REELSTORY_CONFIG";
pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/reelstory/reelstory.db";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PLACEHOLDER_THUMBNAIL: &str =
    "https://via.placeholder.com/640x360?text=No+Thumbnail";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30;

/// Raw key/value view of the config, before defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    values: BTreeMap<String, String>,
}

impl EnvConfig {
    /// Builds a config from `KEY=VALUE` pairs; later pairs override earlier
    /// ones and empty values are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut cfg = Self::default();
        cfg.overlay(pairs);
        cfg
    }

    pub fn overlay<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in pairs {
            let value = value.into();
            if !value.is_empty() {
                self.values.insert(key.into(), value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Fully resolved settings with defaults applied.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub supabase: Option<SupabaseConfig>,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub anon_key: String,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Firebase {
        bucket: String,
        auth_token: Option<String>,
    },
    /// `DISABLE_FIREBASE=true`: objects only live in process memory.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub default_drama_id: Option<String>,
    /// `(file name prefix, drama id)` pairs from `SYNC_DRAMA_MAP`.
    pub drama_map: Vec<(String, String)>,
    pub placeholder_thumbnail: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_drama_id: None,
            drama_map: Vec::new(),
            placeholder_thumbnail: DEFAULT_PLACEHOLDER_THUMBNAIL.to_string(),
        }
    }
}

/// Parses the env file at `path`. A missing file is not an error because every
/// key can also come from the process environment.
pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let pairs = content.lines().filter_map(|line| {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        trimmed.split_once('=').map(|(key, value_raw)| {
            (
                key.trim().to_string(),
                value_raw.trim().trim_matches('"').to_string(),
            )
        })
    });
    Ok(Some(EnvConfig::from_pairs(pairs)))
}

/// Where to look for the env file when no `--config` flag was given.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Reads the env file and overlays the process environment on top of it.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let mut cfg = read_env_config(path)?.unwrap_or_default();
    cfg.overlay(std::env::vars());
    resolve(&cfg).with_context(|| format!("resolving configuration from {}", path.display()))
}

pub fn resolve(cfg: &EnvConfig) -> Result<RuntimeConfig> {
    let database_path = cfg
        .get("DATABASE_PATH")
        .or_else(|| cfg.get("DATABASE_URL"))
        .map(strip_database_scheme)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));

    let port = match cfg.get("REELSTORY_PORT") {
        Some(value) => value
            .parse::<u16>()
            .with_context(|| format!("Parsing REELSTORY_PORT value {value:?}"))?,
        None => DEFAULT_PORT,
    };
    let host = cfg.get("REELSTORY_HOST").unwrap_or(DEFAULT_HOST).to_string();

    let supabase = match (cfg.get("SUPABASE_URL"), cfg.get("SUPABASE_ANON_KEY")) {
        (Some(url), Some(anon_key)) => Some(SupabaseConfig {
            url: url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        }),
        (None, None) => None,
        (Some(_), None) => return Err(anyhow!("SUPABASE_URL is set but SUPABASE_ANON_KEY is not")),
        (None, Some(_)) => return Err(anyhow!("SUPABASE_ANON_KEY is set but SUPABASE_URL is not")),
    };

    let storage = if parse_flag(cfg.get("DISABLE_FIREBASE")) {
        StorageConfig::Disabled
    } else {
        let bucket = cfg
            .get("FIREBASE_STORAGE_BUCKET")
            .ok_or_else(|| anyhow!("FIREBASE_STORAGE_BUCKET not set (or set DISABLE_FIREBASE=true)"))?;
        StorageConfig::Firebase {
            bucket: bucket.to_string(),
            auth_token: cfg.get("FIREBASE_AUTH_TOKEN").map(str::to_string),
        }
    };

    let sync = SyncConfig {
        default_drama_id: cfg.get("SYNC_DRAMA_ID").map(str::to_string),
        drama_map: parse_drama_map(cfg.get("SYNC_DRAMA_MAP").unwrap_or_default())?,
        placeholder_thumbnail: cfg
            .get("PLACEHOLDER_THUMBNAIL_URL")
            .unwrap_or(DEFAULT_PLACEHOLDER_THUMBNAIL)
            .to_string(),
    };

    let cache_ttl = match cfg.get("CACHE_TTL_SECS") {
        Some(value) => Duration::from_secs(
            value
                .parse()
                .with_context(|| format!("Parsing CACHE_TTL_SECS value {value:?}"))?,
        ),
        None => Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
    };

    Ok(RuntimeConfig {
        database_path,
        host,
        port,
        supabase,
        storage,
        sync,
        cache_ttl,
    })
}

fn strip_database_scheme(value: &str) -> &str {
    value
        .strip_prefix("sqlite://")
        .or_else(|| value.strip_prefix("sqlite:"))
        .or_else(|| value.strip_prefix("file:"))
        .unwrap_or(value)
}

fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// `SYNC_DRAMA_MAP="romance-=abc,thriller-=def"`
fn parse_drama_map(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (prefix, drama_id) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("SYNC_DRAMA_MAP entry {entry:?} is not prefix=dramaId"))?;
            let (prefix, drama_id) = (prefix.trim(), drama_id.trim());
            if prefix.is_empty() || drama_id.is_empty() {
                return Err(anyhow!("SYNC_DRAMA_MAP entry {entry:?} has an empty side"));
            }
            Ok((prefix.to_string(), drama_id.to_string()))
        })
        .collect()
}
