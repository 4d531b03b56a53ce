//! Server configuration.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::Deserialize;
use xdg::BaseDirectories;

use crate::gc::GcParams;
use crate::storage::{S3CredentialsConfig, S3StorageConfig};

/// Application prefix in XDG base directories.
const XDG_PREFIX: &str = "niks3";

/// Environment variable storing the Base64-encoded TOML configuration.
const ENV_CONFIG_BASE64: &str = "NIKS3_CONFIG_BASE64";

/// Environment variable storing the bearer token directly, as an
/// alternative to `[auth] token` / `token_path`.
const ENV_API_TOKEN: &str = "NIKS3_API_TOKEN";

/// Environment variable storing the database connection string.
const ENV_DATABASE_URL: &str = "NIKS3_DATABASE_URL";

/// Minimum acceptable bearer-token length, per the authentication model.
const MIN_TOKEN_LEN: usize = 36;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    pub database: DatabaseConfig,

    pub storage: StorageConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub garbage_collection: GarbageCollectionConfig,

    #[serde(default)]
    pub read_proxy: ReadProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
        }
    }
}

fn default_listen_address() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "load_database_url_from_env")]
    pub url: String,
}

fn load_database_url_from_env() -> String {
    env::var(ENV_DATABASE_URL).unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(flatten)]
    pub s3: S3StorageConfig,

    /// Bound on concurrent S3 calls issued by the multipart-abort and
    /// bulk-delete worker pools.
    #[serde(default = "default_s3_concurrency")]
    pub s3_concurrency: usize,

    /// Initial rate-limiter throughput, in requests/second. Zero (the
    /// default) leaves the limiter disabled until the first throttle.
    #[serde(default)]
    pub s3_rate_limit: f64,
}

fn default_s3_concurrency() -> usize {
    100
}

/// Bearer-token authentication. Exactly one of `token`/`token_path` must
/// resolve to a token at least `MIN_TOKEN_LEN` bytes long.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub token: Option<String>,
    pub token_path: Option<PathBuf>,
}

impl AuthConfig {
    fn resolve(self) -> Result<ResolvedAuthConfig> {
        let token = if let Some(token) = self.token {
            token
        } else if let Some(path) = self.token_path {
            std::fs::read_to_string(&path)
                .with_context(|| format!("reading token file {}", path.display()))?
                .trim()
                .to_owned()
        } else if let Ok(token) = env::var(ENV_API_TOKEN) {
            token
        } else {
            anyhow::bail!("no API token configured: set [auth] token, token_path, or {ENV_API_TOKEN}");
        };

        anyhow::ensure!(
            token.len() >= MIN_TOKEN_LEN,
            "API token must be at least {MIN_TOKEN_LEN} bytes long"
        );

        Ok(ResolvedAuthConfig { token })
    }
}

/// `AuthConfig` after its token has been read from whichever source was
/// configured, ready for the constant-time comparison in
/// `crate::middleware`.
#[derive(Clone)]
pub struct ResolvedAuthConfig {
    pub token: String,
}

impl std::fmt::Debug for ResolvedAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ResolvedAuthConfig").field("token", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    #[serde(default)]
    pub keys: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GarbageCollectionConfig {
    #[serde(with = "humantime_serde", default = "default_gc_interval")]
    pub interval: Duration,

    #[serde(with = "humantime_serde", default = "default_retention_period")]
    pub default_retention_period: Duration,

    #[serde(with = "humantime_serde", default = "default_failed_uploads_retention_period")]
    pub failed_uploads_retention_period: Duration,
}

impl Default for GarbageCollectionConfig {
    fn default() -> Self {
        Self {
            interval: default_gc_interval(),
            default_retention_period: default_retention_period(),
            failed_uploads_retention_period: default_failed_uploads_retention_period(),
        }
    }
}

impl GarbageCollectionConfig {
    /// Builds the defaults a `DELETE /api/closures` call starts from
    /// before query-parameter overrides are applied.
    pub fn params(&self, s3_concurrency: usize) -> GcParams {
        GcParams {
            older_than: self.default_retention_period,
            failed_uploads_older_than: self.failed_uploads_retention_period,
            force: false,
            s3_concurrency,
        }
    }
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_retention_period() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

/// Must exceed `protocol::PRESIGN_TTL` (5h) so a still-valid presigned
/// URL can never outlive the ledger row it was issued against.
fn default_failed_uploads_retention_period() -> Duration {
    Duration::from_secs(6 * 3600)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ReadProxyConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Public base URL the cache is served from, reported in startup logs.
    /// Purely informational: every path this server hands out (narinfo
    /// `URL:` lines, presigned S3 URLs) is already absolute or
    /// proxy-relative on its own.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configuration: {:?}", path);
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    Ok(toml::from_str(&contents)?)
}

fn load_config_from_str(s: &str) -> Result<Config> {
    tracing::info!("Using configuration from environment variable");
    Ok(toml::from_str(s)?)
}

/// Loads the configuration, in order of precedence: an explicit
/// `--config` path, `NIKS3_CONFIG_BASE64`, then the XDG-resolved config
/// file. Returns `None` if none of these are available.
pub fn load_config(config_path: Option<&Path>) -> Result<Option<Config>> {
    if let Some(config_path) = config_path {
        return Ok(Some(load_config_from_path(config_path)?));
    }

    if let Ok(encoded) = env::var(ENV_CONFIG_BASE64) {
        let decoded = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .context("decoding NIKS3_CONFIG_BASE64")?;
        let decoded = String::from_utf8(decoded).context("NIKS3_CONFIG_BASE64 is not valid UTF-8")?;
        return Ok(Some(load_config_from_str(&decoded)?));
    }

    let xdg_path = get_xdg_config_path()?;
    if xdg_path.exists() {
        return Ok(Some(load_config_from_path(&xdg_path)?));
    }

    Ok(None)
}

pub fn get_xdg_config_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    Ok(xdg_dirs.place_config_file("server.toml")?)
}

pub(crate) fn resolve_auth(config: AuthConfig) -> Result<ResolvedAuthConfig> {
    config.resolve()
}

/// Command-line overrides layered on top of a loaded [`Config`], one field
/// per `niks3d` flag. Every field is optional; `None` leaves the
/// corresponding config value untouched.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub db: Option<String>,
    pub http_addr: Option<SocketAddr>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_use_ssl: Option<bool>,
    pub s3_use_iam: bool,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_concurrency: Option<usize>,
    pub s3_rate_limit: Option<f64>,
    pub api_token: Option<String>,
    pub api_token_path: Option<PathBuf>,
    pub sign_key_path: Vec<PathBuf>,
    pub cache_url: Option<String>,
    pub enable_read_proxy: bool,
    pub allowed_host: Vec<String>,
}

impl CliOverrides {
    /// Applies the overrides to `config` in place.
    pub fn apply(self, config: &mut Config) {
        if let Some(db) = self.db {
            config.database.url = db;
        }
        if let Some(http_addr) = self.http_addr {
            config.listen.address = http_addr;
        }
        if let Some(endpoint) = self.s3_endpoint {
            // `--s3-use-ssl=false` plus a bare host is the only case where
            // a scheme needs adding; a full `http(s)://...` endpoint passes
            // through untouched.
            config.storage.s3.endpoint = Some(match self.s3_use_ssl {
                Some(false) if !endpoint.contains("://") => format!("http://{endpoint}"),
                _ => endpoint,
            });
        }
        if let (Some(access_key_id), Some(secret_access_key)) =
            (self.s3_access_key, self.s3_secret_key)
        {
            config.storage.s3.credentials = Some(S3CredentialsConfig {
                access_key_id,
                secret_access_key,
            });
        }
        if self.s3_use_iam {
            config.storage.s3.credentials = None;
        }
        if let Some(bucket) = self.s3_bucket {
            config.storage.s3.bucket = bucket;
        }
        if let Some(region) = self.s3_region {
            config.storage.s3.region = region;
        }
        if let Some(s3_concurrency) = self.s3_concurrency {
            config.storage.s3_concurrency = s3_concurrency;
        }
        if let Some(s3_rate_limit) = self.s3_rate_limit {
            config.storage.s3_rate_limit = s3_rate_limit;
        }
        if let Some(token) = self.api_token {
            config.auth.token = Some(token);
        }
        if let Some(token_path) = self.api_token_path {
            config.auth.token_path = Some(token_path);
        }
        if !self.sign_key_path.is_empty() {
            config.signing.keys = self.sign_key_path;
        }
        if let Some(cache_url) = self.cache_url {
            config.read_proxy.public_url = Some(cache_url);
        }
        if self.enable_read_proxy {
            config.read_proxy.enabled = true;
        }
        if !self.allowed_host.is_empty() {
            config.read_proxy.allowed_hosts = self.allowed_host;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        toml::from_str(
            r#"
            [database]
            url = "postgres://localhost/niks3"

            [storage]
            region = "us-east-1"
            bucket = "cache"
            endpoint = ""
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_auth_config_rejects_short_token() {
        let config = AuthConfig {
            token: Some("too-short".to_owned()),
            token_path: None,
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_auth_config_accepts_long_enough_token() {
        let config = AuthConfig {
            token: Some("a".repeat(MIN_TOKEN_LEN)),
            token_path: None,
        };
        assert_eq!(config.resolve().unwrap().token, "a".repeat(MIN_TOKEN_LEN));
    }

    #[test]
    fn test_cli_overrides_leave_unset_fields_untouched() {
        let mut config = sample_config();
        CliOverrides::default().apply(&mut config);
        assert_eq!(config.storage.s3.bucket, "cache");
        assert!(config.auth.token.is_none());
    }

    #[test]
    fn test_cli_overrides_apply_s3_and_auth_fields() {
        let mut config = sample_config();
        let overrides = CliOverrides {
            s3_bucket: Some("other-bucket".to_owned()),
            s3_access_key: Some("AKIA".to_owned()),
            s3_secret_key: Some("secret".to_owned()),
            api_token: Some("b".repeat(MIN_TOKEN_LEN)),
            ..Default::default()
        };
        overrides.apply(&mut config);

        assert_eq!(config.storage.s3.bucket, "other-bucket");
        assert_eq!(
            config.storage.s3.credentials.as_ref().unwrap().access_key_id,
            "AKIA"
        );
        assert_eq!(config.auth.token.as_deref(), Some("b".repeat(MIN_TOKEN_LEN)).as_deref());
    }

    #[test]
    fn test_cli_overrides_s3_use_iam_clears_credentials() {
        let mut config = sample_config();
        CliOverrides {
            s3_access_key: Some("AKIA".to_owned()),
            s3_secret_key: Some("secret".to_owned()),
            ..Default::default()
        }
        .apply(&mut config);
        assert!(config.storage.s3.credentials.is_some());

        CliOverrides {
            s3_use_iam: true,
            ..Default::default()
        }
        .apply(&mut config);
        assert!(config.storage.s3.credentials.is_none());
    }
}
