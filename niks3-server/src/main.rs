use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use niks3_server::config;
use niks3_server::config::{CliOverrides, Config};

/// Nix binary-cache write coordinator and garbage collector.
///
/// Every flag below overrides the matching config-file field; unset flags
/// leave the config file (or its env/XDG fallback) untouched.
#[derive(Debug, Parser)]
#[clap(version, author = "niks3 authors")]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Socket address to listen on.
    ///
    /// This overrides `listen.address` in the config.
    #[clap(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Mode to run.
    #[clap(long, default_value = "monolithic")]
    mode: ServerMode,

    /// Database connection string. Overrides `database.url`.
    #[clap(long)]
    db: Option<String>,

    /// HTTP listen address. Alias for `--listen`.
    #[clap(long)]
    http_addr: Option<SocketAddr>,

    /// S3-compatible endpoint URL.
    #[clap(long)]
    s3_endpoint: Option<String>,

    /// S3 access key ID.
    #[clap(long)]
    s3_access_key: Option<String>,

    /// S3 secret access key.
    #[clap(long)]
    s3_secret_key: Option<String>,

    /// Whether to connect to S3 over TLS.
    #[clap(long)]
    s3_use_ssl: Option<bool>,

    /// Use IAM/environment credentials instead of an explicit key pair.
    #[clap(long)]
    s3_use_iam: bool,

    /// S3 bucket name.
    #[clap(long)]
    s3_bucket: Option<String>,

    /// S3 region.
    #[clap(long)]
    s3_region: Option<String>,

    /// Bound on concurrent S3 calls.
    #[clap(long)]
    s3_concurrency: Option<usize>,

    /// Initial S3 rate limit, in requests/second.
    #[clap(long)]
    s3_rate_limit: Option<f64>,

    /// Bearer token clients must present. Overrides `auth.token`.
    #[clap(long)]
    api_token: Option<String>,

    /// Path to a file holding the bearer token. Overrides `auth.token_path`.
    #[clap(long)]
    api_token_path: Option<PathBuf>,

    /// Path to a Nix signing key. May be given more than once.
    #[clap(long)]
    sign_key_path: Vec<PathBuf>,

    /// Public base URL the cache is served from.
    #[clap(long)]
    cache_url: Option<String>,

    /// Enable the unauthenticated read proxy.
    #[clap(long)]
    enable_read_proxy: bool,

    /// Host header the read proxy will accept. May be given more than once.
    #[clap(long)]
    allowed_host: Vec<String>,
}

impl Opts {
    fn cli_overrides(&self) -> CliOverrides {
        CliOverrides {
            db: self.db.clone(),
            http_addr: self.http_addr.or(self.listen),
            s3_endpoint: self.s3_endpoint.clone(),
            s3_access_key: self.s3_access_key.clone(),
            s3_secret_key: self.s3_secret_key.clone(),
            s3_use_ssl: self.s3_use_ssl,
            s3_use_iam: self.s3_use_iam,
            s3_bucket: self.s3_bucket.clone(),
            s3_region: self.s3_region.clone(),
            s3_concurrency: self.s3_concurrency,
            s3_rate_limit: self.s3_rate_limit,
            api_token: self.api_token.clone(),
            api_token_path: self.api_token_path.clone(),
            sign_key_path: self.sign_key_path.clone(),
            cache_url: self.cache_url.clone(),
            enable_read_proxy: self.enable_read_proxy,
            allowed_host: self.allowed_host.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run the API server and the periodic garbage collector together.
    Monolithic,

    /// Run the API server only.
    ApiServer,

    /// Run the garbage collector periodically.
    GarbageCollector,

    /// Run the database migrations then exit.
    DbMigrations,

    /// Run garbage collection once then exit.
    GarbageCollectorOnce,

    /// Check the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    init_logging();
    dump_version();

    let mut config = match config::load_config(opts.config.as_deref())? {
        Some(config) => config,
        None => {
            display_no_config_msg();
            exit(1);
        }
    };
    opts.cli_overrides().apply(&mut config);

    match opts.mode {
        ServerMode::Monolithic => {
            let (api_server, _) = tokio::join!(
                niks3_server::run_api_server(opts.listen, config.clone()),
                niks3_server::run_garbage_collection(config),
            );
            api_server?;
        }
        ServerMode::ApiServer => {
            niks3_server::run_api_server(opts.listen, config).await?;
        }
        ServerMode::GarbageCollector => {
            niks3_server::run_garbage_collection(config).await?;
        }
        ServerMode::DbMigrations => {
            niks3_server::run_migrations(config).await?;
        }
        ServerMode::GarbageCollectorOnce => {
            let stats = niks3_server::run_garbage_collection_once(config).await?;
            eprintln!("{}", serde_json::to_string_pretty(&stats)?);
        }
        ServerMode::CheckConfig => {
            eprintln!("Config looks good!");
        }
    }

    Ok(())
}

fn display_no_config_msg() {
    eprintln!();
    eprintln!("No config found, please provide a config.toml file");
}

fn init_logging() {
    let env_filter = EnvFilter::from_default_env();
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);
    let error_layer = ErrorLayer::default();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(error_layer)
        .init();
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("niks3d {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("niks3d {} (release)", env!("CARGO_PKG_VERSION"));
}
