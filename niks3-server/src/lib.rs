#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

mod api;
pub mod config;
pub mod database;
mod error;
pub mod gc;
mod middleware;
mod narinfo;
pub mod protocol;
pub mod read_proxy;
mod ratelimit;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::Extension;
use axum::http::Uri;
use axum::Router;
use sea_orm::{Database, DatabaseConnection};
use tokio::sync::OnceCell;
use tower_http::catch_panic::CatchPanicLayer;

use config::{resolve_auth, Config, ResolvedAuthConfig};
use database::migration::{Migrator, MigratorTrait};
use database::Ledger;
use error::{ServerError, ServerResult};
use gc::GcParams;
use middleware::{require_bearer_token, restrict_host};
use niks3::signing::NixKeypair;
use storage::{ObjectStore, S3Backend};

pub type State = Arc<StateInner>;

/// Global server state, shared across every request and the background
/// garbage collector.
#[derive(Debug)]
pub struct StateInner {
    pub(crate) config: Config,
    pub(crate) auth: ResolvedAuthConfig,
    pub(crate) signing_keys: Vec<NixKeypair>,
    database: OnceCell<DatabaseConnection>,
    storage: OnceCell<Arc<dyn ObjectStore>>,
}

impl StateInner {
    async fn new(config: Config) -> Result<State> {
        let auth = resolve_auth(config.auth.clone())?;
        let signing_keys = load_signing_keys(&config)?;

        Ok(Arc::new(Self {
            config,
            auth,
            signing_keys,
            database: OnceCell::new(),
            storage: OnceCell::new(),
        }))
    }

    pub(crate) async fn database(&self) -> ServerResult<&DatabaseConnection> {
        self.database
            .get_or_try_init(|| async {
                Database::connect(&self.config.database.url)
                    .await
                    .map_err(ServerError::database_error)
            })
            .await
    }

    pub(crate) async fn ledger(&self) -> ServerResult<&dyn Ledger> {
        Ok(self.database().await? as &dyn Ledger)
    }

    pub(crate) async fn storage(&self) -> ServerResult<&Arc<dyn ObjectStore>> {
        self.storage
            .get_or_try_init(|| async {
                let rate_limiter = ratelimit::RateLimiter::new(self.config.storage.s3_rate_limit);
                let backend = S3Backend::new(self.config.storage.s3.clone(), rate_limiter).await?;
                let boxed: Arc<dyn ObjectStore> = Arc::new(backend);
                Ok(boxed)
            })
            .await
    }

    fn gc_params(&self) -> GcParams {
        self.config
            .garbage_collection
            .params(self.config.storage.s3_concurrency)
    }
}

fn load_signing_keys(config: &Config) -> Result<Vec<NixKeypair>> {
    config
        .signing
        .keys
        .iter()
        .map(|path| {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading signing key {}: {}", path.display(), e))?;
            NixKeypair::from_str(contents.trim())
                .map_err(|e| anyhow::anyhow!("parsing signing key {}: {}", path.display(), e))
        })
        .collect()
}

/// The fallback route for anything not matched by the API or read proxy.
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ServerError::NotFound)
}

/// Runs the API server (and, if configured, the unauthenticated read
/// proxy) until the process is terminated.
pub async fn run_api_server(cli_listen: Option<SocketAddr>, config: Config) -> Result<()> {
    eprintln!("Starting API server...");
    if let Some(public_url) = &config.read_proxy.public_url {
        eprintln!("Public cache URL: {public_url}");
    }

    let read_proxy_enabled = config.read_proxy.enabled;
    let state = StateInner::new(config).await?;

    let listen = cli_listen.unwrap_or(state.config.listen.address);

    let mut app = Router::new()
        .merge(api::get_router())
        .layer(axum::middleware::from_fn(require_bearer_token));

    if read_proxy_enabled {
        app = app.merge(read_proxy::get_router());
    }

    let app = app
        .fallback(fallback)
        .layer(axum::middleware::from_fn(restrict_host))
        .layer(Extension(state.clone()))
        .layer(Extension(state.storage().await?.clone()))
        .layer(CatchPanicLayer::new());

    eprintln!("Listening on {:?}...", listen);
    axum::Server::bind(&listen).serve(app.into_make_service()).await?;

    Ok(())
}

/// Runs garbage collection on the configured interval, forever.
pub async fn run_garbage_collection(config: Config) -> Result<()> {
    let state = StateInner::new(config).await?;
    let interval = state.config.garbage_collection.interval;
    let params = state.gc_params();

    let ledger: Arc<dyn Ledger> = Arc::new(state.database().await?.clone());
    gc::run_periodically(ledger, state.storage().await?.clone(), interval, params).await;

    Ok(())
}

/// Runs one garbage-collection pass and returns.
pub async fn run_garbage_collection_once(config: Config) -> Result<gc::GcStats> {
    let state = StateInner::new(config).await?;
    let params = state.gc_params();

    Ok(gc::run_once(state.ledger().await?, state.storage().await?.as_ref(), &params).await?)
}

/// Runs the database migrations then returns.
pub async fn run_migrations(config: Config) -> Result<()> {
    eprintln!("Running migrations...");

    let state = StateInner::new(config).await?;
    let db = state.database().await?;
    Migrator::up(db, None).await?;

    Ok(())
}
