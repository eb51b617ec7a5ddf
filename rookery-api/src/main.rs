use rookery_common::snowflake::{ProcessId, WorkerId};
use rookery_db::{DbClient, DbError};
use rookery_timeline::{Timeline, TimelineConfig, fanout::FanoutConfig, retry::RetryConfig};
use serde::Deserialize;
use server::ServerState;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod server;

#[derive(Debug, Error)]
enum InitError {
    #[error("Error parsing .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("Error parsing environment: {0}")]
    Envy(#[from] envy::Error),
    #[error("Error setting up the database: {0}")]
    Database(#[from] DbError),
    #[error("Error binding tcp listener: {0}")]
    TcpBind(std::io::Error),
    #[error("Error serving server: {0}")]
    TcpServe(std::io::Error),
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
struct Env {
    #[serde(default = "defaults::server_address")]
    server_address: IpAddr,
    #[serde(default = "defaults::server_port")]
    server_port: u16,
    database_url: String,
    #[serde(default = "defaults::max_connections")]
    max_connections: u32,
    #[serde(default)]
    worker_id: WorkerId,
    #[serde(default)]
    process_id: ProcessId,
    #[serde(default = "defaults::cache_capacity")]
    cache_capacity: NonZeroUsize,
    #[serde(default = "defaults::cache_max_owners")]
    cache_max_owners: u64,
    /// Zero disables the read timeout.
    #[serde(default = "defaults::read_timeout_ms")]
    read_timeout_ms: u64,
    #[serde(default = "defaults::fanout_ceiling")]
    fanout_ceiling: u64,
    #[serde(default = "defaults::fanout_concurrency")]
    fanout_concurrency: NonZeroUsize,
    #[serde(default = "defaults::fanout_max_retries")]
    fanout_max_retries: u32,
    #[serde(default = "defaults::fanout_initial_backoff_ms")]
    fanout_initial_backoff_ms: u64,
    #[serde(default = "defaults::fanout_max_backoff_ms")]
    fanout_max_backoff_ms: u64,
}

mod defaults {
    use std::{
        net::{IpAddr, Ipv4Addr},
        num::NonZeroUsize,
    };

    pub fn server_address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub fn server_port() -> u16 {
        8080
    }

    pub fn max_connections() -> u32 {
        10
    }

    pub fn cache_capacity() -> NonZeroUsize {
        NonZeroUsize::new(200).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn cache_max_owners() -> u64 {
        100_000
    }

    pub fn read_timeout_ms() -> u64 {
        2_000
    }

    pub fn fanout_ceiling() -> u64 {
        10_000
    }

    pub fn fanout_concurrency() -> NonZeroUsize {
        NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn fanout_max_retries() -> u32 {
        5
    }

    pub fn fanout_initial_backoff_ms() -> u64 {
        50
    }

    pub fn fanout_max_backoff_ms() -> u64 {
        5_000
    }
}

impl Env {
    fn timeline_config(&self) -> TimelineConfig {
        TimelineConfig {
            cache_capacity: self.cache_capacity,
            cache_max_owners: self.cache_max_owners,
            read_timeout: (self.read_timeout_ms > 0)
                .then(|| Duration::from_millis(self.read_timeout_ms)),
            fanout: FanoutConfig {
                ceiling: self.fanout_ceiling,
                concurrency: self.fanout_concurrency,
                retry: RetryConfig {
                    max_retries: self.fanout_max_retries,
                    initial_backoff: Duration::from_millis(self.fanout_initial_backoff_ms),
                    max_backoff: Duration::from_millis(self.fanout_max_backoff_ms),
                    jitter: true,
                },
            },
        }
    }
}

fn install_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rookery_api=debug,\
                rookery_timeline=debug,\
                rookery_db=debug,\
                tower_http=debug,axum::rejection=trace,sqlx=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn get_env() -> Result<Env, InitError> {
    if let Err(e) = dotenvy::dotenv() {
        if e.not_found() {
            debug!("No .dotenv file found");
        } else {
            return Err(e.into());
        }
    }

    envy::from_env().map_err(InitError::from)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), InitError> {
    install_tracing();
    let env = get_env()?;

    let db = DbClient::connect(
        &env.database_url,
        env.max_connections,
        env.worker_id,
        env.process_id,
    )
    .await?;
    db.migrate().await?;

    let timeline = Arc::new(Timeline::new(Arc::new(db), env.timeline_config()));
    let state = ServerState::new(Arc::clone(&timeline));

    let tracing_layer = TraceLayer::new_for_http();
    let app = server::routes().with_state(state).layer(tracing_layer);

    let server_address = SocketAddr::new(env.server_address, env.server_port);
    let listener = tokio::net::TcpListener::bind(server_address)
        .await
        .map_err(InitError::TcpBind)?;
    info!(%server_address, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(InitError::TcpServe)?;

    timeline.shutdown().await;
    info!("Outstanding fanouts finished");

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::Env;
    use std::time::Duration;

    fn env(vars: &[(&str, &str)]) -> Env {
        envy::from_iter(
            vars.iter()
                .map(|(key, value)| ((*key).to_owned(), (*value).to_owned())),
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_everything_but_the_database() {
        let env = env(&[("DATABASE_URL", "postgres://localhost/rookery")]);

        assert_eq!(env.server_port, 8080);
        assert_eq!(env.cache_capacity.get(), 200);
        assert_eq!(env.cache_max_owners, 100_000);

        let config = env.timeline_config();
        assert_eq!(config.read_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.fanout.ceiling, 10_000);
        assert_eq!(config.fanout.retry.max_retries, 5);
    }

    #[test]
    fn zero_read_timeout_disables_it() {
        let env = env(&[
            ("DATABASE_URL", "postgres://localhost/rookery"),
            ("READ_TIMEOUT_MS", "0"),
            ("FANOUT_CEILING", "3"),
        ]);

        let config = env.timeline_config();
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.fanout.ceiling, 3);
    }

    #[test]
    fn database_url_is_required() {
        assert!(envy::from_iter::<_, Env>(Vec::<(String, String)>::new()).is_err());
    }
}
