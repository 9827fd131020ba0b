#![forbid(unsafe_code)]
#![warn(clippy::default_trait_access)]

mod auth;
mod server;
mod ws_transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use service::{
    AcceptAllAuthenticator, Authenticator, BrokerConfig, BrokerEvent, BrokerState, Interceptor,
    InterceptorBus, MemoryMessageStore, MemorySessionStore, PermitAllAuthorizator,
};
use structopt::StructOpt;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use auth::FilePasswordAuthenticator;

const DEFAULT_CONFIG_FILENAME: &str = ".velourd.conf";

#[derive(StructOpt)]
struct Options {
    /// Path of the config file
    pub config: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .init();
}

/// Mirrors broker lifecycle events into the log.
struct LoggingInterceptor;

#[async_trait::async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle_event(&self, event: BrokerEvent) -> Result<()> {
        match event {
            BrokerEvent::ClientConnected {
                client_id,
                clean_session,
            } => tracing::info!(client_id = %client_id, clean_session = clean_session, "client connected"),
            BrokerEvent::ClientDisconnected { client_id } => {
                tracing::info!(client_id = %client_id, "client disconnected")
            }
            BrokerEvent::ConnectionLost { client_id } => {
                tracing::info!(client_id = %client_id, "connection lost")
            }
            BrokerEvent::MessagePublished { msg } => {
                tracing::debug!(topic = %msg.topic(), "message published")
            }
            BrokerEvent::TopicSubscribed {
                client_id, filter, ..
            } => tracing::info!(client_id = %client_id, filter = %filter, "subscribed"),
            BrokerEvent::TopicUnsubscribed { client_id, filter } => {
                tracing::info!(client_id = %client_id, filter = %filter, "unsubscribed")
            }
            BrokerEvent::MessageAcknowledged {
                client_id,
                packet_id,
            } => tracing::debug!(client_id = %client_id, packet_id = packet_id.get(), "acknowledged"),
        }
        Ok(())
    }
}

async fn run() -> Result<()> {
    let options: Options = Options::from_args();

    let config_filename = match options.config {
        Some(config_filename) => Some(PathBuf::from(config_filename)),
        None => dirs::home_dir()
            .map(|home_dir| home_dir.join(DEFAULT_CONFIG_FILENAME))
            .filter(|path| path.exists()),
    };

    let config = if let Some(config_filename) = config_filename {
        tracing::info!(filename = %config_filename.display(), "load config file");

        BrokerConfig::parse(
            &std::fs::read_to_string(&config_filename)
                .with_context(|| format!("load config file '{}'.", config_filename.display()))?,
        )
    } else {
        tracing::info!("use the default config");
        BrokerConfig::default()
    };

    let authenticator: Box<dyn Authenticator> = match &config.password_file {
        Some(password_file) => {
            tracing::info!(filename = %password_file, "load password file");
            Box::new(FilePasswordAuthenticator::load(password_file)?)
        }
        None => Box::new(AcceptAllAuthenticator),
    };

    let state = BrokerState::new(
        config,
        Box::new(MemorySessionStore::default()),
        Box::new(MemoryMessageStore::default()),
        authenticator,
        Box::new(PermitAllAuthorizator),
        InterceptorBus::new(vec![Arc::new(LoggingInterceptor)]),
    );

    tokio::spawn({
        let state = state.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                tracing::debug!(metrics = ?state.metrics_snapshot(), "broker metrics");
            }
        }
    });

    server::run(state).await
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        tracing::error!(
            error = %err,
            "failed to start server",
        );
    }
}
