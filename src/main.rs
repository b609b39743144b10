use std::sync::Arc;

use chatfeed::{AppState, chat::ChatHub, config::Config, db, store::SqliteStore};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    init_tracing(config.log_json);

    let db_pool = db::connect(&config.database_url, config.db_max_connections).await?;
    let store = SqliteStore::new(db_pool);
    let hub = Arc::new(ChatHub::with_sqlite(store.clone(), config.limits));

    let app = chatfeed::app(AppState { store, hub: hub.clone() });

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!(address = %listener.local_addr()?, "chatfeed v{} listening", env!("CARGO_PKG_VERSION"));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chatfeed=info,tower_http=info"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }
}

async fn shutdown_signal(hub: Arc<ChatHub>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    hub.shutdown();
}
