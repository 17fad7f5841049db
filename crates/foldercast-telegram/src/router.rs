//! Bot wiring: builds the registry and its dependencies, starts the
//! connection watchdog and runs the teloxide dispatcher until it exits.

use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tracing::info;

use foldercast_core::{
    config::Config,
    metrics::{InProcessMetrics, MetricsSink},
    registry::SessionRegistry,
    remote::RemoteConnector,
    store::FileSessionStore,
    watchdog::ConnectionWatchdog,
};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
}

/// Runs the bot against the given remote connector until the dispatcher
/// stops, then tears the orchestrator down.
pub async fn run_polling(cfg: Arc<Config>, connector: Arc<dyn RemoteConnector>) -> anyhow::Result<()> {
    foldercast_core::logging::init("foldercast");

    let bot = Bot::new(cfg.telegram_bot_token.clone());

    let store = Arc::new(FileSessionStore::new(
        cfg.user_data_dir(),
        cfg.session_encryption_key.as_deref(),
    ));
    let metrics: Arc<dyn MetricsSink> = Arc::new(InProcessMetrics::new());
    let registry = Arc::new(SessionRegistry::new(
        Arc::clone(&cfg),
        connector,
        store,
        metrics,
    ));

    if let Ok(me) = bot.get_me().await {
        info!(username = %me.username(), "bot started");
    }

    let watchdog = ConnectionWatchdog::start(Arc::clone(&registry), cfg.watchdog_interval);

    let state = Arc::new(AppState {
        cfg,
        registry: Arc::clone(&registry),
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    watchdog.stop().await;
    registry.shutdown().await;
    Ok(())
}
