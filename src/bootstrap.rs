//! Wires the components together and runs them until a stop signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::clock::{Clock, SystemClock};
use crate::commands::{run_poller, CommandHandler};
use crate::config::AppConfig;
use crate::ingest::providers::PepperRssProvider;
use crate::ingest::scheduler::{Pipeline, Scheduler};
use crate::ingest::types::FeedSource;
use crate::metrics::Metrics;
use crate::notify::operator::{AlertKind, OperatorAlerts};
use crate::notify::{Dispatcher, Messenger, RateLimiter, TelegramMessenger};
use crate::shutdown::{self, ShutdownSignal};
use crate::store::{SqliteStore, StateStore};

/// Opens the store and commits whatever an interrupted run left reserved.
pub async fn open_store(cfg: &AppConfig, clock: &dyn Clock) -> Result<Arc<dyn StateStore>> {
    let store = SqliteStore::open(&cfg.data_dir)
        .await
        .with_context(|| format!("opening store in {}", cfg.data_dir.display()))?;
    let store: Arc<dyn StateStore> = Arc::new(store);

    let leftovers = store
        .reconcile_reserved(clock.now())
        .await
        .context("reconciling reserved seen ids")?;
    if !leftovers.is_empty() {
        warn!(
            target: "store",
            count = leftovers.len(),
            ids = ?leftovers,
            "deals reserved by an interrupted run were committed; they may not have reached every subscriber"
        );
    }
    Ok(store)
}

pub async fn run(cfg: AppConfig) -> Result<()> {
    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(error = %e, "metrics disabled");
            None
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&cfg, clock.as_ref()).await?;
    let seen_ids = store.seen_count().await.unwrap_or(0);

    let bot = TelegramMessenger::new(cfg.telegram_token.expose())
        .with_api_base(cfg.telegram_api_base.clone())
        .with_timeout(Duration::from_secs(cfg.send_timeout_secs));
    let messenger: Arc<dyn Messenger> = Arc::new(bot.clone());

    let mut sources: Vec<Arc<dyn FeedSource>> = Vec::with_capacity(cfg.feeds.len());
    for feed in &cfg.feeds {
        let provider =
            PepperRssProvider::from_url(feed.name.clone(), feed.url.clone(), cfg.fetch_timeout())
                .with_context(|| format!("building feed client for {}", feed.name))?;
        sources.push(Arc::new(provider));
    }
    let feed_names: Vec<String> = cfg.feeds.iter().map(|f| f.name.clone()).collect();

    let dispatcher = Dispatcher::new(
        Arc::clone(&messenger),
        Arc::clone(&store),
        Arc::new(RateLimiter::new(cfg.rate_limit_cfg())),
        Arc::clone(&clock),
        cfg.dispatch_cfg(),
    );
    let pipeline = Arc::new(
        Pipeline::new(sources, Arc::clone(&store), dispatcher, Arc::clone(&clock))
            .with_retention_days(cfg.seen_retention_days),
    );
    let alerts = Arc::new(OperatorAlerts::new(
        Arc::clone(&messenger),
        cfg.operator_chat(),
        Arc::clone(&clock),
        cfg.operator_alert_cooldown_secs,
    ));
    let scheduler = Scheduler::new(Arc::clone(&pipeline), cfg.fetch_interval())
        .with_alerts(Arc::clone(&alerts));

    let (trigger, signal) = shutdown::channel();
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    if let Some(bind) = &cfg.http_bind {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("binding HTTP surface to {bind}"))?;
        let app = api::router(AppState {
            feeds: feed_names.clone(),
            status: pipeline.status(),
            store: Arc::clone(&store),
            metrics,
        });
        info!(%bind, "HTTP status surface listening");
        let mut stop = signal.clone();
        tasks.push((
            "http",
            tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { stop.triggered().await })
                    .await;
                if let Err(e) = served {
                    error!(error = %e, "HTTP server failed");
                }
            }),
        ));
    }

    if cfg.commands_enabled {
        let handler = CommandHandler::new(
            Arc::clone(&store),
            Arc::clone(&messenger),
            Arc::clone(&clock),
        );
        tasks.push((
            "commands",
            tokio::spawn(run_poller(bot, handler, cfg.command_poll_secs, signal.clone())),
        ));
    }

    info!(
        feeds = %feed_names.join(","),
        interval_secs = cfg.fetch_interval_secs,
        seen_ids,
        "deal notifier started"
    );
    if alerts.enabled() {
        alerts
            .alert(AlertKind::Startup, &format!("started, polling {}", feed_names.join(", ")))
            .await;
    }

    let scheduler_task = tokio::spawn(scheduler.run(signal.clone()));
    wait_for_stop(signal).await;
    info!("shutdown requested, finishing in-flight cycle");
    trigger.trigger();

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "scheduler task failed");
    }
    for (name, task) in tasks {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "task failed");
        }
    }
    info!("deal notifier stopped");
    Ok(())
}

/// Resolves on SIGINT, SIGTERM (unix) or an already requested stop.
async fn wait_for_stop(mut signal: ShutdownSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = signal.triggered() => {},
    }
}
