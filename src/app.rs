use crate::cache::MetricsCache;
use crate::cli::Command;
use crate::config::Config;
use crate::data::Aggregates;
use crate::data::catalog::PgViewCatalog;
use crate::data::health::ping;
use crate::fallback::FallbackQuerier;
use crate::invalidation::{InvalidationBridge, PgNotificationConnector, spawn_cache_invalidator};
use crate::service::MetricsService;
use crate::utils::fmt_duration;
use anyhow::Context;
use serde::Serialize;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main application struct containing all necessary components
pub struct App {
    config: Config,
    db_pool: sqlx::PgPool,
    service: MetricsService,
}

impl App {
    /// Create a new App instance with the pool, cache, and accessors wired together
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let slow_threshold = Duration::from_millis(500);

        // Every pooled connection, including the LISTEN connection, carries the statement timeout
        let connect_options = PgConnectOptions::from_str(&config.database_url)
            .context("Failed to parse database URL")?
            .options([(
                "statement_timeout",
                config.statement_timeout.as_millis().to_string(),
            )])
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(config.db_max_connections)
            .acquire_slow_threshold(slow_threshold)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect_with(connect_options)
            .await
            .context("Failed to create database pool")?;

        info!(
            min_connections = 0,
            max_connections = config.db_max_connections,
            acquire_timeout = "4s",
            idle_timeout = "2m",
            max_lifetime = "30m",
            statement_timeout = fmt_duration(config.statement_timeout),
            acquire_slow_threshold = fmt_duration(slow_threshold),
            "database pool established"
        );

        let catalog = Arc::new(PgViewCatalog::new(db_pool.clone()));
        let aggregates = Aggregates::new(db_pool.clone(), FallbackQuerier::new(catalog));
        let cache = MetricsCache::new(config.cache_config());
        let cache_options = cache.config().default_options;
        info!(
            ttl = fmt_duration(cache_options.ttl),
            stale_time = fmt_duration(cache_options.stale_time),
            fallback_timeout = fmt_duration(config.fallback_timeout),
            "metrics cache configured"
        );
        let service = MetricsService::new(cache, aggregates, config.fallback_options());

        Ok(App {
            config,
            db_pool,
            service,
        })
    }

    /// Run the selected command to completion
    pub async fn run(self, command: Command) -> ExitCode {
        let code = match command {
            Command::Listen => return self.listen().await,
            Command::Health => self.report_health().await,
            Command::Velocity { user_id } => {
                print_json(self.service.student_velocity(&user_id, None).await)
            }
            Command::Funnel { assignment_id } => {
                print_json(self.service.assignment_funnel(&assignment_id, None).await)
            }
            Command::Rollups {
                school_id,
                start,
                end,
            } => print_json(
                self.service
                    .daily_activity_rollups(&school_id, start, end, None)
                    .await,
            ),
        };
        self.service.cache().dispose();
        self.db_pool.close().await;
        code
    }

    async fn report_health(&self) -> ExitCode {
        if let Err(e) = ping(&self.db_pool).await {
            error!(error = ?e, "database ping failed");
            return ExitCode::FAILURE;
        }
        let health = self.service.matviews_health().await;
        let healthy = health.healthy;
        let code = print_json(Ok::<_, crate::error::Error>(health));
        if !healthy {
            warn!("one or more materialized views are unhealthy");
            return ExitCode::FAILURE;
        }
        code
    }

    /// Keep the cache in sync with view refreshes until a shutdown signal arrives
    async fn listen(self) -> ExitCode {
        let cache = self.service.cache().clone();
        let bridge = Arc::new(InvalidationBridge::new(
            Arc::new(PgNotificationConnector::new(self.db_pool.clone())),
            self.config.bridge_config(),
        ));

        let invalidator = spawn_cache_invalidator(
            cache.clone(),
            bridge.subscribe(),
            self.config.aggregate_prefix.clone(),
        );
        let bridge_handle = bridge.clone().start();

        let health_cancel = CancellationToken::new();
        let health_handle = tokio::spawn(report_periodically(
            self.service.clone(),
            self.config.health_check_interval,
            health_cancel.clone(),
        ));

        info!(
            channel = %self.config.notify_channel,
            health_check_interval = fmt_duration(self.config.health_check_interval),
            "metrics cache listening"
        );

        let signal = wait_for_shutdown_signal().await;
        info!(signal, "shutdown signal received, stopping");

        bridge.shutdown();
        health_cancel.cancel();

        let shutdown_timeout = self.config.shutdown_timeout;
        let graceful = tokio::time::timeout(shutdown_timeout, async {
            let _ = bridge_handle.await;
            let _ = health_handle.await;
        })
        .await;

        // Dropping the bridge closes the broadcast channel, which ends the invalidator
        drop(bridge);
        cache.dispose();
        invalidator.abort();
        self.db_pool.close().await;

        match graceful {
            Ok(()) => {
                info!("graceful shutdown complete");
                ExitCode::SUCCESS
            }
            Err(_) => {
                warn!(
                    timeout = fmt_duration(shutdown_timeout),
                    "graceful shutdown timed out"
                );
                ExitCode::FAILURE
            }
        }
    }
}

/// Log view health and cache statistics every `interval`
async fn report_periodically(service: MetricsService, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let health = service.matviews_health().await;
        let unhealthy: Vec<&str> = health
            .views
            .iter()
            .filter(|v| !v.is_healthy())
            .map(|v| v.name.as_str())
            .collect();
        if unhealthy.is_empty() {
            info!(views = health.views.len(), "materialized views healthy");
        } else {
            warn!(?unhealthy, "materialized views unhealthy");
        }

        let stats = service.cache().stats();
        info!(
            size = stats.size,
            pending_refreshes = stats.pending_refreshes,
            hits = stats.total_hits,
            misses = stats.total_misses,
            stale_hits = stats.total_stale_hits,
            hit_rate = stats.hit_rate,
            "cache statistics"
        );

        for (resource, usage) in service.aggregates().fallback().all_usage() {
            if usage.fallback > 0 || usage.failed > 0 {
                warn!(
                    resource = %resource,
                    primary = usage.primary,
                    fallback = usage.fallback,
                    failed = usage.failed,
                    "view reads are falling back"
                );
            }
        }
    }
}

fn print_json<T: Serialize>(result: crate::error::Result<T>) -> ExitCode {
    let value = match result {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "query failed");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&value) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "failed to serialize output");
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = ?e, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
