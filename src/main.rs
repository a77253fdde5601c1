// webhook-gateway: acknowledges platform webhooks, proxies or buffers them
// for a restart-prone upstream, and mirrors traffic into conversation logs.
//
// Runtime event loop: wires together buffer store, forwarder, readiness
// prober, replay engine, session tail watcher, and the webhook HTTP server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{error, info};
use webhook_gateway::buffer::BufferStore;
use webhook_gateway::conversation::ConversationLog;
use webhook_gateway::forward::Forwarder;
use webhook_gateway::line_inbound::ProfileResolver;
use webhook_gateway::proxy_http::{build_router, Gateway};
use webhook_gateway::replay::{run_replay, ReplayEngine};
use webhook_gateway::tail::{run_tail_watcher, SessionTailWatcher};
use webhook_gateway::upstream::{run_prober, ProberConfig, UpstreamMonitor, UpstreamStateMachine};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    // Parse optional --config <path> argument.
    // Defaults to /etc/webhook-gateway/gateway.toml when not supplied.
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(p) => Some(std::path::PathBuf::from(p)),
            None => {
                eprintln!("FATAL: --config requires a path argument");
                std::process::exit(1);
            }
        },
        None => None,
    };

    // An explicitly named config must load; the default path may simply not
    // exist, in which case the built-in defaults apply.
    let cfg = match config_path {
        Some(path) => match webhook_gateway::config::load_config_from_path(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => match webhook_gateway::config::load_config() {
            Ok(cfg) => cfg,
            Err(webhook_gateway::config::ConfigError::Io(_)) => {
                info!("no config file found, using defaults");
                webhook_gateway::config::default_config()
            }
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        },
    };
    info!(
        bind = %cfg.proxy.bind,
        upstream_host = %cfg.upstream.host,
        upstream_port = cfg.upstream.port,
        buffer_dir = %cfg.buffer.dir,
        "config loaded"
    );

    // Open the durable pieces before accepting any traffic.
    let store = match BufferStore::open(std::path::Path::new(&cfg.buffer.dir)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("FATAL: failed to open buffer directory: {}", e);
            std::process::exit(1);
        }
    };
    let conversation = match ConversationLog::open(&cfg.conversations.dir) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            eprintln!("FATAL: failed to open conversation directory: {}", e);
            std::process::exit(1);
        }
    };

    let forwarder = match Forwarder::new(
        &cfg.upstream.host,
        cfg.upstream.port,
        Duration::from_millis(cfg.upstream.forward_timeout_ms),
    ) {
        Ok(forwarder) => Arc::new(forwarder),
        Err(e) => {
            eprintln!("FATAL: failed to build upstream client: {}", e);
            std::process::exit(1);
        }
    };
    let monitor = Arc::new(UpstreamMonitor::new(UpstreamStateMachine::new(
        Duration::from_millis(cfg.upstream.fresh_threshold_ms),
        Duration::from_millis(cfg.upstream.grace_period_ms),
    )));
    let profiles = match ProfileResolver::new(cfg.profile_token.clone()) {
        Ok(profiles) => Arc::new(profiles),
        Err(e) => {
            eprintln!("FATAL: failed to build profile client: {}", e);
            std::process::exit(1);
        }
    };

    // Set up shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let replay_trigger = Arc::new(Notify::new());

    // Spawn readiness prober
    {
        let monitor = monitor.clone();
        let trigger = replay_trigger.clone();
        let rx = shutdown_rx.clone();
        let prober_cfg = ProberConfig {
            probe_url: format!("http://{}:{}/", cfg.upstream.host, cfg.upstream.port),
            interval: Duration::from_millis(cfg.upstream.probe_interval_ms),
            timeout: Duration::from_millis(cfg.upstream.probe_timeout_ms),
            grace_period: Duration::from_millis(cfg.upstream.grace_period_ms),
        };
        let client = reqwest::Client::new();
        tokio::spawn(async move {
            run_prober(monitor, client, prober_cfg, trigger, rx).await;
        });
    }

    // Spawn replay engine
    {
        let engine = ReplayEngine::new(
            store.clone(),
            forwarder.clone(),
            monitor.clone(),
            cfg.buffer.max_replay_attempts,
        );
        let trigger = replay_trigger.clone();
        let rx = shutdown_rx.clone();
        let interval = Duration::from_millis(cfg.buffer.replay_interval_ms);
        tokio::spawn(async move {
            run_replay(engine, interval, trigger, rx).await;
        });
    }

    // Spawn session tail watcher, seeded with the last logged outbound
    // timestamps so a restart does not re-emit history.
    {
        let mut last_outbound = HashMap::new();
        for platform in ["line", "discord"] {
            if let Some(ts) = conversation.last_outbound_timestamp(platform) {
                info!(platform, last_outbound = %ts, "recovered outbound position");
                last_outbound.insert(platform.to_owned(), ts);
            }
        }
        let watcher = SessionTailWatcher::new(
            cfg.sessions.clone(),
            cfg.conversations.agent_name.clone(),
            conversation.clone(),
            last_outbound,
        );
        let interval = Duration::from_millis(cfg.sessions.poll_interval_ms);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            run_tail_watcher(watcher, interval, rx).await;
        });
    }

    // Webhook HTTP server
    let gateway = Arc::new(Gateway {
        monitor,
        store,
        forwarder,
        conversation,
        profiles,
        started_at: Instant::now(),
    });
    let listener = match tokio::net::TcpListener::bind(&cfg.proxy.bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {}", cfg.proxy.bind, e);
            std::process::exit(1);
        }
    };
    info!(addr = %cfg.proxy.bind, "webhook server listening");
    {
        let router = build_router(gateway);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                // Channel closure only happens at process exit; treat it as stop.
                let _ = rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "webhook server failed");
            }
        });
    }

    info!("gateway initialized — all workers running");

    // Wait for Ctrl-C or SIGTERM
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                shutdown_tx.send(true).ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }

    // Signal all tasks to stop
    shutdown_tx.send(true).ok();

    // Brief delay to allow tasks to observe shutdown and flush
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("gateway shutdown complete");
}
