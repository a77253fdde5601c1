// Full-composition recovery test: webhook arrives while the upstream is
// down, the prober walks DOWN → STARTING → READY once it comes back, and the
// spawned replay task drains the buffer off the prober's trigger alone.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::timeout;
use webhook_gateway::buffer::BufferStore;
use webhook_gateway::conversation::ConversationLog;
use webhook_gateway::forward::Forwarder;
use webhook_gateway::line_inbound::ProfileResolver;
use webhook_gateway::proxy_http::{build_router, Gateway};
use webhook_gateway::replay::{run_replay, ReplayEngine};
use webhook_gateway::upstream::{
    run_prober, ProberConfig, UpstreamMonitor, UpstreamPhase, UpstreamStateMachine,
};

/// Grab an ephemeral port that nothing is currently listening on.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe port");
    listener.local_addr().expect("local_addr").port()
}

/// Start a recording upstream on the port the gateway is already probing.
async fn start_upstream_on(port: u16) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let state = received.clone();
    let router = axum::Router::new()
        .fallback(
            |axum::extract::State(state): axum::extract::State<Arc<Mutex<Vec<Vec<u8>>>>>,
             request: axum::extract::Request| async move {
                // Probe GETs share this listener; only record deliveries.
                let is_probe = request.method() == axum::http::Method::GET;
                let body = axum::body::to_bytes(request.into_body(), usize::MAX)
                    .await
                    .expect("read stub body");
                if !is_probe {
                    state.lock().await.push(body.to_vec());
                }
                "{}"
            },
        )
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind upstream");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("upstream serve");
    });
    received
}

#[tokio::test]
async fn buffers_while_down_then_drains_on_recovery_without_manual_passes() {
    let upstream_port = free_port();
    let grace = Duration::from_millis(150);

    let buffer_dir = tempfile::tempdir().expect("buffer tempdir");
    let conversation_dir = tempfile::tempdir().expect("conversation tempdir");

    let machine = UpstreamStateMachine::with_start(
        Instant::now(),
        Duration::from_secs(30),
        grace,
    );
    let monitor = Arc::new(UpstreamMonitor::new(machine));
    let store = Arc::new(BufferStore::open(buffer_dir.path()).expect("open store"));
    let forwarder = Arc::new(
        Forwarder::new("127.0.0.1", upstream_port, Duration::from_secs(5))
            .expect("build forwarder"),
    );

    let trigger = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let monitor = monitor.clone();
        let trigger = trigger.clone();
        let rx = shutdown_rx.clone();
        let cfg = ProberConfig {
            probe_url: format!("http://127.0.0.1:{upstream_port}/"),
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(250),
            grace_period: grace,
        };
        tokio::spawn(async move {
            run_prober(monitor, reqwest::Client::new(), cfg, trigger, rx).await;
        });
    }
    {
        // A deliberately long timer: the drain below can only come from the
        // prober's READY trigger.
        let engine = ReplayEngine::new(store.clone(), forwarder.clone(), monitor.clone(), 20);
        let trigger = trigger.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            run_replay(engine, Duration::from_secs(60), trigger, rx).await;
        });
    }

    let gateway = Arc::new(Gateway {
        monitor: monitor.clone(),
        store: store.clone(),
        forwarder,
        conversation: Arc::new(
            ConversationLog::open(conversation_dir.path()).expect("open conversation log"),
        ),
        profiles: Arc::new(ProfileResolver::new(None).expect("build profile resolver")),
        started_at: Instant::now(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let gateway_addr: SocketAddr = listener.local_addr().expect("gateway local_addr");
    let router = build_router(gateway);
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("gateway serve");
    });

    // The webhook arrives while nothing listens upstream. The sender still
    // gets its ack, and the request lands in the buffer.
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{gateway_addr}/webhook"))
        .body("while-down")
        .send()
        .await
        .expect("send webhook");
    assert_eq!(response.status(), 200);

    timeout(Duration::from_secs(2), async {
        while store.count() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("webhook was never buffered");

    // Upstream comes back. Prober walks STARTING → READY, fires the trigger,
    // and the replay task empties the buffer with no manual pass calls.
    let received = start_upstream_on(upstream_port).await;
    timeout(Duration::from_secs(5), async {
        while store.count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("buffer never drained after recovery");

    assert_eq!(monitor.phase().await, UpstreamPhase::Ready);
    let received = received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], b"while-down");

    shutdown_tx.send(true).ok();
}
