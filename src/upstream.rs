//! Upstream availability tracking.
//!
//! A four-phase state machine (`UNKNOWN → STARTING → READY`, any of them
//! `→ DOWN` on probe failure) owned by the health prober. A bare port-open
//! probe is not trusted on its own: the upstream process accepts connections
//! before its internal runtime has finished booting, so a first successful
//! probe only moves the phase to `STARTING`, and `READY` is reached after a
//! configured grace period of continued success.
//!
//! One exception: if the gateway itself has already been running longer than
//! the fresh threshold when the upstream first responds, the upstream was
//! warm the whole time and the grace period is skipped.
//!
//! Transitions are pure functions of `(phase, now)` so they can be unit
//! tested without any I/O; the prober task applies them and signals the
//! replay engine when the phase reaches `READY`.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::sleep;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Availability phase of the fixed upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamPhase {
    Unknown,
    Down,
    Starting,
    Ready,
}

impl UpstreamPhase {
    /// Wire name used in `/health` responses and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamPhase::Unknown => "UNKNOWN",
            UpstreamPhase::Down => "DOWN",
            UpstreamPhase::Starting => "STARTING",
            UpstreamPhase::Ready => "READY",
        }
    }
}

// ---------------------------------------------------------------------------
// Transition effects
// ---------------------------------------------------------------------------

/// Observable outcome of applying one probe result to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEffect {
    /// Phase unchanged (includes repeat failures while already `DOWN`).
    None,
    /// First response seen; grace period countdown started.
    BecameStarting,
    /// Upstream is now trusted; the replay engine should run.
    BecameReady {
        /// True when the fresh-threshold shortcut skipped the grace period.
        skipped_grace: bool,
    },
    /// Probe failed from a non-`DOWN` phase.
    WentDown { was: UpstreamPhase },
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// The upstream availability state machine.
///
/// `started_at` is the gateway's own start instant, used for the
/// fresh-threshold shortcut out of `UNKNOWN`.
#[derive(Debug)]
pub struct UpstreamStateMachine {
    phase: UpstreamPhase,
    first_respond_at: Option<Instant>,
    started_at: Instant,
    fresh_threshold: Duration,
    grace_period: Duration,
}

impl UpstreamStateMachine {
    pub fn new(fresh_threshold: Duration, grace_period: Duration) -> Self {
        Self::with_start(Instant::now(), fresh_threshold, grace_period)
    }

    /// Construct with an explicit gateway start instant (for tests).
    pub fn with_start(
        started_at: Instant,
        fresh_threshold: Duration,
        grace_period: Duration,
    ) -> Self {
        UpstreamStateMachine {
            phase: UpstreamPhase::Unknown,
            first_respond_at: None,
            started_at,
            fresh_threshold,
            grace_period,
        }
    }

    pub fn phase(&self) -> UpstreamPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == UpstreamPhase::Ready
    }

    /// Apply a successful probe observed at `now`.
    pub fn on_probe_success(&mut self, now: Instant) -> ProbeEffect {
        match self.phase {
            UpstreamPhase::Unknown => {
                if now.duration_since(self.started_at) > self.fresh_threshold {
                    // The gateway has been watching long enough that the
                    // upstream must have been up before we started probing.
                    self.phase = UpstreamPhase::Ready;
                    ProbeEffect::BecameReady {
                        skipped_grace: true,
                    }
                } else {
                    self.phase = UpstreamPhase::Starting;
                    self.first_respond_at = Some(now);
                    ProbeEffect::BecameStarting
                }
            }
            UpstreamPhase::Down => {
                self.phase = UpstreamPhase::Starting;
                self.first_respond_at = Some(now);
                ProbeEffect::BecameStarting
            }
            UpstreamPhase::Starting => {
                let elapsed = self
                    .first_respond_at
                    .map_or(Duration::ZERO, |t| now.duration_since(t));
                if elapsed >= self.grace_period {
                    self.phase = UpstreamPhase::Ready;
                    ProbeEffect::BecameReady {
                        skipped_grace: false,
                    }
                } else {
                    ProbeEffect::None
                }
            }
            UpstreamPhase::Ready => ProbeEffect::None,
        }
    }

    /// Apply a failed or timed-out probe.
    pub fn on_probe_failure(&mut self) -> ProbeEffect {
        match self.phase {
            UpstreamPhase::Down => ProbeEffect::None,
            was => {
                self.phase = UpstreamPhase::Down;
                self.first_respond_at = None;
                ProbeEffect::WentDown { was }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared monitor handle
// ---------------------------------------------------------------------------

/// Shared, synchronized view of the state machine.
///
/// The prober is the only writer; the handler, replay engine, and `/health`
/// endpoint read the phase through this handle.
pub struct UpstreamMonitor {
    machine: Mutex<UpstreamStateMachine>,
}

impl UpstreamMonitor {
    pub fn new(machine: UpstreamStateMachine) -> Self {
        UpstreamMonitor {
            machine: Mutex::new(machine),
        }
    }

    pub async fn phase(&self) -> UpstreamPhase {
        self.machine.lock().await.phase()
    }

    pub async fn is_ready(&self) -> bool {
        self.machine.lock().await.is_ready()
    }

    pub async fn observe_success(&self, now: Instant) -> ProbeEffect {
        self.machine.lock().await.on_probe_success(now)
    }

    pub async fn observe_failure(&self) -> ProbeEffect {
        self.machine.lock().await.on_probe_failure()
    }
}

// ---------------------------------------------------------------------------
// Prober task
// ---------------------------------------------------------------------------

/// Configuration for the probe loop.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Probe target, e.g. `http://agent:18789/`.
    pub probe_url: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub grace_period: Duration,
}

/// Periodically probe the upstream and drive the state machine.
///
/// Any HTTP response counts as success — only transport errors and timeouts
/// are failures (the probe checks that the port answers, the grace period
/// covers the rest). Signals `replay_trigger` whenever the phase reaches
/// `READY`.
pub async fn run_prober(
    monitor: Arc<UpstreamMonitor>,
    client: reqwest::Client,
    cfg: ProberConfig,
    replay_trigger: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            info!("prober task stopping (shutdown)");
            return;
        }

        let probe = client.get(&cfg.probe_url).timeout(cfg.timeout).send().await;
        let effect = match probe {
            Ok(_response) => monitor.observe_success(Instant::now()).await,
            Err(_) => monitor.observe_failure().await,
        };

        match effect {
            ProbeEffect::BecameStarting => {
                info!(
                    grace_ms = cfg.grace_period.as_millis() as u64,
                    "upstream responded, entering STARTING"
                );
            }
            ProbeEffect::BecameReady { skipped_grace } => {
                if skipped_grace {
                    info!("upstream detected as already running, READY");
                } else {
                    info!("grace period elapsed, READY");
                }
                replay_trigger.notify_one();
            }
            ProbeEffect::WentDown { was } => {
                // A first failure out of UNKNOWN is the expected cold-start
                // case; only log established-upstream losses.
                if was != UpstreamPhase::Unknown {
                    warn!(was = was.as_str(), "upstream probe failed, DOWN");
                }
            }
            ProbeEffect::None => {}
        }

        tokio::select! {
            () = sleep(cfg.interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("prober task stopping (shutdown)");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRESH: Duration = Duration::from_secs(30);
    const GRACE: Duration = Duration::from_secs(60);

    fn machine_started_at(started_at: Instant) -> UpstreamStateMachine {
        UpstreamStateMachine::with_start(started_at, FRESH, GRACE)
    }

    #[test]
    fn success_while_unknown_with_fresh_gateway_enters_starting() {
        let start = Instant::now();
        let mut m = machine_started_at(start);
        let effect = m.on_probe_success(start + Duration::from_secs(5));
        assert_eq!(effect, ProbeEffect::BecameStarting);
        assert_eq!(m.phase(), UpstreamPhase::Starting);
    }

    #[test]
    fn success_while_unknown_after_fresh_threshold_jumps_to_ready() {
        let start = Instant::now();
        let mut m = machine_started_at(start);
        let effect = m.on_probe_success(start + FRESH + Duration::from_secs(1));
        assert_eq!(
            effect,
            ProbeEffect::BecameReady {
                skipped_grace: true
            }
        );
        assert_eq!(m.phase(), UpstreamPhase::Ready);
    }

    #[test]
    fn starting_holds_until_grace_period_elapses() {
        let start = Instant::now();
        let mut m = machine_started_at(start);
        let first = start + Duration::from_secs(5);
        m.on_probe_success(first);

        // Just short of the grace period: still STARTING.
        assert_eq!(
            m.on_probe_success(first + GRACE - Duration::from_secs(1)),
            ProbeEffect::None
        );
        assert_eq!(m.phase(), UpstreamPhase::Starting);

        // At the grace boundary: READY.
        assert_eq!(
            m.on_probe_success(first + GRACE),
            ProbeEffect::BecameReady {
                skipped_grace: false
            }
        );
        assert_eq!(m.phase(), UpstreamPhase::Ready);
    }

    #[test]
    fn success_while_down_restarts_the_grace_countdown() {
        let start = Instant::now();
        let mut m = machine_started_at(start);
        m.on_probe_success(start + Duration::from_secs(1));
        m.on_probe_failure();
        assert_eq!(m.phase(), UpstreamPhase::Down);

        let resumed = start + Duration::from_secs(90);
        assert_eq!(m.on_probe_success(resumed), ProbeEffect::BecameStarting);
        // Old first_respond_at was cleared: grace counts from `resumed`.
        assert_eq!(
            m.on_probe_success(resumed + Duration::from_secs(1)),
            ProbeEffect::None
        );
    }

    #[test]
    fn failure_from_any_non_down_phase_goes_down() {
        let start = Instant::now();

        let mut m = machine_started_at(start);
        assert_eq!(
            m.on_probe_failure(),
            ProbeEffect::WentDown {
                was: UpstreamPhase::Unknown
            }
        );

        let mut m = machine_started_at(start);
        m.on_probe_success(start + Duration::from_secs(1));
        assert_eq!(
            m.on_probe_failure(),
            ProbeEffect::WentDown {
                was: UpstreamPhase::Starting
            }
        );

        let mut m = machine_started_at(start);
        m.on_probe_success(start + FRESH + Duration::from_secs(1));
        assert_eq!(
            m.on_probe_failure(),
            ProbeEffect::WentDown {
                was: UpstreamPhase::Ready
            }
        );
    }

    #[test]
    fn repeat_failures_while_down_are_silent() {
        let start = Instant::now();
        let mut m = machine_started_at(start);
        m.on_probe_failure();
        assert_eq!(m.on_probe_failure(), ProbeEffect::None);
        assert_eq!(m.phase(), UpstreamPhase::Down);
    }

    #[test]
    fn success_while_ready_is_a_no_op() {
        let start = Instant::now();
        let mut m = machine_started_at(start);
        m.on_probe_success(start + FRESH + Duration::from_secs(1));
        assert_eq!(
            m.on_probe_success(start + FRESH + Duration::from_secs(2)),
            ProbeEffect::None
        );
        assert_eq!(m.phase(), UpstreamPhase::Ready);
    }
}
