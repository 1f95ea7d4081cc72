//! Top-level scheduling loop tying the run dispatcher to its triggers
//! (SPEC_FULL.md §4.1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::config::watcher::ConfigEvent;
use crate::config::ConfigSurface;
use crate::dispatcher::RunDispatcher;
use crate::error::{PatrolError, PatrolResult};
use crate::findings::FindingsStore;
use crate::types::{AlertInfo, Scope};

/// Delay before the first `startup`-reason run, unless a recent completed
/// run already exists (SPEC_FULL.md §4.1).
const INITIAL_PATROL_START_DELAY: Duration = Duration::from_secs(30);
/// A prior completed run within this window skips the startup run.
const RECENT_RUN_SKIP_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Budget given to the investigation orchestrator and tracked tasks to drain on `Stop`.
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(15);
/// Interval between stuck-run reaper checks.
const STUCK_RUN_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of engine state for `GetStatus`.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub running: bool,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

struct EngineState {
    running: bool,
    next_scheduled_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
}

pub struct PatrolEngine {
    dispatcher: Arc<RunDispatcher>,
    findings: Arc<FindingsStore>,
    config: ConfigSurface,
    clock: SharedClock,
    state: Mutex<EngineState>,
    started: AtomicBool,
    cancel: CancellationToken,
    alert_tx: mpsc::Sender<AlertInfo>,
    alert_rx: Mutex<Option<mpsc::Receiver<AlertInfo>>>,
    config_rx: Mutex<Option<mpsc::Receiver<ConfigEvent>>>,
}

impl PatrolEngine {
    #[must_use]
    pub fn new(
        dispatcher: Arc<RunDispatcher>,
        findings: Arc<FindingsStore>,
        config: ConfigSurface,
        clock: SharedClock,
        config_rx: Option<mpsc::Receiver<ConfigEvent>>,
    ) -> Self {
        let (alert_tx, alert_rx) = mpsc::channel(64);
        Self {
            dispatcher,
            findings,
            config,
            clock,
            state: Mutex::new(EngineState {
                running: false,
                next_scheduled_at: None,
                last_run_at: None,
            }),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            alert_tx,
            alert_rx: Mutex::new(Some(alert_rx)),
            config_rx: Mutex::new(config_rx),
        }
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start the background scheduling loop. Fails with `EngineNotConfigured`
    /// if the interval is zero (SPEC_FULL.md §4.1).
    pub fn start(self: &Arc<Self>) -> PatrolResult<()> {
        if self.config.load().interval.is_zero() {
            return Err(PatrolError::EngineNotConfigured("scheduling interval is unset".into()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state_lock().running = true;

        let engine = Arc::clone(self);
        let mut alert_rx = self.alert_rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        let mut config_rx = self.config_rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();

        tokio::spawn(async move {
            let in_process_recent_run = engine
                .state_lock()
                .last_run_at
                .is_some_and(|t| engine.clock.now() - t < chrono::Duration::from_std(RECENT_RUN_SKIP_WINDOW).unwrap_or_default());
            let persisted_recent_run = engine
                .dispatcher
                .last_completed_run_at()
                .await
                .is_some_and(|t| engine.clock.now() - t < chrono::Duration::from_std(RECENT_RUN_SKIP_WINDOW).unwrap_or_default());
            let recent_run = in_process_recent_run || persisted_recent_run;

            if !recent_run {
                tokio::select! {
                    () = tokio::time::sleep(INITIAL_PATROL_START_DELAY) => {
                        engine.run_startup().await;
                    }
                    () = engine.cancel.cancelled() => return,
                }
            }

            let mut interval = tokio::time::interval(engine.config.load().interval);
            interval.tick().await; // first tick fires immediately; already handled startup above

            loop {
                engine.state_lock().next_scheduled_at = Some(engine.clock.now() + chrono::Duration::from_std(engine.config.load().interval).unwrap_or_default());

                tokio::select! {
                    _ = interval.tick() => {
                        engine.dispatcher.reap_stuck_run();
                        engine.dispatcher.run_full("scheduled").await;
                        engine.state_lock().last_run_at = Some(engine.clock.now());
                    }
                    Some(alert) = recv_opt(&mut alert_rx) => {
                        if engine.config.load().event_triggers_enabled {
                            let scope = Scope::for_resource(alert.resource_id.clone());
                            engine.dispatcher.run_scoped("alert_trigger", scope).await;
                        }
                    }
                    Some(event) = recv_opt(&mut config_rx) => {
                        if let ConfigEvent::Reloaded(change) = event {
                            if change.interval_changed {
                                interval = tokio::time::interval(change.new_interval);
                                interval.tick().await;
                            }
                        }
                    }
                    () = tokio::time::sleep(STUCK_RUN_REAP_INTERVAL) => {
                        engine.dispatcher.reap_stuck_run();
                    }
                    () = engine.cancel.cancelled() => break,
                }
            }
        });

        Ok(())
    }

    async fn run_startup(self: &Arc<Self>) {
        self.dispatcher.run_full("startup").await;
        self.state_lock().last_run_at = Some(self.clock.now());
    }

    /// Signal shutdown, wait up to 15s for in-flight work to drain, and
    /// force-save the findings store (SPEC_FULL.md §4.1).
    pub async fn stop(&self) {
        self.state_lock().running = false;
        self.cancel.cancel();
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN_BUDGET, self.findings.force_save()).await;
        tracing::info!("[PatrolEngine] stopped");
    }

    pub fn set_config(&self, new: crate::config::PatrolConfig) {
        self.config.store(new);
    }

    pub async fn force_patrol(&self) {
        self.dispatcher.run_full("manual").await;
    }

    pub async fn trigger_patrol_for_alert(&self, alert: AlertInfo) {
        let _ = self.alert_tx.send(alert).await;
    }

    #[must_use]
    pub fn get_status(&self) -> EngineStatus {
        let state = self.state_lock();
        EngineStatus {
            running: state.running,
            next_scheduled_at: state.next_scheduled_at,
            last_run_at: state.last_run_at,
        }
    }
}

/// Poll a take-able `Option<Receiver>` so `tokio::select!` can treat an
/// absent channel as permanently pending rather than a branch that fires once.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}
