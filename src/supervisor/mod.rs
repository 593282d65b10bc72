//! Supervisor: owns the backend process and keeps it healthy.
//!
//! `start`/`ensure_running` are serialised by an in-flight guard so two
//! callers never launch two processes. The process handle and state live in a
//! separate slot that is only locked briefly, which lets `stop()` clear the
//! handle while a start is still waiting for readiness.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Settings;
use crate::error::{Result, SupervisorError};
use crate::health::{wait_until_ready, HealthProber, HealthStatus};
use crate::process::launcher::check_paths;
use crate::process::{
    launch, ExitHook, ExitSignal, InterpreterResolver, LaunchSpec, SupervisedProcess,
};
use crate::sink::LogSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
struct Slot {
    process: Option<SupervisedProcess>,
    state: SupervisorState,
    generation: u64,
    last_exit: ExitSignal,
    restarts: u64,
}

impl Slot {
    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            log::debug!("supervisor {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn holds(&self, generation: u64) -> bool {
        self.process
            .as_ref()
            .map(|p| p.generation() == generation)
            .unwrap_or(false)
    }
}

pub struct Supervisor {
    settings: Settings,
    resolver: InterpreterResolver,
    prober: HealthProber,
    sink: LogSink,
    in_flight: tokio::sync::Mutex<()>,
    slot: Arc<Mutex<Slot>>,
}

impl Supervisor {
    pub fn new(settings: Settings, sink: LogSink) -> Self {
        let resolver =
            InterpreterResolver::new(settings.interpreter.as_deref(), settings.version_check_timeout);
        Self::with_resolver(settings, sink, resolver)
    }

    pub fn with_resolver(settings: Settings, sink: LogSink, resolver: InterpreterResolver) -> Self {
        let prober = HealthProber::new(settings.health_url(), settings.probe_timeout);
        Self {
            settings,
            resolver,
            prober,
            sink,
            in_flight: tokio::sync::Mutex::new(()),
            slot: Arc::new(Mutex::new(Slot {
                process: None,
                state: SupervisorState::Stopped,
                generation: 0,
                last_exit: ExitSignal::NeverStarted,
                restarts: 0,
            })),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub fn state(&self) -> SupervisorState {
        self.slot.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.slot.lock().process.as_ref().and_then(SupervisedProcess::pid)
    }

    pub fn has_process(&self) -> bool {
        self.slot.lock().process.is_some()
    }

    /// Number of launch attempts so far.
    pub fn launches(&self) -> u64 {
        self.slot.lock().generation
    }

    /// Number of stuck processes replaced by `ensure_running`.
    pub fn restarts(&self) -> u64 {
        self.slot.lock().restarts
    }

    pub fn exit_signal(&self) -> ExitSignal {
        let slot = self.slot.lock();
        match slot.process {
            Some(ref p) if p.is_alive() => ExitSignal::Running,
            _ => slot.last_exit,
        }
    }

    /// Point-in-time probe with no effect on supervision.
    ///
    /// Takes neither the in-flight guard nor the slot lock, so it answers
    /// while a start is still waiting for readiness.
    pub async fn check_health(&self) -> HealthStatus {
        self.prober.probe().await
    }

    /// Make sure a healthy backend is running, replacing a stuck one.
    pub async fn ensure_running(&self) -> Result<()> {
        let _guard = self.in_flight.lock().await;

        if self.has_process() {
            if self.prober.probe().await.is_healthy() {
                self.slot.lock().transition(SupervisorState::Healthy);
                return Ok(());
            }

            self.sink.note("Server process is not responding; restarting");
            self.slot.lock().restarts += 1;
            self.shut_down(SupervisorState::Unhealthy).await;
        }

        self.launch_and_wait().await
    }

    /// Launch the backend unless a healthy one is already running.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.in_flight.lock().await;

        if self.has_process() {
            if self.prober.probe().await.is_healthy() {
                log::debug!("server already running and healthy");
                self.slot.lock().transition(SupervisorState::Healthy);
                return Ok(());
            }
            // Present but not answering: stuck or zombie
            self.shut_down(SupervisorState::Unhealthy).await;
        }

        self.launch_and_wait().await
    }

    /// Terminate the backend if it is still running and clear the handle.
    ///
    /// Safe to call repeatedly; errors from an already-dead process are ignored.
    pub async fn stop(&self) {
        self.shut_down(SupervisorState::Stopped).await;
    }

    async fn shut_down(&self, next: SupervisorState) {
        let taken = {
            let mut slot = self.slot.lock();
            slot.transition(next);
            slot.process.take()
        };

        let Some(mut process) = taken else {
            return;
        };

        if process.is_alive() {
            self.sink.note(format!(
                "Stopping server (PID: {})",
                process.pid().map(|p| p.to_string()).unwrap_or_else(|| "?".into())
            ));
            if !process.terminate() {
                log::debug!("server process already gone");
            } else if !process.wait_exit(self.settings.stop_timeout).await {
                log::warn!(
                    "server did not report exit within {}ms",
                    self.settings.stop_timeout.as_millis()
                );
                return;
            }
        }

        let mut slot = self.slot.lock();
        if slot.generation == process.generation() && !process.is_alive() {
            slot.last_exit = ExitSignal::Exited(process.exit_code());
        }
    }

    /// Run `ensure_running` every `interval` until `shutdown` resolves.
    pub async fn watchdog<S>(&self, interval: Duration, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.ensure_running().await {
                        log::warn!("health watchdog: {}", e);
                        self.sink.note(e.user_message());
                    }
                }
            }
        }
    }

    async fn launch_and_wait(&self) -> Result<()> {
        self.slot.lock().transition(SupervisorState::Starting);
        self.sink.note("Initialization...");

        let script = self.settings.script_path.clone();
        let cwd = self.settings.working_dir();
        if let Err(e) = check_paths(&script, &cwd) {
            self.sink.note(format!("Critical error: {}", e));
            self.slot.lock().transition(SupervisorState::Unhealthy);
            return Err(e);
        }

        let interpreter = self.resolver.resolve().await;
        self.sink.note(format!("Using interpreter: {}", interpreter));

        let generation = {
            let mut slot = self.slot.lock();
            if slot.state != SupervisorState::Starting {
                drop(slot);
                self.sink.note("Start cancelled before launch");
                return Err(SupervisorError::Cancelled);
            }
            slot.generation += 1;
            slot.generation
        };
        let spec = LaunchSpec {
            interpreter,
            script,
            cwd,
            generation,
        };

        let process = match launch(&spec, &self.sink, self.exit_hook(generation)) {
            Ok(process) => process,
            Err(e) => {
                self.slot.lock().transition(SupervisorState::Unhealthy);
                return Err(e);
            }
        };
        self.install(process);

        self.sink.note("Waiting for server to be ready...");
        let slot = Arc::clone(&self.slot);
        let ready = wait_until_ready(
            &self.prober,
            move || slot.lock().holds(generation),
            self.settings.startup_timeout,
            self.settings.poll_interval,
        )
        .await;

        self.finish_start(generation, ready)
    }

    fn install(&self, process: SupervisedProcess) {
        let mut slot = self.slot.lock();
        if slot.state != SupervisorState::Starting {
            // stop() ran while launching; the dropped handle kills the child
            return;
        }
        if process.is_alive() {
            slot.process = Some(process);
        } else {
            slot.last_exit = ExitSignal::Exited(process.exit_code());
        }
    }

    fn finish_start(&self, generation: u64, ready: bool) -> Result<()> {
        let mut slot = self.slot.lock();

        if ready && slot.holds(generation) {
            slot.transition(SupervisorState::Healthy);
            drop(slot);
            self.sink.note("Server is READY!");
            return Ok(());
        }

        let err = if slot.state == SupervisorState::Stopped {
            SupervisorError::Cancelled
        } else if slot.holds(generation) {
            slot.transition(SupervisorState::Unhealthy);
            SupervisorError::ReadinessTimeout {
                budget: self.settings.startup_timeout,
            }
        } else {
            slot.transition(SupervisorState::Unhealthy);
            let code = match slot.last_exit {
                ExitSignal::Exited(code) => code,
                _ => None,
            };
            SupervisorError::ProcessCrashed { code }
        };
        drop(slot);

        self.sink.note("Server failed to pass health check.");
        self.sink.note(err.user_message());
        Err(err)
    }

    fn exit_hook(&self, generation: u64) -> ExitHook {
        let slot = Arc::clone(&self.slot);
        Box::new(move |code| {
            let mut slot = slot.lock();
            if slot.generation != generation {
                return;
            }
            slot.last_exit = ExitSignal::Exited(code);
            if slot.holds(generation) {
                slot.process = None;
                if slot.state != SupervisorState::Stopped {
                    slot.transition(SupervisorState::Unhealthy);
                }
            }
        })
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("health_url", &self.prober.url())
            .field("script", &self.settings.script_path)
            .field("state", &self.state())
            .finish()
    }
}
