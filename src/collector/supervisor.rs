use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, log, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, timeout_at, Instant, Interval, MissedTickBehavior};

use super::backoff::Backoff;
use super::protocol::{parse_line, AgentMessage, Command, ProtocolError};
use crate::cache::TtlCache;
use crate::metrics::METRICS;
use crate::schema::TelemetrySample;

/// How long the exit report waits for stdout to drain.
const STDOUT_DRAIN: Duration = Duration::from_secs(1);

// ------------------------------------------------------------
// Configuration
// ------------------------------------------------------------

/// Startup parameters for the local collector.
///
/// All values are opaque to the supervisor and handed to the child
/// as environment variables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub executable_path: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub host_name: String,
    pub server_url: String,
    pub pre_authkey: String,
    pub debug: bool,
}

/// Fixed liveness and restart parameters.
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub probe_cooldown: Duration,
    pub probe_every: u32,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(3),
            backoff_base: Duration::from_millis(1500),
            backoff_max: Duration::from_secs(30),
            probe_cooldown: Duration::from_secs(5 * 60),
            probe_every: 10,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

// ------------------------------------------------------------
// Observable state
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Start,
    Spawning,
    Ready,
    /// PING sent, waiting for PONG
    Heartbeat,
    Exited,
    RestartScheduled,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub agent_id: Option<String>,
    /// Current backoff attempt counter
    pub attempt: u32,
    /// Processes spawned so far
    pub spawns: u64,
    /// Restarts scheduled so far
    pub restarts: u64,
}

// ------------------------------------------------------------
// Event queue
// ------------------------------------------------------------

/// Everything the child process can tell the control loop.
#[derive(Debug)]
enum ChildEvent {
    Spawned { pid: Option<u32> },
    Exited { code: Option<i32>, signal: Option<i32> },
    Line { text: String },
    StderrChunk { text: String },
}

/// Event tagged with the spawn generation it belongs to, so reports
/// from a previous child can never be mistaken for the current one.
#[derive(Debug)]
struct Tagged {
    generation: u64,
    event: ChildEvent,
}

enum Control {
    Refresh,
    Shutdown(oneshot::Sender<()>),
}

struct RunningChild {
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
}

// ------------------------------------------------------------
// Handle
// ------------------------------------------------------------

/// Cheap handle to a running supervisor task.
pub struct SupervisorHandle {
    control: mpsc::Sender<Control>,
    status: watch::Receiver<SupervisorStatus>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// The collector's self-reported identity, if it is currently up.
    pub fn agent_id(&self) -> Option<String> {
        self.status.borrow().agent_id.clone()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// Asks the collector to push fresh HostInfo.
    ///
    /// Never waits: if the control queue is full a refresh is already
    /// pending and this one is dropped.
    pub fn refresh(&self) -> bool {
        self.control.try_send(Control::Refresh).is_ok()
    }

    /// Stops the collector without scheduling a restart and waits for
    /// the control loop to finish.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.control.send(Control::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }

        if let Err(e) = self.task.await {
            warn!(target: "agent", "Supervisor task ended abnormally: {}", e);
        }
    }
}

/// Validates the configuration and starts supervising the collector.
///
/// Configuration faults are logged and yield `None`; the caller keeps
/// running without a local collector.
pub async fn start(
    config: SupervisorConfig,
    timings: SupervisorTimings,
    cache: Arc<TtlCache<TelemetrySample>>,
) -> Option<SupervisorHandle> {
    if config.pre_authkey.trim().is_empty() {
        error!(target: "agent", "Collector `pre_authkey` is not set");
        warn!(target: "agent", "The collector will not run until resolved");
        return None;
    }

    if let Err(e) = prepare_work_dir(&config.work_dir).await {
        error!(
            target: "agent",
            "Collector work dir not accessible at {}: {}",
            config.work_dir.display(),
            e
        );
        return None;
    }
    debug!(target: "agent", "Using collector work dir at {}", config.work_dir.display());

    Some(spawn_supervisor(config, timings, cache))
}

async fn prepare_work_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let meta = tokio::fs::metadata(dir).await?;
    if meta.permissions().readonly() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "directory is read-only",
        ));
    }

    Ok(())
}

fn spawn_supervisor(
    config: SupervisorConfig,
    timings: SupervisorTimings,
    cache: Arc<TtlCache<TelemetrySample>>,
) -> SupervisorHandle {
    let (control_tx, control_rx) = mpsc::channel(16);
    let (events_tx, events_rx) = mpsc::channel(1024);

    let backoff = Backoff::new(
        timings.backoff_base,
        timings.backoff_max,
        timings.probe_cooldown,
        timings.probe_every,
    );

    let initial = SupervisorStatus {
        state: SupervisorState::Start,
        agent_id: None,
        attempt: 0,
        spawns: 0,
        restarts: 0,
    };
    let (status_tx, status_rx) = watch::channel(initial);

    let supervisor = Supervisor {
        config,
        timings,
        cache,
        backoff,
        state: SupervisorState::Start,
        agent_id: None,
        child: None,
        generation: 0,
        spawns: 0,
        restarts: 0,
        shutting_down: false,
        awaiting_pong: false,
        heartbeat: None,
        heartbeat_deadline: None,
        restart_at: None,
        events_tx,
        events_rx,
        status_tx,
    };

    let task = tokio::spawn(supervisor.run(control_rx));

    SupervisorHandle {
        control: control_tx,
        status: status_rx,
        task,
    }
}

// ------------------------------------------------------------
// Control loop
// ------------------------------------------------------------

/// Single owner of the collector subprocess.
///
/// All state lives here and is only touched from `run`, one event at a
/// time. Timers are plain `Option`s: cancelling one means setting it to
/// `None`, so a cancelled timer can never fire into a torn-down child.
struct Supervisor {
    config: SupervisorConfig,
    timings: SupervisorTimings,
    cache: Arc<TtlCache<TelemetrySample>>,
    backoff: Backoff,

    state: SupervisorState,
    agent_id: Option<String>,
    child: Option<RunningChild>,
    generation: u64,
    spawns: u64,
    restarts: u64,
    shutting_down: bool,
    awaiting_pong: bool,

    heartbeat: Option<Interval>,
    heartbeat_deadline: Option<Instant>,
    restart_at: Option<Instant>,

    events_tx: mpsc::Sender<Tagged>,
    events_rx: mpsc::Receiver<Tagged>,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        self.spawn().await;
        self.publish();

        loop {
            tokio::select! {
                cmd = control.recv() => match cmd {
                    Some(Control::Refresh) => self.send(Command::Refresh).await,
                    Some(Control::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    // Every handle is gone, nobody can ask for data anymore.
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },

                Some(tagged) = self.events_rx.recv() => self.handle_event(tagged).await,

                _ = tick(&mut self.heartbeat) => self.on_heartbeat().await,

                _ = sleep_until_opt(self.heartbeat_deadline) => self.on_heartbeat_deadline(),

                _ = sleep_until_opt(self.restart_at) => {
                    self.restart_at = None;
                    self.spawn().await;
                }
            }

            self.publish();
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(SupervisorStatus {
            state: self.state,
            agent_id: self.agent_id.clone(),
            attempt: self.backoff.attempt(),
            spawns: self.spawns,
            restarts: self.restarts,
        });
    }

    // --------------------------------------------------------
    // Spawning
    // --------------------------------------------------------

    async fn spawn(&mut self) {
        self.generation += 1;
        self.state = SupervisorState::Spawning;

        match self.spawn_child() {
            Ok(child) => {
                self.spawns += 1;
                self.child = Some(child);
                self.start_heartbeat();
                self.send(Command::Start).await;
            }
            Err(e) => {
                error!(
                    target: "agent",
                    "Failed to spawn collector {}: {}",
                    self.config.executable_path.display(),
                    e
                );
                self.schedule_restart();
            }
        }
    }

    fn spawn_child(&self) -> std::io::Result<RunningChild> {
        let cfg = &self.config;
        let mut cmd = ProcessCommand::new(&cfg.executable_path);

        cmd.args(&cfg.args)
            .env_clear()
            .env("TELEMETRY_AGENT_WORK_DIR", &cfg.work_dir)
            .env("TELEMETRY_AGENT_DEBUG", if cfg.debug { "true" } else { "false" })
            .env("TELEMETRY_AGENT_HOSTNAME", &cfg.host_name)
            .env("TELEMETRY_AGENT_SERVER_URL", &cfg.server_url)
            .env("TELEMETRY_AGENT_AUTHKEY", &cfg.pre_authkey)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(home) = std::env::var_os("HOME") {
            cmd.env("HOME", home);
        }

        let mut child = cmd.spawn()?;
        let generation = self.generation;
        let events = self.events_tx.clone();

        let _ = events.try_send(Tagged {
            generation,
            event: ChildEvent::Spawned { pid: child.id() },
        });

        let stdin = child.stdin.take();

        // stdout -> one Line event per line
        let stdout_task = child.stdout.take().map(|stdout| {
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    let line = Tagged { generation, event: ChildEvent::Line { text } };
                    if events.send(line).await.is_err() {
                        break;
                    }
                }
            })
        });

        // stderr -> raw chunks
        if let Some(mut stderr) = child.stderr.take() {
            let events = events.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let chunk = Tagged { generation, event: ChildEvent::StderrChunk { text } };
                    if events.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Waiter owns the process. It reports the exit only after stdout
        // drained, so every line the child wrote is handled before it.
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            if let Some(task) = stdout_task {
                let _ = timeout(STDOUT_DRAIN, task).await;
            }

            let (code, signal) = match status {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(_) => (None, None),
            };

            let _ = events
                .send(Tagged { generation, event: ChildEvent::Exited { code, signal } })
                .await;
        });

        Ok(RunningChild {
            stdin,
            kill: Some(kill_tx),
        })
    }

    fn kill_child(&mut self) {
        if let Some(kill) = self.child.as_mut().and_then(|c| c.kill.take()) {
            let _ = kill.send(());
        }
    }

    fn schedule_restart(&mut self) {
        let delay = self.backoff.next_delay();
        self.restarts += 1;
        METRICS.agent_restarts.fetch_add(1, Ordering::Relaxed);

        warn!(
            target: "agent",
            "Collector will restart in {:.1} seconds (attempt {})",
            delay.as_secs_f64(),
            self.backoff.attempt()
        );

        self.restart_at = Some(Instant::now() + delay);
        self.state = SupervisorState::RestartScheduled;
    }

    // --------------------------------------------------------
    // Outbound
    // --------------------------------------------------------

    async fn send(&mut self, cmd: Command) {
        let Some(stdin) = self.child.as_mut().and_then(|c| c.stdin.as_mut()) else {
            return;
        };

        let written = async {
            stdin.write_all(cmd.encode().as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            debug!(target: "agent", "Failed to send {} to collector: {}", cmd, e);
            if let Some(child) = self.child.as_mut() {
                child.stdin = None;
            }
        }
    }

    // --------------------------------------------------------
    // Heartbeat
    // --------------------------------------------------------

    fn start_heartbeat(&mut self) {
        let every = self.timings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
        self.heartbeat_deadline = None;
        self.awaiting_pong = false;
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
        self.heartbeat_deadline = None;
        self.awaiting_pong = false;
    }

    async fn on_heartbeat(&mut self) {
        if self.child.is_none() {
            return;
        }

        // The previous PING was never answered.
        if self.awaiting_pong {
            self.heartbeat_failed("missed");
            return;
        }

        self.awaiting_pong = true;
        self.send(Command::Ping).await;
        self.heartbeat_deadline = Some(Instant::now() + self.timings.heartbeat_timeout);
        self.state = SupervisorState::Heartbeat;
    }

    fn on_heartbeat_deadline(&mut self) {
        self.heartbeat_deadline = None;
        if self.awaiting_pong {
            self.heartbeat_failed("timed out");
        }
    }

    fn heartbeat_failed(&mut self, reason: &str) {
        METRICS.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
        error!(target: "agent", "Collector heartbeat {}, killing it", reason);

        self.agent_id = None;
        self.stop_heartbeat();
        self.kill_child();
    }

    // --------------------------------------------------------
    // Inbound
    // --------------------------------------------------------

    async fn handle_event(&mut self, tagged: Tagged) {
        if tagged.generation != self.generation {
            debug!(target: "agent", "Ignoring event from stale collector generation {}", tagged.generation);
            return;
        }

        match tagged.event {
            ChildEvent::Spawned { pid } => {
                info!(target: "agent", "Collector started (pid {:?})", pid);
            }
            ChildEvent::Exited { code, signal } => self.on_exit(code, signal),
            ChildEvent::Line { text } => self.on_line(&text).await,
            ChildEvent::StderrChunk { text } => {
                error!(target: "agent", "Collector stderr: {}", text.trim_end());
            }
        }
    }

    fn on_exit(&mut self, code: Option<i32>, signal: Option<i32>) {
        self.child = None;
        self.agent_id = None;
        self.stop_heartbeat();
        self.state = SupervisorState::Exited;

        if self.shutting_down {
            info!(target: "agent", "Collector exited gracefully");
            return;
        }

        warn!(
            target: "agent",
            "Collector exited with code {:?} and signal {:?}",
            code,
            signal
        );
        self.schedule_restart();
    }

    async fn on_line(&mut self, text: &str) {
        let msg = match parse_line(text) {
            Ok(msg) => msg,
            Err(ProtocolError::Empty) => return,
            Err(e) => {
                warn!(target: "agent", "Dropping malformed collector line: {}", e);
                debug!(target: "agent", "Raw line: {}", text);
                return;
            }
        };

        match msg {
            AgentMessage::Ready { agent_id } => {
                if self.child.is_none() {
                    return;
                }

                self.backoff.reset();
                // Ask for everything right away so lookups are warm.
                self.send(Command::Refresh).await;
                self.observe_identity(agent_id);
                self.state = SupervisorState::Ready;
                info!(target: "agent", "Collector is ready and serving queries");
            }

            AgentMessage::Pong { agent_id } => {
                if self.child.is_none() {
                    return;
                }

                self.awaiting_pong = false;
                self.heartbeat_deadline = None;
                self.observe_identity(agent_id);
                self.state = SupervisorState::Ready;
            }

            AgentMessage::HostInfo { node_id, payload } => {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(payload) => {
                        debug!(target: "agent", "Received HostInfo for {}", node_id);
                        METRICS.samples_received.fetch_add(1, Ordering::Relaxed);
                        let sample = TelemetrySample::new(node_id.clone(), payload);
                        self.cache.set(node_id, sample);
                    }
                    Err(e) => {
                        METRICS.samples_dropped.fetch_add(1, Ordering::Relaxed);
                        error!(target: "agent", "Failed to parse HostInfo for {}: {}", node_id, e);
                    }
                }
            }

            AgentMessage::Error { message } => {
                warn!(target: "agent", "Collector reported an error: {}", message);
            }

            AgentMessage::Log { level, message } => {
                log!(target: "agent", level.as_log(), "{}", message);
            }
        }
    }

    fn observe_identity(&mut self, agent_id: String) {
        if let Some(previous) = &self.agent_id {
            if previous != &agent_id {
                warn!(target: "agent", "Collector ID changed from {} to {}", previous, agent_id);
            }
        }
        self.agent_id = Some(agent_id);
    }

    // --------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------

    async fn shutdown(&mut self) {
        self.shutting_down = true;
        self.state = SupervisorState::ShuttingDown;
        self.agent_id = None;

        // Timers first: heartbeat interval, heartbeat deadline, restart.
        self.heartbeat = None;
        self.heartbeat_deadline = None;
        self.restart_at = None;
        self.awaiting_pong = false;
        self.publish();

        if self.child.is_none() {
            return;
        }

        self.send(Command::Shutdown).await;
        if let Some(child) = self.child.as_mut() {
            // Closing stdin gives line-reading children an EOF as well.
            child.stdin = None;
        }

        let grace = self.timings.shutdown_grace;
        if !self.wait_for_exit(grace).await {
            warn!(target: "agent", "Collector ignored SHUTDOWN, killing it");
            self.kill_child();
            if !self.wait_for_exit(grace).await {
                error!(target: "agent", "Collector did not exit after kill");
            }
        }

        self.publish();
    }

    /// Drains events until the current child reports its exit or the
    /// grace period runs out. Samples still arriving are kept.
    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;

        loop {
            let tagged = match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(tagged)) => tagged,
                Ok(None) | Err(_) => return false,
            };

            if tagged.generation != self.generation {
                continue;
            }

            match tagged.event {
                ChildEvent::Exited { code, signal } => {
                    self.on_exit(code, signal);
                    return true;
                }
                ChildEvent::Line { text } => {
                    if let Ok(AgentMessage::HostInfo { .. }) = parse_line(&text) {
                        self.on_line(&text).await;
                    }
                }
                _ => {}
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
