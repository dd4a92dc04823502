//! Phase Controller
//!
//! A challenge goes through two phases, each normally in its own process:
//!
//! - `build` runs once, persists the state stores and stops everything it
//!   spawned.
//! - `run` restores the persisted state, runs the challenge's startup logic,
//!   resolves the declared mappings and then serves until told to stop.
//!
//! Each phase is wrapped in a [`PhaseScope`]. Releasing the scope stops every
//! tracked child, every filter and, when the phase leads its own process
//! group, everything else in the group. Dropping an unreleased scope kills
//! tracked children immediately.

use crate::challenge::{ChallengeDefinition, SolveTracker};
use crate::filter::FilterSupervisor;
use crate::net;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::{forward_output, prepare_command, ChildTracker, ProcessGroup, CHILD_LOG_TARGET};
use crate::router::{resolve_and_register, ResolvedRoute, RouteAction, RouteTable};
use crate::schedule::PeriodicTask;
use crate::server::{Gateway, GatewayServer};
use crate::state::ChallengeState;
use anyhow::Context;
use hyper::Method;
use std::fmt;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Build => f.write_str("build"),
            Phase::Run => f.write_str("run"),
        }
    }
}

/// Lifecycle position of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Unbuilt,
    Building,
    Built,
    Running,
    Ready,
}

/// Settings shared by both phases
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Directory holding the persisted state stores
    pub state_dir: PathBuf,
    /// Make each phase its own process group and signal it on exit
    pub isolate_group: bool,
    /// Time children get between SIGTERM and SIGKILL
    pub grace_period: Duration,
    pub bind_addr: SocketAddr,
    pub pool: PoolConfig,
    /// Revealed for dynamic challenges once solved
    pub flag: String,
    /// Executable used for builtin filters, the current one if unset
    pub filter_exe: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/tmp"),
            isolate_group: true,
            grace_period: Duration::from_secs(5),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            pool: PoolConfig::default(),
            flag: crate::challenge::DEFAULT_FLAG.to_string(),
            filter_exe: None,
        }
    }
}

/// What challenge logic can do during a phase
pub struct PhaseContext {
    phase: Phase,
    state: ChallengeState,
    children: ChildTracker,
    filters: Arc<FilterSupervisor>,
}

impl PhaseContext {
    fn new(phase: Phase, state: ChallengeState, filters: Arc<FilterSupervisor>) -> Self {
        Self {
            phase,
            state,
            children: ChildTracker::new(),
            filters,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ChallengeState {
        &self.state
    }

    pub fn children(&self) -> &ChildTracker {
        &self.children
    }

    pub fn filters(&self) -> &Arc<FilterSupervisor> {
        &self.filters
    }

    /// Start `cmd` and keep it running until the phase ends. Returns its pid.
    pub fn spawn_background(&self, label: &str, mut cmd: Command) -> anyhow::Result<u32> {
        prepare_command(&mut cmd);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start background process '{}'", label))?;
        forward_output(&mut child, label);
        let pid = self.children.track(label, child);
        info!(phase = %self.phase, process = label, pid, "Background process started");
        Ok(pid)
    }

    /// Run `cmd` to completion and return its stdout. A non-zero exit is an error.
    pub async fn run_command(&self, label: &str, mut cmd: Command) -> anyhow::Result<String> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(phase = %self.phase, process = label, "Running command");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'", label))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            info!(target: CHILD_LOG_TARGET, process = label, "{}", line);
        }
        for line in stderr.lines() {
            warn!(target: CHILD_LOG_TARGET, process = label, "{}", line);
        }

        if !output.status.success() {
            anyhow::bail!("'{}' failed with {}", label, output.status);
        }
        Ok(stdout)
    }

    pub async fn wait_for_port(&self, host: &str, port: u16, timeout: Duration) -> bool {
        net::wait_for_port(host, port, timeout).await
    }
}

/// A phase's resources, released together
pub struct PhaseScope {
    context: PhaseContext,
    group: ProcessGroup,
    grace_period: Duration,
    released: bool,
}

impl PhaseScope {
    pub fn enter(phase: Phase, state: ChallengeState, filters: Arc<FilterSupervisor>, config: &ControllerConfig) -> Self {
        let group = if config.isolate_group {
            ProcessGroup::isolate()
        } else {
            ProcessGroup::detached()
        };
        info!(%phase, group_leader = group.is_leader(), "Entering phase");
        Self {
            context: PhaseContext::new(phase, state, filters),
            group,
            grace_period: config.grace_period,
            released: false,
        }
    }

    pub fn context(&self) -> &PhaseContext {
        &self.context
    }

    /// Stop children and filters, then signal the process group
    pub async fn release(mut self) {
        let phase = self.context.phase;
        self.context.children.terminate_all(self.grace_period).await;
        self.context.filters.stop_all().await;
        self.group.signal_all();
        self.released = true;
        info!(%phase, "Phase resources released");
    }
}

impl Drop for PhaseScope {
    fn drop(&mut self) {
        if !self.released {
            warn!(phase = %self.context.phase, "Phase scope dropped without release, killing children");
            self.context.children.kill_all_now();
            self.group.signal_all();
        }
    }
}

/// A challenge serving requests
pub struct RunningChallenge {
    local_addr: SocketAddr,
    gateway: Arc<Gateway>,
    routes: Vec<ResolvedRoute>,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<anyhow::Result<()>>,
    solver_task: Option<PeriodicTask>,
    scope: PhaseScope,
}

impl RunningChallenge {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn routes(&self) -> &[ResolvedRoute] {
        &self.routes
    }

    pub fn context(&self) -> &PhaseContext {
        self.scope.context()
    }

    /// Stop serving and release the run phase
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.solver_task {
            task.stop().await;
        }
        let served = match self.server.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
        };
        self.gateway.set_ready(false);
        self.scope.release().await;
        served
    }
}

/// Drives one challenge through its phases
pub struct PhaseController {
    challenge: ChallengeDefinition,
    config: ControllerConfig,
    state: ChallengeState,
    phase_state: PhaseState,
}

impl PhaseController {
    pub fn new(challenge: ChallengeDefinition, config: ControllerConfig) -> Self {
        Self {
            challenge,
            config,
            state: ChallengeState::new(),
            phase_state: PhaseState::Unbuilt,
        }
    }

    pub fn phase_state(&self) -> PhaseState {
        self.phase_state
    }

    pub fn state(&self) -> &ChallengeState {
        &self.state
    }

    pub fn challenge(&self) -> &ChallengeDefinition {
        &self.challenge
    }

    fn supervisor(&self) -> Arc<FilterSupervisor> {
        match &self.config.filter_exe {
            Some(exe) => FilterSupervisor::with_filter_exe(exe.clone(), self.config.grace_period),
            None => FilterSupervisor::new(),
        }
    }

    /// Run the build logic, persist state, stop everything the build started
    pub async fn build(&mut self) -> anyhow::Result<()> {
        self.phase_state = PhaseState::Building;
        let scope = PhaseScope::enter(Phase::Build, self.state.clone(), self.supervisor(), &self.config);

        let result = async {
            self.challenge
                .phases()
                .build(scope.context())
                .await
                .context("Build logic failed")?;
            self.state
                .persist(&self.config.state_dir)
                .context("Failed to persist state")?;
            Ok(())
        }
        .await;

        scope.release().await;

        match &result {
            Ok(()) => {
                self.phase_state = PhaseState::Built;
                info!(challenge = %self.challenge.name, "Build complete");
            }
            Err(e) => {
                self.phase_state = PhaseState::Unbuilt;
                error!(challenge = %self.challenge.name, error = %format!("{:#}", e), "Build failed");
            }
        }
        result
    }

    /// Restore state, run the startup logic, register routes and start serving.
    ///
    /// The listener is bound only after every route is registered.
    pub async fn start(&mut self) -> anyhow::Result<RunningChallenge> {
        self.phase_state = PhaseState::Running;
        let scope = PhaseScope::enter(Phase::Run, self.state.clone(), self.supervisor(), &self.config);

        match self.prepare(&scope).await {
            Ok((routes, resolved)) => match self.serve(routes, resolved, scope).await {
                Ok(running) => {
                    self.phase_state = PhaseState::Ready;
                    Ok(running)
                }
                Err(e) => {
                    self.phase_state = PhaseState::Built;
                    Err(e)
                }
            },
            Err(e) => {
                scope.release().await;
                self.phase_state = PhaseState::Built;
                error!(challenge = %self.challenge.name, error = %format!("{:#}", e), "Run failed");
                Err(e)
            }
        }
    }

    async fn prepare(&self, scope: &PhaseScope) -> anyhow::Result<(RouteTable, Vec<ResolvedRoute>)> {
        self.state
            .restore(&self.config.state_dir)
            .context("Failed to restore state from build")?;

        let mut routes = RouteTable::new();
        routes.insert(Method::GET, "/info", RouteAction::Info)?;
        if self.challenge.capabilities.files {
            routes.insert(Method::GET, "/files", RouteAction::Files)?;
        }
        if self.challenge.capabilities.solver {
            routes.insert(Method::GET, "/solved", RouteAction::Solved)?;
        }

        self.challenge
            .phases()
            .run(scope.context())
            .await
            .context("Run logic failed")?;

        let pool = Arc::new(ConnectionPool::new(self.config.pool.clone()));
        let resolved = resolve_and_register(&self.challenge.mappings, scope.context().filters(), &mut routes, &pool)
            .await
            .context("Failed to register mappings")?;

        Ok((routes, resolved))
    }

    async fn serve(
        &self,
        routes: RouteTable,
        resolved: Vec<ResolvedRoute>,
        scope: PhaseScope,
    ) -> anyhow::Result<RunningChallenge> {
        let solves = Arc::new(SolveTracker::new());
        let gateway = Arc::new(Gateway::new(
            self.challenge.clone(),
            self.state.clone(),
            routes,
            Arc::clone(&solves),
            self.config.flag.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bound = async {
            let server = GatewayServer::bind(self.config.bind_addr, Arc::clone(&gateway), shutdown_rx).await?;
            let local_addr = server.local_addr()?;
            Ok::<_, anyhow::Error>((server, local_addr))
        }
        .await;
        let (server, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                scope.release().await;
                return Err(e);
            }
        };

        let solver_task = match (self.challenge.solve_interval, self.challenge.solver()) {
            (Some(interval), Some(solver)) => {
                let solver = Arc::clone(solver);
                let state = self.state.clone();
                Some(PeriodicTask::spawn("solver", interval, move || {
                    let solver = Arc::clone(&solver);
                    let solves = Arc::clone(&solves);
                    let state = state.clone();
                    async move {
                        if solves.check(solver.as_ref(), &state).await.solved {
                            ControlFlow::Break(())
                        } else {
                            ControlFlow::Continue(())
                        }
                    }
                }))
            }
            _ => None,
        };

        gateway.set_ready(true);
        info!(
            challenge = %self.challenge.name,
            addr = %local_addr,
            mappings = resolved.len(),
            "Challenge ready"
        );

        Ok(RunningChallenge {
            local_addr,
            gateway,
            routes: resolved,
            shutdown_tx,
            server: tokio::spawn(server.run()),
            solver_task,
            scope,
        })
    }

    /// Run the phase to completion: serve until `shutdown_rx` flips to true
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let running = self.start().await?;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!(challenge = %self.challenge.name, "Stopping challenge");
        running.shutdown().await
    }
}
