//! Challenge definition
//!
//! A challenge is its build/run logic plus optional capabilities (a files
//! archive, a solver, a details text). Which capabilities it offers is declared
//! up front in [`Capabilities`] and checked against the implementations it
//! supplies when the definition is built.

use crate::error::{GateError, GateResult};
use crate::phase::PhaseContext;
use crate::router::MappingConfig;
use crate::state::ChallengeState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Flag returned by `/solved` for dynamic challenges when `FLAG` is unset
pub const DEFAULT_FLAG: &str = "HAL{PLACEHOLDER}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    /// No flag; solving is tracked by the solver alone
    #[default]
    None,
    /// The flag is distributed out of band
    Static,
    /// The flag comes from the environment and is revealed once solved
    Dynamic,
}

/// Which optional features a challenge offers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Capabilities {
    #[serde(default)]
    pub files: bool,
    #[serde(default)]
    pub solver: bool,
    #[serde(default)]
    pub details: bool,
}

impl Capabilities {
    /// Smart contract challenges: downloadable sources and a solver
    pub fn web3() -> Self {
        Self {
            files: true,
            solver: true,
            details: false,
        }
    }
}

/// Result of one solver check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolverVerdict {
    pub solved: bool,
    /// Message shown to the player instead of the default
    pub msg: Option<String>,
}

impl SolverVerdict {
    pub fn solved(msg: impl Into<String>) -> Self {
        Self {
            solved: true,
            msg: Some(msg.into()),
        }
    }

    pub fn unsolved() -> Self {
        Self::default()
    }
}

/// Challenge-specific build and run logic
#[async_trait]
pub trait ChallengePhases: Send + Sync {
    /// One-time setup. Everything spawned here is stopped when the build ends.
    async fn build(&self, ctx: &PhaseContext) -> anyhow::Result<()>;

    /// Per-instance startup, before routes go live
    async fn run(&self, ctx: &PhaseContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Solver: Send + Sync {
    async fn check(&self, state: &ChallengeState) -> anyhow::Result<SolverVerdict>;
}

#[async_trait]
pub trait FilesProvider: Send + Sync {
    /// Zip archive offered to players
    async fn archive(&self) -> anyhow::Result<Vec<u8>>;
}

pub trait DetailsProvider: Send + Sync {
    fn details(&self, state: &ChallengeState) -> anyhow::Result<String>;
}

/// A validated challenge
#[derive(Clone)]
pub struct ChallengeDefinition {
    pub name: String,
    pub flag_type: FlagType,
    pub capabilities: Capabilities,
    pub mappings: Vec<MappingConfig>,
    /// Re-run the solver on this interval while unsolved
    pub solve_interval: Option<Duration>,
    phases: Arc<dyn ChallengePhases>,
    solver: Option<Arc<dyn Solver>>,
    files: Option<Arc<dyn FilesProvider>>,
    details: Option<Arc<dyn DetailsProvider>>,
}

impl std::fmt::Debug for ChallengeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeDefinition")
            .field("name", &self.name)
            .field("flag_type", &self.flag_type)
            .field("capabilities", &self.capabilities)
            .field("mappings", &self.mappings.len())
            .finish()
    }
}

impl ChallengeDefinition {
    pub fn builder(name: impl Into<String>, phases: impl ChallengePhases + 'static) -> ChallengeBuilder {
        ChallengeBuilder {
            name: name.into(),
            flag_type: FlagType::default(),
            capabilities: Capabilities::default(),
            mappings: Vec::new(),
            solve_interval: None,
            phases: Arc::new(phases),
            solver: None,
            files: None,
            details: None,
        }
    }

    pub fn phases(&self) -> &Arc<dyn ChallengePhases> {
        &self.phases
    }

    pub fn solver(&self) -> Option<&Arc<dyn Solver>> {
        self.solver.as_ref()
    }

    pub fn files(&self) -> Option<&Arc<dyn FilesProvider>> {
        self.files.as_ref()
    }

    pub fn details(&self) -> Option<&Arc<dyn DetailsProvider>> {
        self.details.as_ref()
    }

    /// Download name of the files archive
    pub fn archive_name(&self) -> String {
        format!("{}.zip", self.name.replace(' ', "_"))
    }
}

pub struct ChallengeBuilder {
    name: String,
    flag_type: FlagType,
    capabilities: Capabilities,
    mappings: Vec<MappingConfig>,
    solve_interval: Option<Duration>,
    phases: Arc<dyn ChallengePhases>,
    solver: Option<Arc<dyn Solver>>,
    files: Option<Arc<dyn FilesProvider>>,
    details: Option<Arc<dyn DetailsProvider>>,
}

impl ChallengeBuilder {
    pub fn flag_type(mut self, flag_type: FlagType) -> Self {
        self.flag_type = flag_type;
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn mapping(mut self, mapping: MappingConfig) -> Self {
        self.mappings.push(mapping);
        self
    }

    pub fn mappings(mut self, mappings: impl IntoIterator<Item = MappingConfig>) -> Self {
        self.mappings.extend(mappings);
        self
    }

    pub fn solver(mut self, solver: impl Solver + 'static) -> Self {
        self.solver = Some(Arc::new(solver));
        self
    }

    pub fn solve_every(mut self, interval: Duration) -> Self {
        self.solve_interval = Some(interval);
        self
    }

    pub fn files(mut self, files: impl FilesProvider + 'static) -> Self {
        self.files = Some(Arc::new(files));
        self
    }

    pub fn details(mut self, details: impl DetailsProvider + 'static) -> Self {
        self.details = Some(Arc::new(details));
        self
    }

    /// Validate and finish. All problems are reported together.
    pub fn build(self) -> GateResult<ChallengeDefinition> {
        let mut errors = Vec::new();
        let caps = self.capabilities;

        let checks = [
            ("files", caps.files, self.files.is_some()),
            ("solver", caps.solver, self.solver.is_some()),
            ("details", caps.details, self.details.is_some()),
        ];
        for (capability, declared, provided) in checks {
            match (declared, provided) {
                (true, false) => errors.push(format!("'{}' is enabled but no implementation is provided", capability)),
                (false, true) => errors.push(format!("'{}' is implemented but not enabled", capability)),
                _ => {}
            }
        }

        if !caps.solver && self.flag_type == FlagType::None {
            errors.push("a challenge without a solver needs a flag type other than 'none'".to_string());
        }
        if self.solve_interval.is_some() && !caps.solver {
            errors.push("a solve interval needs a solver".to_string());
        }

        for mapping in &self.mappings {
            if let Err(e) = mapping.validate() {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            return Err(GateError::Configuration(format!(
                "challenge '{}':\n  - {}",
                self.name,
                errors.join("\n  - ")
            )));
        }

        Ok(ChallengeDefinition {
            name: self.name,
            flag_type: self.flag_type,
            capabilities: self.capabilities,
            mappings: self.mappings,
            solve_interval: self.solve_interval,
            phases: self.phases,
            solver: self.solver,
            files: self.files,
            details: self.details,
        })
    }
}

/// Last known solve outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveStatus {
    pub solved: bool,
    pub msg: Option<String>,
}

impl SolveStatus {
    /// Solver message, or the default text for the current outcome
    pub fn message(&self) -> String {
        match &self.msg {
            Some(msg) if !msg.is_empty() => msg.clone(),
            _ if self.solved => "Solved".to_string(),
            _ => "Not solved".to_string(),
        }
    }
}

/// Serializes solver runs and keeps `solved` sticky
#[derive(Debug, Default)]
pub struct SolveTracker {
    status: tokio::sync::Mutex<SolveStatus>,
}

impl SolveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `solver` unless already solved. A failing solver leaves the status unchanged.
    pub async fn check(&self, solver: &dyn Solver, state: &ChallengeState) -> SolveStatus {
        let mut status = self.status.lock().await;
        if status.solved {
            return status.clone();
        }

        match solver.check(state).await {
            Ok(verdict) => {
                if verdict.solved {
                    info!(msg = ?verdict.msg, "Challenge solved");
                }
                status.solved = verdict.solved;
                status.msg = verdict.msg;
            }
            Err(e) => {
                let err = GateError::SolverExecution(format!("{:#}", e));
                warn!(error = %err, "Solver check failed");
            }
        }
        status.clone()
    }

    pub async fn status(&self) -> SolveStatus {
        self.status.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopPhases;

    #[async_trait]
    impl ChallengePhases for NoopPhases {
        async fn build(&self, _ctx: &PhaseContext) -> anyhow::Result<()> {
            Ok(())
        }
        async fn run(&self, _ctx: &PhaseContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Unsolved on the first call, solved afterwards
    #[derive(Default)]
    struct CountingSolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Solver for CountingSolver {
        async fn check(&self, _state: &ChallengeState) -> anyhow::Result<SolverVerdict> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n == 0 {
                SolverVerdict::unsolved()
            } else {
                SolverVerdict::solved("well done")
            })
        }
    }

    struct FailingSolver;

    #[async_trait]
    impl Solver for FailingSolver {
        async fn check(&self, _state: &ChallengeState) -> anyhow::Result<SolverVerdict> {
            anyhow::bail!("rpc unreachable")
        }
    }

    struct StaticFiles;

    #[async_trait]
    impl FilesProvider for StaticFiles {
        async fn archive(&self) -> anyhow::Result<Vec<u8>> {
            Ok(b"PK".to_vec())
        }
    }

    #[test]
    fn test_web3_preset() {
        let caps = Capabilities::web3();
        assert!(caps.files);
        assert!(caps.solver);
        assert!(!caps.details);
    }

    #[test]
    fn test_flag_type_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            flag_type: FlagType,
        }
        let w: Wrapper = toml::from_str(r#"flag_type = "dynamic""#).unwrap();
        assert_eq!(w.flag_type, FlagType::Dynamic);
        assert!(toml::from_str::<Wrapper>(r#"flag_type = "rotating""#).is_err());
    }

    #[test]
    fn test_valid_definition() {
        let def = ChallengeDefinition::builder("Free Money", NoopPhases)
            .capabilities(Capabilities::web3())
            .flag_type(FlagType::Dynamic)
            .solver(CountingSolver::default())
            .files(StaticFiles)
            .mapping(MappingConfig::new("/", 8545).with_methods(["POST"]))
            .build()
            .unwrap();

        assert_eq!(def.archive_name(), "Free_Money.zip");
        assert!(def.solver().is_some());
        assert!(def.details().is_none());
    }

    #[test]
    fn test_capability_mismatch_is_rejected() {
        let err = ChallengeDefinition::builder("c", NoopPhases)
            .capabilities(Capabilities {
                files: true,
                solver: true,
                details: false,
            })
            .solver(CountingSolver::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
        assert!(err.to_string().contains("'files' is enabled"));

        let err = ChallengeDefinition::builder("c", NoopPhases)
            .flag_type(FlagType::Static)
            .files(StaticFiles)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("'files' is implemented but not enabled"));
    }

    #[test]
    fn test_no_solver_and_no_flag_is_rejected() {
        let err = ChallengeDefinition::builder("c", NoopPhases).build().unwrap_err();
        assert!(err.to_string().contains("flag type"));

        assert!(ChallengeDefinition::builder("c", NoopPhases)
            .flag_type(FlagType::Static)
            .build()
            .is_ok());
    }

    #[test]
    fn test_invalid_mapping_is_rejected() {
        let err = ChallengeDefinition::builder("c", NoopPhases)
            .flag_type(FlagType::Static)
            .mapping(MappingConfig::new("/", 0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_default_messages() {
        assert_eq!(SolveStatus::default().message(), "Not solved");
        let solved = SolveStatus {
            solved: true,
            msg: None,
        };
        assert_eq!(solved.message(), "Solved");
        let custom = SolveStatus {
            solved: false,
            msg: Some("balance too low".to_string()),
        };
        assert_eq!(custom.message(), "balance too low");
    }

    #[tokio::test]
    async fn test_solved_is_sticky() {
        let tracker = SolveTracker::new();
        let solver = CountingSolver::default();
        let state = ChallengeState::new();

        assert!(!tracker.check(&solver, &state).await.solved);
        let status = tracker.check(&solver, &state).await;
        assert!(status.solved);
        assert_eq!(status.msg.as_deref(), Some("well done"));

        // Not re-run once solved
        assert!(tracker.check(&solver, &state).await.solved);
        assert_eq!(solver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_solver_reports_unsolved() {
        let tracker = SolveTracker::new();
        let status = tracker.check(&FailingSolver, &ChallengeState::new()).await;
        assert!(!status.solved);
        assert_eq!(status.message(), "Not solved");
    }
}
