use crate::challenge::{Capabilities, FlagType, DEFAULT_FLAG};
use crate::phase::ControllerConfig;
use crate::pool::PoolConfig;
use crate::router::MappingConfig;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the challenge configuration
pub const DEFAULT_CONFIG_PATH: &str = "challenge.toml";

/// Challenge configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub challenge: ChallengeConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    /// Steps run once, before any instance starts
    #[serde(default)]
    pub build: PhaseConfig,

    /// Steps run at every instance start
    #[serde(default)]
    pub run: PhaseConfig,

    /// Declared mappings, in precedence order
    #[serde(default, rename = "mapping")]
    pub mappings: Vec<MappingConfig>,

    pub solver: Option<SolverConfig>,

    pub files: Option<FilesConfig>,

    pub details: Option<DetailsConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChallengeConfig {
    pub name: String,

    #[serde(default)]
    pub flag_type: FlagType,

    /// Capability preset, currently only "web3"
    pub preset: Option<String>,

    #[serde(default)]
    pub has_files: bool,

    #[serde(default)]
    pub has_solver: bool,

    #[serde(default)]
    pub has_details: bool,
}

impl ChallengeConfig {
    /// Preset capabilities combined with the explicit `has_*` flags
    pub fn capabilities(&self) -> Capabilities {
        let base = match self.preset.as_deref() {
            Some("web3") => Capabilities::web3(),
            _ => Capabilities::default(),
        };
        Capabilities {
            files: base.files || self.has_files,
            solver: base.solver || self.has_solver,
            details: base.details || self.has_details,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public port (default: 8080, overridden by PORT)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Backend connect timeout in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            connect_timeout_ms: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}:{}': {}", self.bind, self.port, e))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// Directory the build phase writes state to (default: /tmp)
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Run each phase in its own process group (default: true)
    #[serde(default = "default_isolate_group")]
    pub isolate_group: bool,

    /// Seconds between SIGTERM and SIGKILL when stopping children (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            isolate_group: default_isolate_group(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl ProcessConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// Initial state and steps of one phase
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PhaseConfig {
    /// Values for the private store
    #[serde(default)]
    pub state: Map<String, Value>,

    /// Values for the public store
    #[serde(default)]
    pub public_state: Map<String, Value>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One command run during a phase
#[derive(Debug, Deserialize, Clone)]
pub struct StepConfig {
    /// Label used in logs (default: the program name)
    pub name: Option<String>,

    /// Command line, split like a shell would. `{key}` is replaced from state.
    pub command: String,

    /// Keep running until the phase ends instead of waiting for exit
    #[serde(default)]
    pub background: bool,

    /// Store trimmed stdout under this key
    pub capture: Option<String>,

    /// Store the captured value in the public store
    #[serde(default)]
    pub public: bool,

    /// Wait for this local port after starting the command
    pub wait_for_port: Option<u16>,

    /// How long to wait for `wait_for_port` (default: 30000)
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub working_dir: Option<PathBuf>,
}

impl StepConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: None,
            command: command.into(),
            background: false,
            capture: None,
            public: false,
            wait_for_port: None,
            wait_timeout_ms: default_wait_timeout(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn validate(&self, index: usize) -> Result<(), String> {
        let label = self.name.clone().unwrap_or_else(|| format!("#{}", index + 1));

        match shell_words::split(&self.command) {
            Ok(words) if words.is_empty() => return Err(format!("Step '{}': 'command' is empty", label)),
            Err(e) => return Err(format!("Step '{}': cannot parse command: {}", label, e)),
            Ok(_) => {}
        }

        if self.background && self.capture.is_some() {
            return Err(format!("Step '{}': a background step cannot capture output", label));
        }

        if self.public && self.capture.is_none() {
            return Err(format!("Step '{}': 'public' needs 'capture'", label));
        }

        if self.wait_for_port == Some(0) {
            return Err(format!("Step '{}': 'wait_for_port' must be greater than 0", label));
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SolverConfig {
    /// Exit status 0 means solved; trimmed stdout is the message
    pub command: String,

    /// Also run the solver on this interval until solved
    pub every_secs: Option<u64>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    /// Pre-built zip archive, relative to the configuration file
    #[serde(default)]
    pub archive: Option<PathBuf>,

    /// Glob patterns of files to pack when no archive is given
    #[serde(default)]
    pub include: Vec<String>,

    /// Extra entries packed as-is, keyed by their path inside the archive
    #[serde(default)]
    pub inline: BTreeMap<String, String>,

    /// Directory entry names are made relative to
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl FilesConfig {
    fn validate(&self) -> anyhow::Result<()> {
        match &self.archive {
            Some(_) if !self.include.is_empty() || !self.inline.is_empty() => {
                anyhow::bail!("[files] 'archive' cannot be combined with 'include' or 'inline'")
            }
            None if self.include.is_empty() && self.inline.is_empty() => {
                anyhow::bail!("[files] needs an 'archive' or at least one 'include' or 'inline' entry")
            }
            _ => {}
        }
        for pattern in &self.include {
            if let Err(e) = glob::Pattern::new(pattern) {
                anyhow::bail!("[files] invalid include pattern '{}': {}", pattern, e);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetailsConfig {
    /// Text with `{key}` placeholders filled from public, then private state
    pub template: String,
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_isolate_group() -> bool {
    true
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_wait_timeout() -> u64 {
    30_000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply `PORT` from the environment
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }
        Ok(())
    }

    /// Make relative file paths relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        resolve(&mut self.state.dir);
        for step in self.build.steps.iter_mut().chain(self.run.steps.iter_mut()) {
            if let Some(dir) = &mut step.working_dir {
                resolve(dir);
            }
        }

        if let Some(files) = &mut self.files {
            if let Some(archive) = &mut files.archive {
                resolve(archive);
            }
            let escaped = glob::Pattern::escape(&base.to_string_lossy());
            for pattern in &mut files.include {
                if Path::new(pattern.as_str()).is_relative() {
                    *pattern = Path::new(&escaped)
                        .join(pattern.as_str())
                        .to_string_lossy()
                        .into_owned();
                }
            }
            files.base_dir = base.to_path_buf();
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.challenge.name.trim().is_empty() {
            errors.push("Challenge 'name' must not be empty".to_string());
        }

        if let Some(preset) = &self.challenge.preset {
            if preset != "web3" {
                errors.push(format!("Unknown challenge preset '{}'", preset));
            }
        }

        if let Err(e) = self.server.bind_addr() {
            errors.push(e.to_string());
        }

        for (phase, config) in [("build", &self.build), ("run", &self.run)] {
            for (i, step) in config.steps.iter().enumerate() {
                if let Err(e) = step.validate(i) {
                    errors.push(format!("[{}] {}", phase, e));
                }
            }
        }

        for mapping in &self.mappings {
            if let Err(e) = mapping.validate() {
                errors.push(e.to_string());
            }
        }

        if let Some(files) = &self.files {
            if let Err(e) = files.validate() {
                errors.push(e.to_string());
            }
        }

        if let Some(solver) = &self.solver {
            if shell_words::split(&solver.command).map_or(true, |w| w.is_empty()) {
                errors.push("Solver 'command' must be a non-empty command line".to_string());
            }
            if solver.every_secs == Some(0) {
                errors.push("Solver 'every_secs' must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Settings for the phase controller. `flag` is the value of `FLAG`, if set.
    pub fn controller_config(&self, flag: Option<String>) -> anyhow::Result<ControllerConfig> {
        Ok(ControllerConfig {
            state_dir: self.state.dir.clone(),
            isolate_group: self.process.isolate_group,
            grace_period: self.process.shutdown_grace_period(),
            bind_addr: self.server.bind_addr()?,
            pool: self.server.pool_config(),
            flag: flag.unwrap_or_else(|| DEFAULT_FLAG.to_string()),
            filter_exe: None,
        })
    }
}
