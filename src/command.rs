//! Challenges described entirely by configuration
//!
//! Each phase initializes state from its tables and then runs its steps in
//! order. Solver, files and details come from their own sections.

use crate::challenge::{
    ChallengeDefinition, ChallengePhases, DetailsProvider, FilesProvider, Solver, SolverVerdict,
};
use crate::config::{Config, DetailsConfig, FilesConfig, PhaseConfig, SolverConfig, StepConfig};
use crate::error::GateResult;
use crate::phase::{Phase, PhaseContext};
use crate::state::ChallengeState;
use crate::template::{render, value_to_string};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Render `{key}` placeholders in `template` from challenge state
pub fn render_with_state(template: &str, state: &ChallengeState) -> String {
    render(template, |key| state.lookup(key).map(|v| value_to_string(&v)))
}

/// Build a command from a configured command line
fn command_line(line: &str, state: &ChallengeState, env: &HashMap<String, String>) -> anyhow::Result<(String, Command)> {
    let rendered = render_with_state(line, state);
    let words = shell_words::split(&rendered).with_context(|| format!("Cannot parse command '{}'", rendered))?;
    let (program, args) = words
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Command '{}' is empty", line))?;

    let mut cmd = Command::new(program);
    cmd.args(args).envs(env);
    Ok((program.clone(), cmd))
}

/// Build and run phases driven by `[build]` and `[run]`
pub struct CommandChallenge {
    build: PhaseConfig,
    run: PhaseConfig,
}

impl CommandChallenge {
    pub fn new(build: PhaseConfig, run: PhaseConfig) -> Self {
        Self { build, run }
    }

    async fn execute(&self, ctx: &PhaseContext, config: &PhaseConfig) -> anyhow::Result<()> {
        let state = ctx.state();

        // Build sets the initial contents; run adds to what was restored
        match ctx.phase() {
            Phase::Build => {
                state.private.write().initialize(config.state.clone())?;
                state.public.write().initialize(config.public_state.clone())?;
            }
            Phase::Run => {
                state.private.write().merge(config.state.clone());
                state.public.write().merge(config.public_state.clone());
            }
        }

        for (i, step) in config.steps.iter().enumerate() {
            self.step(ctx, i, step)
                .await
                .with_context(|| format!("{} step #{} failed", ctx.phase(), i + 1))?;
        }
        Ok(())
    }

    async fn step(&self, ctx: &PhaseContext, index: usize, step: &StepConfig) -> anyhow::Result<()> {
        let (program, mut cmd) = command_line(&step.command, ctx.state(), &step.env)?;
        if let Some(dir) = &step.working_dir {
            cmd.current_dir(dir);
        }
        let label = step.name.clone().unwrap_or(program);
        debug!(step = index + 1, label = %label, "Running step");

        if step.background {
            ctx.spawn_background(&label, cmd)?;
        } else {
            let stdout = ctx.run_command(&label, cmd).await?;
            if let Some(key) = &step.capture {
                let value = Value::String(stdout.trim().to_string());
                let store = if step.public {
                    &ctx.state().public
                } else {
                    &ctx.state().private
                };
                store.write().set(key.clone(), value);
                info!(step = %label, key = %key, public = step.public, "Captured step output");
            }
        }

        if let Some(port) = step.wait_for_port {
            if !ctx.wait_for_port("127.0.0.1", port, step.wait_timeout()).await {
                anyhow::bail!("'{}' did not open port {}", label, port);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChallengePhases for CommandChallenge {
    async fn build(&self, ctx: &PhaseContext) -> anyhow::Result<()> {
        self.execute(ctx, &self.build).await
    }

    async fn run(&self, ctx: &PhaseContext) -> anyhow::Result<()> {
        self.execute(ctx, &self.run).await
    }
}

/// Runs a command: exit status 0 is solved, trimmed stdout is the message
pub struct CommandSolver {
    command: String,
    env: HashMap<String, String>,
}

impl CommandSolver {
    pub fn new(config: &SolverConfig) -> Self {
        Self {
            command: config.command.clone(),
            env: config.env.clone(),
        }
    }
}

#[async_trait]
impl Solver for CommandSolver {
    async fn check(&self, state: &ChallengeState) -> anyhow::Result<SolverVerdict> {
        let (program, mut cmd) = command_line(&self.command, state, &self.env)?;
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run solver '{}'", program))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            warn!(target: crate::process::CHILD_LOG_TARGET, process = "solver", "{}", line);
        }

        if output.status.code().is_none() {
            anyhow::bail!("Solver '{}' was terminated by a signal", program);
        }

        let msg = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(SolverVerdict {
            solved: output.status.success(),
            msg: (!msg.is_empty()).then_some(msg),
        })
    }
}

/// Serves a pre-built archive from disk, or zips the configured files on request
pub struct ArchiveFiles {
    config: FilesConfig,
}

impl ArchiveFiles {
    pub fn new(config: &FilesConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl FilesProvider for ArchiveFiles {
    async fn archive(&self) -> anyhow::Result<Vec<u8>> {
        if let Some(path) = &self.config.archive {
            return tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()));
        }

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || pack_files(&config))
            .await
            .context("Archive task panicked")?
    }
}

/// Zip every file matched by `include`, then the `inline` entries
fn pack_files(config: &FilesConfig) -> anyhow::Result<Vec<u8>> {
    let mut entries = BTreeMap::new();
    for pattern in &config.include {
        let mut matched = false;
        for path in glob::glob(pattern).with_context(|| format!("Invalid include pattern '{}'", pattern))? {
            let path = path?;
            if !path.is_file() {
                continue;
            }
            matched = true;
            entries.insert(entry_name(&path, &config.base_dir), path);
        }
        if !matched {
            warn!(pattern = %pattern, "Include pattern matched no files");
        }
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, path) in &entries {
        let content = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        writer.start_file(name.as_str(), options)?;
        writer.write_all(&content)?;
    }
    for (name, content) in &config.inline {
        writer.start_file(name.trim_start_matches('/'), options)?;
        writer.write_all(content.as_bytes())?;
    }

    debug!(files = entries.len(), inline = config.inline.len(), "Packed challenge files");
    Ok(writer.finish()?.into_inner())
}

/// Archive path of `path`: relative to `base` when below it, else just the file name
fn entry_name(path: &Path, base: &Path) -> String {
    let relative = match path.strip_prefix(base) {
        Ok(relative) if !base.as_os_str().is_empty() => relative,
        _ => path.file_name().map(Path::new).unwrap_or(path),
    };
    relative.to_string_lossy().trim_start_matches('/').to_string()
}

/// Details text rendered from state
pub struct TemplateDetails {
    template: String,
}

impl TemplateDetails {
    pub fn new(config: &DetailsConfig) -> Self {
        Self {
            template: config.template.clone(),
        }
    }
}

impl DetailsProvider for TemplateDetails {
    fn details(&self, state: &ChallengeState) -> anyhow::Result<String> {
        Ok(render_with_state(&self.template, state))
    }
}

/// Assemble a validated challenge from configuration
pub fn definition_from_config(config: &Config) -> GateResult<ChallengeDefinition> {
    let mut builder = ChallengeDefinition::builder(
        config.challenge.name.clone(),
        CommandChallenge::new(config.build.clone(), config.run.clone()),
    )
    .flag_type(config.challenge.flag_type)
    .capabilities(config.challenge.capabilities())
    .mappings(config.mappings.iter().cloned());

    if let Some(solver) = &config.solver {
        builder = builder.solver(CommandSolver::new(solver));
        if let Some(secs) = solver.every_secs {
            builder = builder.solve_every(Duration::from_secs(secs));
        }
    }
    if let Some(files) = &config.files {
        builder = builder.files(ArchiveFiles::new(files));
    }
    if let Some(details) = &config.details {
        builder = builder.details(TemplateDetails::new(details));
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GateError;
    use serde_json::json;

    fn config(toml_str: &str) -> Config {
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_render_with_state_prefers_public() {
        let state = ChallengeState::new();
        state.private.write().set("rpc", "private");
        state.private.write().set("key", "0xdead");
        state.public.write().set("rpc", "http://public/");

        assert_eq!(
            render_with_state("{rpc} {key} {missing}", &state),
            "http://public/ 0xdead {missing}"
        );
    }

    #[test]
    fn test_definition_from_config() {
        let config = config(
            r#"
[challenge]
name = "Vault"
flag_type = "dynamic"
has_solver = true
has_details = true

[solver]
command = "true"
every_secs = 10

[details]
template = "Vault at {vault}"

[[mapping]]
route = "/"
port = 8545
methods = ["POST"]
"#,
        );

        let def = definition_from_config(&config).unwrap();
        assert!(def.solver().is_some());
        assert!(def.details().is_some());
        assert!(def.files().is_none());
        assert_eq!(def.solve_interval, Some(Duration::from_secs(10)));
        assert_eq!(def.mappings.len(), 1);
    }

    #[test]
    fn test_capability_without_section_is_rejected() {
        let config = config(
            r#"
[challenge]
name = "Vault"
preset = "web3"

[solver]
command = "true"
"#,
        );
        let err = definition_from_config(&config).unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
        assert!(err.to_string().contains("'files' is enabled"));
    }

    #[tokio::test]
    async fn test_command_solver_verdicts() {
        let state = ChallengeState::new();
        state.public.write().set("who", "player");

        let solved = CommandSolver::new(&SolverConfig {
            command: "echo 'well done {who}'".to_string(),
            every_secs: None,
            env: HashMap::new(),
        });
        assert_eq!(
            solved.check(&state).await.unwrap(),
            SolverVerdict::solved("well done player")
        );

        let unsolved = CommandSolver::new(&SolverConfig {
            command: "false".to_string(),
            every_secs: None,
            env: HashMap::new(),
        });
        assert_eq!(unsolved.check(&state).await.unwrap(), SolverVerdict::unsolved());

        let broken = CommandSolver::new(&SolverConfig {
            command: "/nonexistent/solver".to_string(),
            every_secs: None,
            env: HashMap::new(),
        });
        assert!(broken.check(&state).await.is_err());
    }

    fn files_config(archive: Option<std::path::PathBuf>) -> FilesConfig {
        FilesConfig {
            archive,
            include: Vec::new(),
            inline: BTreeMap::new(),
            base_dir: Default::default(),
        }
    }

    fn zip_entries(bytes: Vec<u8>) -> BTreeMap<String, String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut content = String::new();
                std::io::Read::read_to_string(&mut file, &mut content).unwrap();
                (file.name().to_string(), content)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_archive_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.zip");
        std::fs::write(&path, b"PK\x03\x04").unwrap();

        let files = ArchiveFiles::new(&files_config(Some(path)));
        assert_eq!(files.archive().await.unwrap(), b"PK\x03\x04");

        let missing = ArchiveFiles::new(&files_config(Some(dir.path().join("missing.zip"))));
        assert!(missing.archive().await.is_err());
    }

    #[tokio::test]
    async fn test_archive_packs_globs_and_inline_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("contracts/lib")).unwrap();
        std::fs::write(dir.path().join("contracts/Setup.sol"), "contract Setup {}").unwrap();
        std::fs::write(dir.path().join("contracts/Vault.sol"), "contract Vault {}").unwrap();
        std::fs::write(dir.path().join("contracts/notes.txt"), "skip me").unwrap();

        let mut config: Config = toml::from_str(
            r#"
[challenge]
name = "Packed"

[files]
include = ["contracts/*.sol", "contracts/*", "missing/*.sol"]

[files.inline]
"README.md" = "Deploy with forge"
"#,
        )
        .unwrap();
        config.resolve_paths(dir.path());
        config.validate().unwrap();

        let files = ArchiveFiles::new(config.files.as_ref().unwrap());
        let entries = zip_entries(files.archive().await.unwrap());

        assert_eq!(
            entries.keys().map(String::as_str).collect::<Vec<_>>(),
            vec![
                "README.md",
                "contracts/Setup.sol",
                "contracts/Vault.sol",
                "contracts/notes.txt"
            ]
        );
        assert_eq!(entries["contracts/Vault.sol"], "contract Vault {}");
        assert_eq!(entries["README.md"], "Deploy with forge");
    }

    #[test]
    fn test_entry_name() {
        let base = Path::new("/srv/challenge");
        assert_eq!(entry_name(Path::new("/srv/challenge/src/A.sol"), base), "src/A.sol");
        assert_eq!(entry_name(Path::new("/opt/lib/B.sol"), base), "B.sol");
        assert_eq!(entry_name(Path::new("/opt/lib/B.sol"), Path::new("")), "B.sol");
    }

    #[test]
    fn test_template_details() {
        let state = ChallengeState::new();
        state.public.write().set("chain_id", 31337);
        let details = TemplateDetails::new(&DetailsConfig {
            template: "Chain {chain_id}".to_string(),
        });
        assert_eq!(details.details(&state).unwrap(), "Chain 31337");
    }

    #[test]
    fn test_command_line_renders_and_splits() {
        let state = ChallengeState::new();
        state.private.write().set("addr", "0xabc");
        let (program, cmd) = command_line("cast call '{addr}' \"isSolved()(bool)\"", &state, &HashMap::new()).unwrap();
        assert_eq!(program, "cast");
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["call", "0xabc", "isSolved()(bool)"]);

        assert!(command_line("   ", &state, &HashMap::new()).is_err());
    }

    #[test]
    fn test_phase_state_json_values() {
        let config = config(
            r#"
[challenge]
name = "c"
flag_type = "static"

[build.state]
nested = { a = 1, b = [true, "x"] }
"#,
        );
        assert_eq!(
            config.build.state.get("nested"),
            Some(&json!({"a": 1, "b": [true, "x"]}))
        );
    }
}
