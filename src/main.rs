use ctfgate::command::definition_from_config;
use ctfgate::config::{Config, DEFAULT_CONFIG_PATH};
use ctfgate::filter::BuiltinFilter;
use ctfgate::phase::PhaseController;
use ctfgate::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, PartialEq)]
enum Command {
    Build(PathBuf),
    Run(PathBuf),
    Check(PathBuf),
    Filter(String),
    Help,
    Version,
}

#[derive(Debug, PartialEq)]
struct Invocation {
    command: Command,
    verbosity: u8,
}

fn parse_args(args: &[String]) -> anyhow::Result<Invocation> {
    let mut verbosity = 0u8;
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut positional = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--verbose" => verbosity = verbosity.saturating_add(1),
            "-vv" => verbosity = verbosity.saturating_add(2),
            "-f" | "--file" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("{} needs a path", arg))?;
                config_path = PathBuf::from(path);
            }
            "-h" | "--help" => positional.insert(0, "help".to_string()),
            "-V" | "--version" => positional.insert(0, "version".to_string()),
            other if other.starts_with('-') => anyhow::bail!("Unknown option '{}'", other),
            other => positional.push(other.to_string()),
        }
    }

    let command = match positional.first().map(String::as_str) {
        None | Some("help") => Command::Help,
        Some("version") => Command::Version,
        Some("build") => Command::Build(config_path),
        Some("run") => Command::Run(config_path),
        Some("check") => Command::Check(config_path),
        Some("filter") => {
            let name = positional
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("'filter' needs a filter name"))?;
            Command::Filter(name.clone())
        }
        Some(other) => anyhow::bail!("Unknown command '{}'", other),
    };

    Ok(Invocation { command, verbosity })
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Flip `shutdown_tx` on SIGINT or SIGTERM
fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        }

        let _ = shutdown_tx.send(true);
    });
}

fn load(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), challenge = %config.challenge.name, "Configuration loaded");
    Ok(config)
}

fn controller(config: &Config) -> anyhow::Result<PhaseController> {
    let definition = definition_from_config(config)?;
    let settings = config.controller_config(std::env::var("FLAG").ok())?;
    Ok(PhaseController::new(definition, settings))
}

fn print_help() {
    println!(
        r#"
{name} - challenge instance scaffold

USAGE:
    {name} <command> [options]

COMMANDS:
    build                    Run the build phase once and persist state
    run                      Restore state, start the challenge and serve it
    check                    Validate the configuration and exit
    filter <name>            Run a builtin filter (jsonrpc-whitelist, jsonrpc-blacklist)

OPTIONS:
    -f, --file <path>        Challenge configuration (default: {config})
    -v, --verbose            Log at info level, twice for debug
    -h, --help               Show this help
    -V, --version            Show version

ENVIRONMENT:
    PORT                     Public port, overrides server.port
    FLAG                     Flag revealed by /solved for dynamic challenges
    RUST_LOG                 Log filter, overrides -v
"#,
        name = PKG_NAME,
        config = DEFAULT_CONFIG_PATH
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!("Run '{} --help' for usage", PKG_NAME);
        e
    })?;

    init_logging(invocation.verbosity);

    match invocation.command {
        Command::Help => print_help(),
        Command::Version => println!("{} {}", PKG_NAME, VERSION),
        Command::Check(path) => {
            let config = load(&path)?;
            definition_from_config(&config)?;
            println!("{}: ok", path.display());
        }
        Command::Build(path) => {
            let config = load(&path)?;
            let mut controller = controller(&config)?;
            controller.build().await?;
        }
        Command::Run(path) => {
            let config = load(&path)?;
            let mut controller = controller(&config)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            spawn_signal_listener(shutdown_tx);
            controller.run(shutdown_rx).await?;
        }
        Command::Filter(name) => {
            let builtin = BuiltinFilter::from_name(&name)
                .ok_or_else(|| anyhow::anyhow!("Unknown builtin filter '{}'", name))?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            spawn_signal_listener(shutdown_tx);
            ctfgate::filters::run_builtin(builtin, shutdown_rx).await?;
        }
    }

    Ok(())
}
