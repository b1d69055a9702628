use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use netquality::agent::{feed, Agent};
use netquality::config::Config;

/// Network-quality sample ingestion service.
#[derive(Parser)]
#[command(name = "netquality", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the config file's `log_level`.
    #[arg(long)]
    log_level: Option<String>,

    /// Read NDJSON samples from stdin until EOF, then shut down.
    #[arg(long)]
    stdin: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Validate the configuration file and exit.
    CheckConfig,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("netquality {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .as_deref()
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(config_path)?;

    let level = log_level(cli.log_level.as_deref(), &cfg);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(Command::CheckConfig) = &cli.command {
        println!("{}: ok", config_path.display());
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting netquality",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, cli.stdin))
}

/// The command-line level wins over the config file's.
fn log_level<'a>(cli: Option<&'a str>, cfg: &'a Config) -> &'a str {
    cli.unwrap_or(&cfg.log_level)
}

async fn run(cfg: Config, read_stdin: bool) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    if read_stdin {
        let pipeline = agent.pipeline().context("pipeline missing after start")?;
        let reader = BufReader::new(tokio::io::stdin());
        match feed::run_ndjson(reader, pipeline, shutdown.clone()).await {
            Ok(summary) => tracing::info!(
                ingested = summary.ingested,
                malformed = summary.malformed,
                rejected = summary.rejected,
                "stdin feed finished",
            ),
            Err(e) => tracing::error!(error = ?e, "stdin feed failed"),
        }
    } else {
        shutdown.cancelled().await;
    }

    agent.stop().await?;

    tracing::info!("netquality stopped");

    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        shutdown.cancel();
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_falls_back_to_config() {
        let cfg = Config {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        assert_eq!(log_level(None, &cfg), "debug");
        assert_eq!(log_level(Some("warn"), &cfg), "warn");
    }
}
