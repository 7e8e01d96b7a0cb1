//! pfdeploy - Entry Point
//!
//! Watches a deployments root and runs every `d_{tenant}_dataset{id}`
//! repository as a container behind the shared Nginx proxy.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info};

use pfdeploy::app::options::AppOptions;
use pfdeploy::app::run::run;
use pfdeploy::deploy::cleanup::CleanupOutcome;
use pfdeploy::deploy::docker::DockerCli;
use pfdeploy::deploy::orchestrator::{DeployOutcome, DeployRequest, Deployer};
use pfdeploy::deploy::proxy::NginxProxy;
use pfdeploy::filesys::file::File;
use pfdeploy::logs::{init_logging, LogLevel, LogOptions};
use pfdeploy::storage::settings::Settings;
use pfdeploy::utils::version_info;
use pfdeploy::watch::source::NotifySource;

const DEFAULT_CONFIG: &str = "/etc/pfdeploy/settings.json";

/// Repository watcher and container deployer
#[derive(Parser, Debug)]
#[command(name = "pfdeploy", version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, env = "PFDEPLOY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the deployments root and deploy continuously
    Watch,
    /// Deploy one repository directory
    Deploy {
        repo: PathBuf,
        /// Rebuild even if the container is already running
        #[arg(long)]
        force: bool,
    },
    /// Tear down the deployment of a directory name
    Cleanup { name: String },
    /// Print the site file that would be generated for a repository
    Render { repo: PathBuf },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        return match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                ExitCode::FAILURE
            }
        };
    }

    // Retrieve the settings file
    let explicit = cli.config.is_some();
    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let settings = match Settings::load(&File::new(&settings_path), explicit).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::from(2);
        }
    };
    let options = match settings.to_app_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::from(2);
        }
    };

    // Initialize logging
    let mut log_options = settings.log_options();
    if let Some(level) = cli.log_level {
        log_options.log_level = level;
    }
    if let Command::Render { .. } = cli.command {
        // stdout carries the rendered file
        log_options.stdout = false;
    }
    let _log_guard = init_logs(log_options);

    let result = match cli.command {
        Command::Watch => watch(options).await,
        Command::Deploy { repo, force } => deploy(&options, repo, force).await,
        Command::Cleanup { name } => cleanup(&options, &name).await,
        Command::Render { repo } => render(&options, &repo).await,
        Command::Version => Ok(ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_logs(options: LogOptions) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    match init_logging(options.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize file logging: {e}");
            init_logging(LogOptions {
                log_dir: None,
                ..options
            })
            .ok()
            .flatten()
        }
    }
}

/// The docker CLI runtime and the Nginx proxy it fronts.
fn backends(options: &AppOptions) -> (Arc<DockerCli>, Arc<NginxProxy>) {
    let runtime = Arc::new(DockerCli::new(options.docker_binary.clone()));
    let proxy = Arc::new(NginxProxy::new(
        options.proxy_mode.clone(),
        options.docker_binary.clone(),
    ));
    (runtime, proxy)
}

fn deployer(options: &AppOptions) -> Deployer {
    let (runtime, proxy) = backends(options);
    Deployer::new(runtime, proxy, options.deploy.clone())
}

async fn watch(options: AppOptions) -> anyhow::Result<ExitCode> {
    let version = version_info();
    info!(
        "Running pfdeploy {} ({}) with options: {:?}",
        version.version, version.git_hash, options
    );

    let (runtime, proxy) = backends(&options);
    run(
        options,
        Arc::new(NotifySource),
        runtime,
        proxy,
        await_shutdown_signal(),
    )
    .await
    .context("watcher stopped with an error")?;

    Ok(ExitCode::SUCCESS)
}

async fn deploy(options: &AppOptions, repo: PathBuf, force: bool) -> anyhow::Result<ExitCode> {
    let request = DeployRequest {
        repo_path: repo,
        force,
    };
    let outcome = deployer(options)
        .deploy(&request)
        .await
        .with_context(|| format!("deploy of {} failed", request.repo_path.display()))?;

    match outcome {
        DeployOutcome::Deployed(unit) => {
            println!(
                "{} {} is live at {} (port {})",
                "deployed:".green().bold(),
                unit.container_name,
                unit.subdomain,
                unit.internal_port
            );
        }
        DeployOutcome::Skipped(reason) => {
            println!("{} {:?}", "skipped:".yellow().bold(), reason);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cleanup(options: &AppOptions, name: &str) -> anyhow::Result<ExitCode> {
    let outcome = deployer(options)
        .cleanup(name)
        .await
        .with_context(|| format!("cleanup of {} failed", name))?;

    match outcome {
        CleanupOutcome::Removed {
            container_removed,
            site_removed,
        } => println!(
            "{} {} (container: {}, site file: {})",
            "removed:".green().bold(),
            name,
            container_removed,
            site_removed
        ),
        CleanupOutcome::Skipped { reason } => {
            println!("{} {}", "skipped:".yellow().bold(), reason)
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn render(options: &AppOptions, repo: &Path) -> anyhow::Result<ExitCode> {
    let rendered = deployer(options)
        .render_for_repo(repo)
        .await
        .with_context(|| format!("cannot render site file for {}", repo.display()))?;
    print!("{}", rendered);
    Ok(ExitCode::SUCCESS)
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
