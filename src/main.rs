mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

use sidecar::client::BackendClient;
use sidecar::{Config, HealthProber, InterpreterResolver, LogSink, Settings, Supervisor};

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: cli::Cli) -> Result<ExitCode> {
    let cfg = Config::load();
    let settings = settings_from(&cfg, &args);
    log::debug!("config file: {}", cfg.config_path.display());

    match args.command {
        cli::Command::Check => {
            let prober = HealthProber::new(settings.health_url(), settings.probe_timeout);
            match prober.diagnose().await {
                Ok(report) => {
                    match report.version {
                        Some(v) => println!("{} ({}, version {})", "healthy".green(), prober.url(), v),
                        None => println!("{} ({})", "healthy".green(), prober.url()),
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("{}: {} ({})", "unhealthy".red(), e, prober.url());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        cli::Command::Resolve => {
            let resolver = InterpreterResolver::new(
                settings.interpreter.as_deref(),
                settings.version_check_timeout,
            );
            println!("{}", resolver.resolve().await);
            Ok(ExitCode::SUCCESS)
        }
        cli::Command::Call { ref path } => {
            let supervisor = Arc::new(Supervisor::new(settings.clone(), sink_for(&settings, false)?));
            let client = BackendClient::new(Arc::clone(&supervisor), Duration::from_secs(60))?;
            let result = client.get_json(path).await;
            supervisor.stop().await;
            let value = result?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        cli::Command::Run { interval } => {
            let echo = std::io::stderr().is_terminal();
            let supervisor = Supervisor::new(settings.clone(), sink_for(&settings, echo)?);

            if let Err(e) = supervisor.start().await {
                eprintln!("{} {}", "error:".red(), e.user_message());
            }

            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(settings.watchdog_interval);
            supervisor
                .watchdog(interval, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await;

            supervisor.sink().note("Shutting down");
            supervisor.stop().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn settings_from(cfg: &Config, args: &cli::Cli) -> Settings {
    let mut cfg = cfg.clone();
    if let Some(script) = &args.script {
        cfg.set("SIDECAR_SERVER_SCRIPT", script.to_string_lossy());
    }
    if let Some(interpreter) = &args.interpreter {
        cfg.set("SIDECAR_INTERPRETER", interpreter.as_str());
    }
    if let Some(url) = &args.url {
        cfg.set("SIDECAR_SERVER_URL", url.as_str());
    }
    if let Some(ms) = args.startup_timeout {
        cfg.set("SIDECAR_STARTUP_TIMEOUT_MS", ms.to_string());
    }
    if let Some(path) = &args.log_file {
        cfg.set("SIDECAR_LOG_FILE", path.to_string_lossy());
    }
    Settings::from_config(&cfg)
}

fn sink_for(settings: &Settings, echo: bool) -> Result<LogSink> {
    let sink = LogSink::new(settings.log_buffer_lines).with_echo(echo);
    match &settings.log_file {
        Some(path) => sink
            .with_file(path)
            .with_context(|| format!("cannot log server output to {}", path.display())),
        None => Ok(sink),
    }
}
