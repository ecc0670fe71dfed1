//! Deploy command: `rollout deploy`.

use anyhow::{Context, Result};
use rollout::config::Config;
use rollout::dag::{DeployExecutor, RunEvent, ServiceRunState};
use rollout::platform::{LocalPlatform, LocalPlatformConfig};
use rollout::release::{ReleaseCoordinator, ReleaseReport};
use rollout::runner::ShellRunner;
use rollout::store::JsonFileStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::super::ChangeArgs;
use super::{changeset_from_args, load_project_manifest};

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    pub max_parallel: Option<usize>,
    pub run_timeout_secs: Option<u64>,
    pub json: bool,
    pub no_wait: bool,
}

/// Returns whether the release succeeded.
pub async fn cmd_deploy(
    project_dir: PathBuf,
    manifest_path: &Path,
    changes: &ChangeArgs,
    options: DeployOptions,
) -> Result<bool> {
    let config = Config::with_cli_args(project_dir, options.max_parallel, options.run_timeout_secs)?;
    for warning in config.toml.validate() {
        tracing::warn!("{}", warning);
    }
    config.ensure_directories()?;

    let manifest = load_project_manifest(&config.project_dir, manifest_path)?;
    let changeset = changeset_from_args(&config.project_dir, changes)?;

    let platform_section = &config.toml.platform;
    let platform = Arc::new(LocalPlatform::new(LocalPlatformConfig {
        host: platform_section.host.clone(),
        base_port: platform_section.base_port,
        startup_grace: Duration::from_millis(platform_section.startup_grace_ms),
        log_dir: Some(config.log_dir()),
        ..LocalPlatformConfig::default()
    }));
    let store = Arc::new(JsonFileStore::new(config.state_file()));
    let coordinator = Arc::new(ReleaseCoordinator::new(platform.clone(), store));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let executor = DeployExecutor::new(
        config.project_dir.clone(),
        config.engine_config(),
        Arc::new(ShellRunner::new()),
        coordinator,
    )
    .with_event_channel(tx);

    let show_progress = !options.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if show_progress {
                print_event(&event);
            }
        }
    });

    let report = executor.deploy(&manifest, changeset.as_ref()).await;
    drop(executor);
    printer.await.context("Progress printer panicked")?;
    let report = report?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let running = platform.running_services().await;
    if report.succeeded() && !running.is_empty() && !options.no_wait {
        if !options.json {
            println!(
                "Serving {} ({}). Press Ctrl-C to stop.",
                running.join(", "),
                console::style(format!("logs in {}", config.log_dir().display())).dim()
            );
        }
        tokio::select! {
            _ = platform.wait_all() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping services");
            }
        }
    }

    Ok(report.succeeded())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted {
            services, affected, ..
        } => {
            println!(
                "{} {} services, {} affected",
                console::style("Deploying").bold().cyan(),
                services,
                affected.len()
            );
        }
        RunEvent::ServiceBlocked {
            service,
            waiting_on,
        } => {
            println!(
                "  {} {} waiting on {}",
                console::style("…").dim(),
                service,
                waiting_on.join(", ")
            );
        }
        RunEvent::BuildStarted { service, attempt } => {
            if *attempt == 1 {
                println!("  {} {}", console::style("▶").cyan(), service);
            }
        }
        RunEvent::BuildRetry {
            service,
            attempt,
            delay_ms,
            reason,
        } => {
            println!(
                "  {} {} attempt {} failed, retrying in {}ms: {}",
                console::style("⚠").yellow(),
                service,
                attempt,
                delay_ms,
                reason
            );
        }
        RunEvent::Deploying { service } => {
            println!("  {} {} deploying", console::style("↑").cyan(), service);
        }
        RunEvent::ServiceLive { service, url } => {
            println!("  {} {} live at {}", console::style("✓").green(), service, url);
        }
        RunEvent::ServiceReused { service, url } => {
            println!(
                "  {} {} unchanged at {}",
                console::style("=").dim(),
                service,
                url
            );
        }
        RunEvent::ServiceFailed { service, failure } => {
            println!(
                "  {} {} {}",
                console::style("✗").red(),
                service,
                failure.message
            );
        }
        RunEvent::RunCompleted { .. } => {}
    }
}

fn print_report(report: &ReleaseReport) {
    println!();
    println!(
        "{:<24} {:<12} {:<8} {:>8}  {}",
        "SERVICE", "STATE", "ATTEMPTS", "TIME", "ADDRESS"
    );
    for service in &report.services {
        let state = match service.state {
            ServiceRunState::Live if service.reused => "reused".to_string(),
            state => state.to_string(),
        };
        let detail = match (&service.address, &service.failure) {
            (Some(address), _) => address.url.clone(),
            (None, Some(failure)) => failure.message.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{:<24} {:<12} {:<8} {:>7.1}s  {}",
            service.name,
            state,
            service.attempts,
            service.duration.as_secs_f64(),
            detail
        );
    }
    println!();

    let summary = format!(
        "{}: {} live ({} reused), {} failed in {:.1}s",
        report.outcome,
        report.count(ServiceRunState::Live),
        report.reused_count(),
        report.services.len() - report.count(ServiceRunState::Live),
        report.duration.as_secs_f64()
    );
    if report.succeeded() {
        println!("{}", console::style(summary).green().bold());
    } else {
        println!("{}", console::style(summary).red().bold());
        if !report.root_causes.is_empty() {
            println!("Root cause: {}", report.root_causes.join(", "));
        }
        if let Some(error) = &report.error {
            println!("{}", error);
        }
    }
}
