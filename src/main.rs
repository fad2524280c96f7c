//! Interop test driver
//!
//! Resolves layered flagfiles into one effective configuration, provisions
//! the uniquely named per-run resources an interop test needs, runs the test
//! binary against them and tears everything down again on every exit path.
//!
//! ## Usage
//!
//! ```bash
//! # Show what a flagfile chain resolves to
//! interop-driver --flagfile config/local-dev.cfg resolve --format yaml
//!
//! # Names a run would use
//! interop-driver -f config/local-dev.cfg --set resource_suffix=dev name
//!
//! # Provision, test, tear down
//! interop-driver -f config/local-dev.cfg run -- --test_case=ping_pong
//!
//! # Remove what a crashed pinned run left behind
//! interop-driver -f config/local-dev.cfg cleanup --suffix dev
//! ```

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod cli;
mod config;
mod error;
mod executor;
mod k8s;
mod naming;
mod orchestrator;
mod portforward;
mod utils;

use cli::{Args, CleanupArgs, NameArgs, OutputFormat, ResolveArgs, RunArgs};
use config::{
    ConfigError, ConfigResolver, ConfigSource, DriverSettings, EffectiveConfig, EnvLayer,
    FlagRegistry, SourceOrigin, TestMode,
};
use error::DriverError;
use executor::TestRunner;
use k8s::K8sClient;
use naming::{ResourceNamer, SuffixPolicy};
use orchestrator::{
    firewall_rule_name, frontend_service_name, CloudBackend, OrchestratorOptions, ProvisionPlan,
    ResourceError, ResourceLifecycleOrchestrator, Role,
};
use portforward::{KubectlLauncher, PortForwardManager};
use utils::{init_logger, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        args.log_level.parse().unwrap_or(LogLevel::Info)
    };
    init_logger(level);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match dispatch(&args, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", error_chain(&e));
            ExitCode::from(&e)
        }
    }
}

async fn dispatch(args: &Args, cancel: &CancellationToken) -> Result<(), DriverError> {
    match &args.command {
        cli::Command::Resolve(resolve_args) => show_config(args, resolve_args),
        cli::Command::Name(name_args) => show_names(args, name_args),
        cli::Command::Run(run_args) => run(args, run_args, cancel).await,
        cli::Command::Cleanup(cleanup_args) => cleanup(args, cleanup_args).await,
    }
}

/// Cancel the run on SIGINT, SIGTERM or SIGHUP
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, stopping"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let other = async {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match (unix_signal(SignalKind::terminate()), unix_signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => {
                tokio::select! {
                    _ = term.recv() => info!("Received SIGTERM, stopping"),
                    _ = hup.recv() => info!("Received SIGHUP, stopping"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to listen for SIGTERM/SIGHUP: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let other = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = other => {}
    }
    cancel.cancel();
}

fn resolve_config(args: &Args) -> Result<EffectiveConfig, ConfigError> {
    let mut resolver = ConfigResolver::new(FlagRegistry::driver());

    if !args.no_env {
        let env = EnvLayer::load();
        if !env.is_empty() {
            info!(
                "Applying INTEROP_DRIVER_* override(s): {}",
                env.keys().collect::<Vec<_>>().join(", ")
            );
            resolver = resolver.with_override(env.into_source()?);
        }
    }
    if !args.overrides.is_empty() {
        let source = ConfigSource::from_pairs(SourceOrigin::CommandLine, args.overrides.iter().cloned())?;
        resolver = resolver.with_override(source);
    }

    resolver.resolve(args.flagfile.as_deref())
}

fn show_config(args: &Args, resolve_args: &ResolveArgs) -> Result<(), DriverError> {
    let config = resolve_config(args)?;

    if resolve_args.explain {
        for line in config.explain(&FlagRegistry::driver()) {
            println!("{line}");
        }
        return Ok(());
    }

    match resolve_args.format {
        OutputFormat::Flags => {
            for flag in config.to_flag_args() {
                println!("{flag}");
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config.flat()).map_err(anyhow::Error::from)?;
            println!("{json}");
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(&config.flat()).map_err(anyhow::Error::from)?;
            print!("{yaml}");
        }
    }
    Ok(())
}

fn show_names(args: &Args, name_args: &NameArgs) -> Result<(), DriverError> {
    let config = resolve_config(args)?;
    let settings = DriverSettings::from_config(&config)?;
    let namer = ResourceNamer::new(&settings.name_template())?;

    if let Some(component) = &name_args.component {
        println!("{}", namer.checked_name(component)?);
        return Ok(());
    }

    println!("suffix:            {}", namer.suffix());
    println!("server namespace:  {}", Role::Server.namespace(&namer));
    println!("client namespace:  {}", Role::Client.namespace(&namer));
    if settings.ensure_firewall {
        println!("firewall rule:     {}", firewall_rule_name(&namer));
    }
    if settings.mode == TestMode::Gamma {
        println!("frontend service:  {}", frontend_service_name(&namer));
    }
    Ok(())
}

fn orchestrator_for(settings: &DriverSettings, k8s: K8sClient) -> ResourceLifecycleOrchestrator {
    ResourceLifecycleOrchestrator::new(
        Arc::new(CloudBackend::new(k8s)),
        PortForwardManager::new(KubectlLauncher::default())
            .with_startup_timeout(settings.port_forward_timeout),
    )
    .with_options(OrchestratorOptions::from_settings(settings))
}

async fn run(args: &Args, run_args: &RunArgs, cancel: &CancellationToken) -> Result<(), DriverError> {
    let config = resolve_config(args)?;
    let settings = DriverSettings::from_config(&config)?;
    let namer = ResourceNamer::new(&settings.name_template())?;
    let plan = ProvisionPlan::from_settings(&settings, &namer);

    let runner = if run_args.skip_tests {
        None
    } else {
        let binary = settings
            .test_binary
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired("test_binary".to_string()))?;
        Some(TestRunner::new(binary))
    };

    info!(
        "Run {} ({} mode, {} resource(s), suffix {})",
        namer.base_name(),
        settings.mode,
        plan.len(),
        if namer.is_pinned() { "pinned" } else { "generated" }
    );

    let k8s = K8sClient::new(settings.kube_context.as_deref()).await?;
    let mut orchestrator = orchestrator_for(&settings, k8s);

    let result = provision_and_test(
        &mut orchestrator,
        &plan,
        runner.as_ref(),
        &TestRunner::build_args(&config, &settings, &namer, &run_args.extra),
        cancel,
    )
    .await;

    // Runs on success, failure and cancellation alike
    let teardown = orchestrator.shutdown().await.into_result();

    match (result, teardown) {
        (Ok(()), Ok(_)) => {
            info!("Run {} finished cleanly", namer.base_name());
            Ok(())
        }
        (Ok(()), Err(e)) => Err(e.into()),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(teardown)) => {
            error!("{}", teardown);
            Err(e)
        }
    }
}

async fn provision_and_test(
    orchestrator: &mut ResourceLifecycleOrchestrator,
    plan: &ProvisionPlan,
    runner: Option<&TestRunner>,
    test_args: &[String],
    cancel: &CancellationToken,
) -> Result<(), DriverError> {
    let outcome = orchestrator.provision(plan, cancel).await?;
    let adopted = outcome.present().iter().filter(|h| h.is_adopted()).count();
    if outcome.is_complete() {
        info!("All {} resource(s) present, {} reused", outcome.present().len(), adopted);
    } else {
        info!("{} resource(s) present, {} reused", outcome.present().len(), adopted);
        for handle in outcome.failed() {
            debug!(
                "{} {} not created: {}",
                handle.kind(),
                handle.name(),
                handle.last_error().unwrap_or("unknown error")
            );
        }
    }
    if outcome.rolled_back() {
        warn!("Rolled back after {} failed resource(s)", outcome.failed().len());
    }
    let tunnels = orchestrator.tunnels();
    if !tunnels.is_empty() {
        info!("{} port-forward(s) open", tunnels.len());
        for tunnel in tunnels.iter() {
            info!("Forwarding {} (pid {:?})", tunnel.spec(), tunnel.pid());
        }
    }

    let mut fatal = None;
    for failure in outcome.into_failures() {
        match failure {
            // Tunnels are debugging aids; cloud resources stay up
            ResourceError::Tunnel { .. } => warn!("{}", error_chain(&failure)),
            other if fatal.is_none() => fatal = Some(other),
            other => error!("{}", other),
        }
    }
    if let Some(err) = fatal {
        return Err(DriverError::Provision(err));
    }

    let Some(runner) = runner else {
        info!("Skipping test execution");
        return Ok(());
    };

    let outcome = runner.run(test_args, cancel).await?;
    for dead in orchestrator.check_tunnels() {
        warn!("{}", dead);
    }

    if outcome.passed() {
        Ok(())
    } else {
        Err(DriverError::TestFailed {
            exit_code: outcome.exit_code,
        })
    }
}

async fn cleanup(args: &Args, cleanup_args: &CleanupArgs) -> Result<(), DriverError> {
    let config = resolve_config(args)?;
    let mut settings = DriverSettings::from_config(&config)?;
    if let Some(suffix) = &cleanup_args.suffix {
        settings.resource_suffix = SuffixPolicy::Fixed(suffix.clone());
    }
    if !settings.resource_suffix.is_pinned() {
        return Err(ConfigError::MissingRequired("resource_suffix".to_string()).into());
    }

    let namer = ResourceNamer::new(&settings.name_template())?;
    let plan = ProvisionPlan::from_settings(&settings, &namer);

    let k8s = K8sClient::new(settings.kube_context.as_deref()).await?;
    info!(
        "Sweeping resources of {} (context {})",
        namer.base_name(),
        k8s.context().unwrap_or("default")
    );
    let mut orchestrator = orchestrator_for(&settings, k8s);
    let recovered = orchestrator.recover(&plan);

    let report = orchestrator.teardown().await.into_result()?;
    info!("Cleanup done: {}/{} resource(s) deleted", report.deleted.len(), recovered);
    Ok(())
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    message
}
