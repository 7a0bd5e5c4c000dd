// Operator tooling for the instance engine: settings inspection and
// scripted runs against the in-memory backend.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use jarcore::instance::store::InstanceMap;
use jarcore::{
    EngineSettings, Instance, InstallOutcome, InstallState, InstanceEngine, InstanceStatus,
    InstanceType, LoopbackBackend, ModpackInstallRequest, ModpackSource,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jarctl")]
#[command(about = "JarLauncher instance engine tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the settings file path and effective values
    Config {
        /// Write the effective values back to the file
        #[arg(long)]
        write: bool,
    },

    /// Drive the engine against the in-memory backend
    Demo {
        #[command(subcommand)]
        scenario: Scenario,
    },
}

#[derive(Subcommand)]
enum Scenario {
    /// Start and stop a client and a server
    Lifecycle,

    /// Install a modpack whose loader finishes before its downloads
    Install {
        /// Name of the new instance
        #[arg(short, long, default_value = "Fabulously Optimized")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let path = cli.settings.unwrap_or_else(EngineSettings::default_path);
    let settings = EngineSettings::load_from(&path)?;

    match cli.command {
        Commands::Config { write } => show_config(&path, &settings, write)?,
        Commands::Demo { scenario } => match scenario {
            Scenario::Lifecycle => demo_lifecycle(settings).await?,
            Scenario::Install { name } => demo_install(settings, name).await?,
        },
    }

    Ok(())
}

fn show_config(path: &std::path::Path, settings: &EngineSettings, write: bool) -> Result<()> {
    println!("Settings file: {}", path.display());
    if !path.exists() {
        println!("  (not present, using defaults)");
    }
    println!("  sweep interval:   {:?}", settings.sweep_interval);
    println!("  restart delay:    {:?}", settings.restart_delay);
    println!("  close delay:      {:?}", settings.close_delay);
    println!("  download grace:   {:?}", settings.download_grace);
    match settings.resync_interval {
        Some(interval) => println!("  resync interval:  {interval:?}"),
        None => println!("  resync interval:  disabled"),
    }
    if write {
        settings.save_to(path)?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

fn engine_for(backend: &LoopbackBackend, settings: EngineSettings) -> Result<InstanceEngine> {
    let engine = InstanceEngine::new(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        settings,
    );
    engine.init()?;
    Ok(engine)
}

async fn demo_lifecycle(settings: EngineSettings) -> Result<()> {
    let mut client = Instance::new(
        "vanilla",
        "Vanilla 1.21",
        InstanceType::Client,
        InstanceStatus::Stopped,
    );
    client.version = Some("1.21.1".to_string());
    let mut server = Instance::new(
        "smp",
        "Friends SMP",
        InstanceType::Server,
        InstanceStatus::Stopped,
    );
    server.loader = Some("paper".to_string());

    let backend = LoopbackBackend::with_instances([client, server]);
    backend.set_auto_events(true);
    backend.set_step_delay(Duration::from_millis(400));

    let engine = engine_for(&backend, settings)?;
    let watcher = tokio::spawn(log_status_changes(engine.subscribe_instances()));
    engine.load().await?;

    for id in ["vanilla", "smp"] {
        let dispatch = engine.start_instance(id).await?;
        tracing::info!("start {id}: {dispatch:?}");
    }
    // Second click while the first is still in flight
    let dispatch = engine.start_instance("vanilla").await?;
    tracing::info!("start vanilla again: {dispatch:?}");

    for id in ["vanilla", "smp"] {
        wait_for_status(&engine, id, InstanceStatus::Running).await?;
    }
    for id in ["vanilla", "smp"] {
        let dispatch = engine.stop_instance(id).await?;
        tracing::info!("stop {id}: {dispatch:?}");
    }
    for id in ["vanilla", "smp"] {
        wait_for_status(&engine, id, InstanceStatus::Stopped).await?;
    }

    println!("Backend calls: {}", backend.calls().join(", "));
    watcher.abort();
    engine.dispose();
    Ok(())
}

async fn demo_install(settings: EngineSettings, name: String) -> Result<()> {
    let backend = LoopbackBackend::new();
    backend.set_auto_events(true);
    backend.set_step_delay(Duration::from_millis(300));

    let engine = engine_for(&backend, settings)?;
    let printer = tokio::spawn(print_install_progress(engine.subscribe_install()));

    let request = ModpackInstallRequest {
        source: ModpackSource::Modrinth {
            slug: "fabulously-optimized".to_string(),
            version_id: None,
        },
        instance_name: name,
    };
    let outcome = engine.install_modpack(&request).await?;
    printer.abort();

    match outcome {
        InstallOutcome::Completed { instance_id } => {
            println!("Installed {instance_id}");
            if let Some(instance) = engine.instance(&instance_id) {
                println!("{}", serde_json::to_string_pretty(&instance)?);
            }
        }
        InstallOutcome::Cancelled => println!("Install cancelled"),
        InstallOutcome::Failed(message) => println!("Install failed: {message}"),
    }
    engine.dispose();
    Ok(())
}

async fn wait_for_status(engine: &InstanceEngine, id: &str, status: InstanceStatus) -> Result<()> {
    let mut rx = engine.subscribe_instances();
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        rx.wait_for(|map| map.get(id).is_some_and(|i| i.status == status))
            .await
            .is_ok()
    })
    .await;
    match reached {
        Ok(true) => Ok(()),
        _ => bail!("{id} did not reach {status} in time"),
    }
}

async fn log_status_changes(mut rx: watch::Receiver<InstanceMap>) {
    let mut last: BTreeMap<String, InstanceStatus> = BTreeMap::new();
    while rx.changed().await.is_ok() {
        let current: BTreeMap<String, InstanceStatus> = rx
            .borrow_and_update()
            .iter()
            .map(|(id, inst)| (id.clone(), inst.status))
            .collect();
        for (id, status) in &current {
            if last.get(id) != Some(status) {
                tracing::info!("{id} -> {status}");
            }
        }
        for id in last.keys().filter(|id| !current.contains_key(*id)) {
            tracing::info!("{id} removed");
        }
        last = current;
    }
}

async fn print_install_progress(mut rx: watch::Receiver<InstallState>) {
    let mut last_line = None;
    while rx.changed().await.is_ok() {
        let (line, rows) = {
            let state = rx.borrow_and_update();
            let line = state.progress_text().map(|text| match state.progress_percent() {
                Some(pct) => format!("[{pct:>3}%] {text}"),
                None => format!("[ .. ] {text}"),
            });
            let rows: Vec<String> = state.downloads().map(|d| d.summary_line()).collect();
            (line, rows)
        };
        if line != last_line {
            if let Some(line) = &line {
                println!("{line}");
            }
            last_line = line;
        }
        for row in rows {
            tracing::debug!("download: {row}");
        }
    }
}
