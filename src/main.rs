use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use mediahost::bus::{Event, EventBus, TaskEvent};
use mediahost::dlna::{Device, DeviceEvent, DeviceRegistry, SoapTransport};
use mediahost::tasks::{TaskManager, TaskOptions, TaskStore};
use mediahost::{config, tasks};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mediahost", version, about = "mediahost task and renderer engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    List,
    /// Run one task now and wait for it to finish
    Run {
        key: String,
    },
    /// Show the trigger configuration of a task
    Triggers {
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Tasks { command } => handle_tasks(command).await,
    }
}

fn build_manager(cfg: &config::AppConfig, bus: EventBus) -> TaskManager {
    let store = TaskStore::new(cfg.data_dir.clone());
    let manager = TaskManager::new(store, bus, cfg.worker_settings());
    manager.add_tasks(tasks::builtin::default_tasks(cfg));
    manager
}

async fn run() -> Result<()> {
    let cfg = config::AppConfig::load()?;
    let bus = EventBus::new();
    let mut events = bus.subscribe();

    let manager = build_manager(&cfg, bus.clone());
    manager.start();

    let registry = DeviceRegistry::new();
    for props in &cfg.dlna.devices {
        match SoapTransport::new(&props.base_url, cfg.request_timeout()) {
            Ok(transport) => {
                registry.add(Device::new(
                    props.clone(),
                    Arc::new(transport),
                    bus.clone(),
                    cfg.device_settings(),
                ));
            }
            Err(e) => error!("Skipping device {}: {:#}", props.name, e),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(Event::Device(DeviceEvent::Unavailable { device })) => {
                    info!("Device {} went away", device);
                    registry.prune_unavailable();
                }
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Event log skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    manager.shutdown().await;
    registry.shutdown().await;
    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::Task(TaskEvent::Completed(result)) => {
            if let Some(message) = &result.error_message {
                warn!("{} finished {:?}: {}", result.name, result.status, message);
            }
        }
        Event::Task(_) => {}
        Event::Device(DeviceEvent::PlaybackStart { device, media }) => {
            info!("{} started {}", device, media.title.as_deref().unwrap_or(&media.uri));
        }
        Event::Device(DeviceEvent::MediaChanged { device, new, .. }) => {
            info!("{} switched to {}", device, new.title.as_deref().unwrap_or(&new.uri));
        }
        Event::Device(DeviceEvent::PlaybackStopped { device, media }) => {
            info!("{} stopped {}", device, media.title.as_deref().unwrap_or(&media.uri));
        }
        Event::Device(_) => {}
    }
}

async fn handle_tasks(cmd: TaskCommands) -> Result<()> {
    let cfg = config::AppConfig::load()?;
    let bus = EventBus::new();
    let manager = build_manager(&cfg, bus.clone());

    match cmd {
        TaskCommands::List => {
            println!(
                "{:<20} {:<26} {:<12} {:<10} {:<26}",
                "Key", "Name", "Category", "State", "Last Run"
            );
            println!("{:-<96}", "");
            for info in manager.task_infos().into_iter().filter(|i| !i.is_hidden) {
                let last = info
                    .last_execution_result
                    .map(|r| format!("{:?} {}", r.status, r.end_time_utc.to_rfc3339()))
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<20} {:<26} {:<12} {:<10} {:<26}",
                    info.key, info.name, info.category, info.state, last
                );
            }
        }
        TaskCommands::Run { key } => {
            let mut events = bus.subscribe();
            manager.execute(&key, TaskOptions::default())?;
            let result = loop {
                match events.recv().await {
                    Ok(Event::Task(TaskEvent::Completed(result))) if result.key == key => {
                        break result
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(anyhow!("event bus closed")),
                }
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        TaskCommands::Triggers { key } => {
            let worker = manager
                .get_worker(&key)
                .ok_or_else(|| anyhow!("unknown task '{key}'"))?;
            let store = TaskStore::new(cfg.data_dir.clone());
            let triggers = store
                .load_triggers(worker.id())
                .unwrap_or_else(|| worker.task().default_triggers());
            println!("{}", serde_json::to_string_pretty(&triggers)?);
        }
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
