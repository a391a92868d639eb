use std::{path::PathBuf, sync::Arc};

use apkm_core::{AcquisitionOrchestrator, OrchestratorConfig, ResourceSpec, StateFile};
use apkm_device::{AdbClient, DeviceControlClient};
use apkm_source::{Aapt2Inspector, Method};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "apkm", version, about = "Keep Android packages installed at their latest version")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args, Clone)]
struct DeviceArgs {
    /// Hardware serial (`ro.serialno`)
    #[arg(long)]
    serial: Option<String>,
    /// Network endpoint, e.g. 192.168.1.20:5555
    #[arg(long)]
    endpoint: Option<String>,
}

impl DeviceArgs {
    fn is_empty(&self) -> bool {
        self.serial.is_none() && self.endpoint.is_none()
    }
}

#[derive(Args, Clone)]
struct ResourceArgs {
    /// Package id
    #[arg(long)]
    name: String,
    /// fdroid, gplaycli or aurora
    #[arg(long, default_value = "fdroid")]
    method: String,
    #[command(flatten)]
    device: DeviceArgs,
    /// State file (defaults to $APKM_STATE_DIR/resources.json)
    #[arg(long)]
    state: Option<PathBuf>,
    /// Key of the resource in the state file (defaults to the package id)
    #[arg(long)]
    address: Option<String>,
}

impl ResourceArgs {
    fn spec(&self) -> Result<ResourceSpec, Box<dyn std::error::Error>> {
        let method: Method = self.method.parse()?;
        Ok(ResourceSpec {
            name: self.name.clone(),
            method,
            serial: self.device.serial.clone(),
            endpoint: self.device.endpoint.clone(),
        })
    }

    fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    fn state_path(&self, config: &OrchestratorConfig) -> PathBuf {
        self.state.clone().unwrap_or_else(|| config.state_file.clone())
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// List devices visible to adb
    Devices,
    /// Acquire a package and print the version a method offers
    Latest {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "fdroid")]
        method: String,
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Print the installed version of a package
    Installed {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Show what apply would change
    Plan(ResourceArgs),
    /// Install or update a package and record it
    Apply(ResourceArgs),
    /// Refresh a recorded package from its device
    Read(ResourceArgs),
    /// Uninstall a recorded package and forget it
    Destroy(ResourceArgs),
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    apkm_util::init_tracing()?;
    let cli = Cli::parse();
    let config = OrchestratorConfig::from_env();

    let adb = Arc::new(AdbClient::new());
    adb.ensure_server().await?;

    if let Cmd::Devices = cli.cmd {
        return print_json(&adb.list_devices().await?);
    }

    let orchestrator =
        AcquisitionOrchestrator::new(adb, Arc::new(Aapt2Inspector::new()), config.sources.clone())?
            .with_cancel(cancel_on_ctrl_c());

    match cli.cmd {
        Cmd::Devices => {}
        Cmd::Latest {
            name,
            method,
            device,
        } => {
            let handle = if device.is_empty() {
                None
            } else {
                Some(
                    orchestrator
                        .resolve_device(device.serial.as_deref(), device.endpoint.as_deref())
                        .await?,
                )
            };
            let latest = orchestrator
                .query_latest(&method, &name, handle.as_ref())
                .await?;
            print_json(&latest)?;
        }
        Cmd::Installed { name, device } => {
            let handle = orchestrator
                .resolve_device(device.serial.as_deref(), device.endpoint.as_deref())
                .await?;
            print_json(&orchestrator.query_installed(&handle, &name).await?)?;
        }
        Cmd::Plan(args) => {
            let state = StateFile::load(&args.state_path(&config))?;
            let plan = orchestrator
                .plan(&args.spec()?, state.get(args.address()))
                .await?;
            print_json(&plan)?;
        }
        Cmd::Apply(args) => {
            let path = args.state_path(&config);
            let mut state = StateFile::load(&path)?;
            let applied = orchestrator
                .apply(&args.spec()?, state.get(args.address()))
                .await?;
            info!("{}: {} @ {}", applied.id, applied.name, applied.version);
            state.set(args.address(), Some(applied.clone()));
            state.save(&path)?;
            print_json(&applied)?;
        }
        Cmd::Read(args) => {
            let path = args.state_path(&config);
            let mut state = StateFile::load(&path)?;
            let Some(prior) = state.get(args.address()).cloned() else {
                return Err(format!("no recorded state for {}", args.address()).into());
            };
            let current = orchestrator.read(&prior).await?;
            state.set(args.address(), current.clone());
            state.save(&path)?;
            print_json(&current)?;
        }
        Cmd::Destroy(args) => {
            let path = args.state_path(&config);
            let mut state = StateFile::load(&path)?;
            match state.get(args.address()).cloned() {
                Some(prior) => orchestrator.destroy(&prior).await?,
                None => warn!("no recorded state for {}; nothing to destroy", args.address()),
            }
            state.set(args.address(), None);
            state.save(&path)?;
        }
    }

    Ok(())
}
