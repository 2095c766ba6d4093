// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line entry point.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use peripheral_fuzz::bluetooth::sim::{SimCentral, SimTransport};
use peripheral_fuzz::bluetooth::{Peripheral, PeripheralError, TransportEvent};
use peripheral_fuzz::config::Config;
use peripheral_fuzz::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process stack driven by a scripted central.
    Sim,
    /// System BlueZ daemon.
    Bluez,
}

/// BLE fuzz-target peripheral.
#[derive(Debug, Parser)]
#[command(name = "peripheral-fuzz", version, about)]
struct Args {
    /// Configuration file (defaults to the user config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Backend::Sim)]
    backend: Backend,

    /// Connection cycles for the simulated central.
    #[arg(long)]
    cycles: Option<usize>,

    /// Seed for the simulated central.
    #[arg(long)]
    seed: Option<u64>,

    /// Exit with a non-zero status on fatal errors.
    #[arg(long)]
    strict_exit_codes: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(cycles) = args.cycles {
        config.sim.cycles = cycles;
    }
    if let Some(seed) = args.seed {
        config.sim.seed = seed;
    }
    config.strict_exit_codes |= args.strict_exit_codes;

    if let Err(e) = logging::init_logger(&config.logging) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    let strict = config.strict_exit_codes;
    match run(args.backend, config).await {
        Ok(()) => {
            info!("Peripheral stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<PeripheralError>() {
                Some(fatal) if strict || fatal.is_internal() => {
                    ExitCode::from(fatal.exit_code())
                }
                // Fatal peripheral errors exit 0 unless strict exit codes are enabled.
                Some(_) => ExitCode::SUCCESS,
                None => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(backend: Backend, config: Config) -> Result<()> {
    let (event_tx, event_rx) = mpsc::channel(config.event_queue_depth);
    match backend {
        Backend::Sim => run_sim(config, event_tx, event_rx).await,
        Backend::Bluez => run_bluez(config, event_tx, event_rx).await,
    }
}

async fn run_sim(
    config: Config,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: mpsc::Receiver<TransportEvent>,
) -> Result<()> {
    let transport = Arc::new(SimTransport::new());
    let mut peripheral = Peripheral::new(transport.clone(), config.peripheral_settings());
    peripheral.bring_up().await?;

    let value_handle = peripheral
        .value_handle()
        .context("custom characteristic was not registered")?;
    let mut central = SimCentral::new(event_tx, transport, value_handle, config.sim.seed)
        .max_fragment(config.sim.max_fragment);
    let (cycles, reason) = (config.sim.cycles, config.sim.disconnect_reason);
    let session = tokio::spawn(async move { central.run(cycles, reason).await });

    serve(peripheral, event_rx).await?;

    let report = session.await??;
    info!("Simulated session finished: {:?}", report);
    anyhow::ensure!(
        report.mismatches == 0,
        "{} read-back mismatches in {} cycles",
        report.mismatches,
        report.cycles
    );
    Ok(())
}

#[cfg(feature = "bluez")]
async fn run_bluez(
    config: Config,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: mpsc::Receiver<TransportEvent>,
) -> Result<()> {
    use peripheral_fuzz::bluetooth::gatt_server::BluezTransport;

    let transport = BluezTransport::new(event_tx)
        .await
        .map_err(PeripheralError::BringUp)?;
    let mut peripheral = Peripheral::new(Arc::new(transport), config.peripheral_settings());
    peripheral.bring_up().await?;

    serve(peripheral, event_rx).await
}

#[cfg(not(feature = "bluez"))]
async fn run_bluez(
    _config: Config,
    _event_tx: mpsc::Sender<TransportEvent>,
    _event_rx: mpsc::Receiver<TransportEvent>,
) -> Result<()> {
    anyhow::bail!("this build does not include the BlueZ backend (enable the `bluez` feature)")
}

/// Run the main loop until the stack hangs up or the process is interrupted.
async fn serve(peripheral: Peripheral, event_rx: mpsc::Receiver<TransportEvent>) -> Result<()> {
    tokio::select! {
        result = peripheral.run(event_rx) => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}
