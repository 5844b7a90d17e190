//! flowcell_daq command-line entry point.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use flowcell_daq::config::{BathBackend, ExperimentConfig};
use flowcell_daq::experiment::Sequencer;
use flowcell_daq::hardware::mock::SimulatedRig;
use flowcell_daq::hardware::TemperatureBath;
use flowcell_daq::logging;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Temperature-resolved cyclic voltammetry campaigns on a microfluidic flow cell"
)]
struct Cli {
    /// Configuration file (TOML); FLOWCELL_* environment variables override it
    #[arg(long, short, default_value = "config/experiment.toml")]
    config: PathBuf,

    /// Run against simulated devices
    #[arg(long)]
    simulate: bool,

    /// Print the matrix, flow plans and measurement time, then exit
    #[arg(long)]
    dry_run: bool,

    /// Read setpoint and temperature from the serial bath, then exit
    #[arg(long)]
    probe_bath: bool,

    /// Where to write the run report (default: <data_dir>/run_report.json)
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ExperimentConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&config.application)?;
    info!(config = %cli.config.display(), name = %config.application.name, "configuration loaded");

    if cli.dry_run {
        return print_plan(&config);
    }
    if cli.probe_bath {
        return probe_bath(&config).await;
    }
    if !cli.simulate {
        bail!(
            "flow regulator, valve, potentiostat and camera drivers are not built into this binary; \
             run with --simulate, or --probe-bath to talk to the bath alone"
        );
    }

    let rig = SimulatedRig::new(
        config.temperatures.initial,
        config.devices.simulated_bath_rate,
    );
    let mut devices = rig.devices();
    if config.devices.bath == BathBackend::Serial {
        info!(port = %config.devices.bath_port, "using serial bath with simulated fluidics");
        devices.bath = open_serial_bath(&config)?;
    }
    let sequencer = Sequencer::new(&config, devices)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
        info!("ctrl-c received");
    };
    let report = sequencer.run_until(shutdown).await?;

    let path = cli
        .report
        .unwrap_or_else(|| config.application.data_dir.join("run_report.json"));
    report
        .write_json(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "run report written");

    if let Some(err) = &report.shutdown_error {
        error!(error = %err, "shutdown did not complete cleanly");
        bail!("shutdown failed: {err}");
    }
    Ok(())
}

fn print_plan(config: &ExperimentConfig) -> Result<()> {
    let matrix = config.matrix()?;
    let plans = config.flow_plans()?;

    println!("Campaign: {}", config.application.name);
    println!(
        "Matrix: {} channel(s) x {} temperature(s) = {} cells",
        matrix.channels().len(),
        matrix.temperatures().len(),
        matrix.len()
    );
    println!("Channels: {:?}", matrix.channels());
    println!();
    println!("{:>8}  {:>9}  {:>9}  {:>9}  {:>9}", "T (°C)", "A1", "A2", "B1", "B2");
    for (temperature, plan) in matrix.temperatures().iter().zip(&plans) {
        println!(
            "{temperature:>8.1}  {:>9.1}  {:>9.1}  {:>9.1}  {:>9.1}",
            plan.a1, plan.a2, plan.b1, plan.b2
        );
    }
    println!();
    println!("Measurement time T: {:?}", config.measurement.duration());
    println!("Cleaning sweep time: {:?}", config.cleaning.duration());
    println!("Recording budget: {:?}", config.recording_budget());
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn open_serial_bath(config: &ExperimentConfig) -> Result<Arc<dyn TemperatureBath>> {
    use flowcell_daq::hardware::bath::SerialBath;

    let devices = &config.devices;
    let bath = SerialBath::open(&devices.bath_port, devices.bath_baud, devices.bath_timeout)?;
    Ok(Arc::new(bath))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial_bath(_config: &ExperimentConfig) -> Result<Arc<dyn TemperatureBath>> {
    bail!("built without the instrument_serial feature; set devices.bath = \"simulated\"")
}

async fn probe_bath(config: &ExperimentConfig) -> Result<()> {
    let devices = &config.devices;
    let bath = open_serial_bath(config)?;
    let setpoint = bath.read_setpoint().await?;
    let temperature = bath.read_temperature().await?;
    println!("{}: setpoint {setpoint:.2} °C, temperature {temperature:.2} °C", devices.bath_port);
    Ok(())
}
