//! LTC6804 Battery Monitor CLI
//!
//! A command-line interface (CLI) application for driving a daisy chain of
//! LTC6804-1 multicell battery monitors.
//!
//! This tool allows users to:
//! - Sample cell voltages, auxiliary inputs and status measurements of every device.
//! - Read and write the configuration registers.
//! - Clear the cell and auxiliary result registers.
//! - Run in a continuous daemon mode printing cell voltages to the console.
//! - Compute PECs and encode command frames for debugging a bus by hand.
//!
//! The chain is the byte-accurate simulator of `ltc6804_lib::sim`, seeded from
//! the `simulation` section of the config file. Its random corruption exercises
//! the same PEC retry path a noisy isoSPI link would.

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use ltc6804_lib::{
    monitor::{Monitor, RetryPolicy},
    pec, protocol as proto,
    sim::SimulatedChain,
};
use std::panic;

mod commandline;
mod config;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

macro_rules! print_voltages {
    ($monitor:expr) => {
        let voltages = $monitor
            .sample_voltages()
            .with_context(|| "Cannot sample cell voltages")?;
        println!("Cell voltages (V):\n{}", voltages);
        if let (Some(min), Some(max)) = (voltages.min(), voltages.max()) {
            println!("Min: {min:.4} V, Max: {max:.4} V, Delta: {:.4} V", max - min);
        }
    };
}

macro_rules! print_configuration {
    ($monitor:expr) => {
        let read = $monitor
            .read_configuration()
            .with_context(|| "Cannot read configuration registers")?;
        for (device, block) in read.blocks.iter().enumerate() {
            let status = match read.pec.device(device) {
                Some(true) => "PEC ok",
                _ => "PEC MISMATCH",
            };
            println!("Device {device}: {} ({status})", hex(&block[..proto::REGISTER_PAYLOAD_LEN]));
        }
    };
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Applies the command line options on top of the config file.
fn apply_overrides(args: &commandline::CliArgs, config: &mut config::Config) {
    if let Some(devices) = args.devices {
        config.chain.devices = devices;
    }
    if let Some(mode) = args.mode {
        config.adc.mode = mode;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.chain.max_attempts = max_attempts;
    }
    if let Some(noise_floor) = args.noise_floor {
        config.chain.noise_floor = noise_floor;
    }
    if let Some(probability) = args.corrupt_probability {
        config.simulation.corrupt_probability = probability;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    match &args.command {
        commandline::CliCommands::Sample { cells, discharge } => {
            if let Some(cells) = cells {
                config.adc.cell_channels = *cells;
            }
            if *discharge {
                config.adc.discharge = proto::DischargePermit::Enabled;
            }
        }
        commandline::CliCommands::SampleAux {
            channels: Some(channels),
        } => config.adc.aux_channels = *channels,
        commandline::CliCommands::SampleStatus {
            channels: Some(channels),
        } => config.adc.status_channels = *channels,
        commandline::CliCommands::Daemon {
            poll_interval: Some(poll_interval),
        } => config.chain.poll_interval = *poll_interval,
        _ => {}
    }
}

/// Builds the simulated chain: cells spread evenly over `cell_volts ± cell_spread`.
fn create_chain(config: &config::Config) -> SimulatedChain {
    let devices = config.chain.devices;
    let sim = &config.simulation;
    let mut chain = SimulatedChain::new(devices);
    let cells = *devices * proto::NUMBER_OF_CELLS;
    for index in 0..cells {
        let position = if cells > 1 {
            2.0 * index as f32 / (cells - 1) as f32 - 1.0
        } else {
            0.0
        };
        if let Some(device) = chain.device_mut(index / proto::NUMBER_OF_CELLS) {
            device.set_cell_volts(
                index % proto::NUMBER_OF_CELLS,
                sim.cell_volts + position * sim.cell_spread,
            );
        }
    }
    if sim.corrupt_probability > 0.0 {
        info!(
            "Simulated chain corrupts blocks with probability {} (seed {})",
            sim.corrupt_probability, sim.seed
        );
        chain = chain.with_random_corruption(sim.corrupt_probability, sim.seed);
    }
    chain
}

fn create_monitor(config: &config::Config) -> Result<Monitor<SimulatedChain>> {
    let mut monitor = Monitor::new(create_chain(config), config.chain.devices)
        .with_retry_policy(RetryPolicy::from_max_attempts(config.chain.max_attempts))
        .with_noise_floor(config.chain.noise_floor)
        .with_context(|| "Invalid chain.noise_floor")?;
    monitor.set_config(config.adc);
    info!(
        "Monitoring {} device(s), {}, {}",
        monitor.device_count(),
        monitor.config(),
        monitor.retry_policy()
    );
    Ok(monitor)
}

/// Every command the chain understands, conversions built from `config`.
fn known_commands(config: &proto::AdcConfig) -> Vec<proto::Command> {
    let mut commands = vec![
        config.start_cell_conversion(),
        config.start_aux_conversion(),
        config.start_status_conversion(),
        proto::Command::WriteConfiguration,
        proto::Command::ReadConfiguration,
        proto::Command::ClearCellRegisters,
        proto::Command::ClearAuxRegisters,
    ];
    commands.extend(proto::CellRegister::ALL.map(proto::Command::ReadCellRegister));
    commands.extend(proto::AuxRegister::ALL.map(proto::Command::ReadAuxRegister));
    commands.extend(proto::StatusRegister::ALL.map(proto::Command::ReadStatusRegister));
    commands
}

fn find_command(name: &str, config: &proto::AdcConfig) -> Option<proto::Command> {
    known_commands(config)
        .into_iter()
        .find(|command| command.mnemonic().eq_ignore_ascii_case(name))
}

fn handle_write_config(
    monitor: &mut Monitor<SimulatedChain>,
    blocks: &[proto::ConfigurationBlock],
    yes: bool,
) -> Result<()> {
    info!("Executing: Write Configuration");
    for (device, block) in blocks.iter().enumerate() {
        println!("Device {device}: {}", hex(block));
    }
    if !yes
        && !Confirm::new()
            .with_prompt("Write these configuration registers?")
            .default(false)
            .show_default(true)
            .interact()
            .context("Failed to get user confirmation.")?
    {
        info!("Write configuration aborted by user.");
        return Ok(());
    }
    monitor
        .write_configuration(blocks)
        .with_context(|| format!("Cannot write {} configuration block(s)", blocks.len()))?;
    println!("Configuration written, reading back:");
    print_configuration!(monitor);
    Ok(())
}

fn run_daemon(monitor: &mut Monitor<SimulatedChain>, config: &config::Config) -> Result<()> {
    info!(
        "Starting daemon mode: interval={:?}",
        config.chain.poll_interval
    );
    loop {
        debug!("Daemon: Sampling cell voltages...");
        match monitor.sample_voltages() {
            Ok(voltages) => println!("{voltages}\n"),
            Err(error @ ltc6804_lib::Error::PecRetriesExhausted { .. }) => {
                warn!("Skipping sample: {error}");
            }
            Err(error) => return Err(error).context("Cannot sample cell voltages"),
        }
        std::thread::sleep(config.chain.poll_interval);
    }
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "cellmon started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let mut config = config::get_config(args.config.as_deref())
        .with_context(|| "Cannot load configuration")?;
    apply_overrides(&args, &mut config);
    debug!("Effective configuration: {config:?}");

    // Commands that never touch the chain
    match &args.command {
        commandline::CliCommands::Pec { bytes } => {
            info!("Executing: Compute PEC");
            let pec = pec::compute(bytes);
            println!("PEC: 0x{pec:04X} (bytes on the wire: {})", hex(&pec::to_bytes(pec)));
            return Ok(());
        }
        commandline::CliCommands::Encode { command } => {
            info!("Executing: Encode {command}");
            let cmd = find_command(command, &config.adc)
                .with_context(|| format!("Unknown command '{command}'"))?;
            println!("{cmd}: {}", cmd.frame());
            return Ok(());
        }
        _ => {}
    }

    let mut monitor = create_monitor(&config)?;
    monitor
        .wake_from_sleep()
        .with_context(|| "Cannot wake the chain")?;

    match &args.command {
        commandline::CliCommands::Daemon { .. } => run_daemon(&mut monitor, &config)?,
        commandline::CliCommands::Sample { .. } => {
            info!("Executing: Sample Cell Voltages");
            print_voltages!(monitor);
        }
        commandline::CliCommands::SampleAux { .. } => {
            info!("Executing: Sample Auxiliary Inputs");
            let aux = monitor
                .sample_aux()
                .with_context(|| "Cannot sample auxiliary inputs")?;
            println!("Auxiliary codes (GPIO1..GPIO5, VREF2):\n{aux}");
        }
        commandline::CliCommands::SampleStatus { .. } => {
            info!("Executing: Sample Status");
            let status = monitor
                .sample_status()
                .with_context(|| "Cannot sample status")?;
            for device in 0..status.codes.len() {
                if let (Some(soc), Some(itmp), Some(va), Some(vd)) = (
                    status.sum_of_cells(device),
                    status.internal_temperature(device),
                    status.analog_supply(device),
                    status.digital_supply(device),
                ) {
                    println!(
                        "Device {device}: sum of cells {soc:.3} V, die {itmp:.1} °C, VA {va:.3} V, VD {vd:.3} V"
                    );
                }
            }
        }
        commandline::CliCommands::ReadConfig => {
            info!("Executing: Read Configuration");
            print_configuration!(monitor);
        }
        commandline::CliCommands::WriteConfig { blocks, yes } => {
            handle_write_config(&mut monitor, blocks, *yes)?;
        }
        commandline::CliCommands::ClearCells => {
            info!("Executing: Clear Cell Registers");
            monitor
                .clear_cell_registers()
                .with_context(|| "Cannot clear cell registers")?;
            println!("Cell voltage registers cleared.");
        }
        commandline::CliCommands::ClearAux => {
            info!("Executing: Clear Auxiliary Registers");
            monitor
                .clear_aux_registers()
                .with_context(|| "Cannot clear auxiliary registers")?;
            println!("Auxiliary registers cleared.");
        }
        commandline::CliCommands::Pec { .. } | commandline::CliCommands::Encode { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_commands_by_mnemonic() {
        let config = proto::AdcConfig::default();
        assert_eq!(
            find_command("rdcva", &config),
            Some(proto::Command::ReadCellRegister(proto::CellRegister::A))
        );
        assert_eq!(
            find_command("ADCV", &config).map(|c| *c.frame().as_bytes()),
            Some([0x03, 0x60, 0xF4, 0x6C])
        );
        assert_eq!(find_command("RDSTATB", &config).map(|c| c.opcode()), Some([0x00, 0x12]));
        assert_eq!(find_command("NOPE", &config), None);
    }

    #[test]
    fn overrides_win_over_config_file() {
        let args = commandline::CliArgs::try_parse_from([
            "cellmon",
            "sample",
            "--discharge",
            "-n",
            "3",
            "--max-attempts",
            "0",
        ])
        .unwrap();
        let mut config = config::Config::default();
        apply_overrides(&args, &mut config);
        assert_eq!(*config.chain.devices, 3);
        assert_eq!(config.chain.max_attempts, 0);
        assert_eq!(config.adc.discharge, proto::DischargePermit::Enabled);
        assert_eq!(config.adc.mode, proto::AdcMode::Normal);
    }

    #[test]
    fn simulated_cells_spread_around_nominal() {
        let mut config = config::Config::default();
        config.chain.devices = proto::DeviceCount::new(2).unwrap();
        let mut monitor = create_monitor(&config).unwrap();
        let voltages = monitor.sample_voltages().unwrap();
        let min = voltages.min().unwrap();
        let max = voltages.max().unwrap();
        assert!((min - 3.68).abs() < 1e-3);
        assert!((max - 3.72).abs() < 1e-3);
        assert!((voltages.total() - 24.0 * 3.7).abs() < 1e-2);
    }

    #[test]
    fn invalid_noise_floor_is_an_error() {
        let mut config = config::Config::default();
        config.chain.noise_floor = f32::NAN;
        assert!(create_monitor(&config).is_err());
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(hex(&[0xFE, 0x00, 0x0A]), "FE000A");
    }
}
