use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use ltc6804_lib::{monitor, protocol as proto};
use std::path::PathBuf;
use std::time::Duration;

fn parse_device_count(s: &str) -> Result<proto::DeviceCount, String> {
    let count =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid device count format: {e}"))?;
    proto::DeviceCount::new(count as usize).map_err(|e| e.to_string())
}

fn parse_adc_mode(s: &str) -> Result<proto::AdcMode, String> {
    match clap_num::maybe_hex::<u8>(s) {
        Ok(value) => proto::AdcMode::try_from(value).map_err(|e| e.to_string()),
        Err(_) => s.parse::<proto::AdcMode>().map_err(|e| e.to_string()),
    }
}

fn parse_noise_floor(s: &str) -> Result<f32, String> {
    let volts = s
        .parse::<f32>()
        .map_err(|e| format!("Invalid noise floor format: {e}"))?;
    monitor::validate_noise_floor(volts).map_err(|e| e.to_string())
}

fn parse_cell_channels(s: &str) -> Result<proto::CellChannels, String> {
    let value = clap_num::maybe_hex::<u8>(s)
        .map_err(|e| format!("Invalid cell channel selection format: {e}"))?;
    proto::CellChannels::try_from(value).map_err(|e| e.to_string())
}

fn parse_aux_channels(s: &str) -> Result<proto::AuxChannels, String> {
    let value = clap_num::maybe_hex::<u8>(s)
        .map_err(|e| format!("Invalid auxiliary channel selection format: {e}"))?;
    proto::AuxChannels::try_from(value).map_err(|e| e.to_string())
}

fn parse_status_channels(s: &str) -> Result<proto::StatusChannels, String> {
    let value = clap_num::maybe_hex::<u8>(s)
        .map_err(|e| format!("Invalid status channel selection format: {e}"))?;
    proto::StatusChannels::try_from(value).map_err(|e| e.to_string())
}

fn parse_configuration_block(s: &str) -> Result<proto::ConfigurationBlock, String> {
    proto::parse_configuration_block(s).map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: continuously sample cell voltages at a specified interval
    /// and print them to the console.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval between samples (e.g., "500ms", "10s").
        /// Overrides `chain.poll_interval` of the config file.
        #[arg(value_parser = humantime::parse_duration, short, long, verbatim_doc_comment)]
        poll_interval: Option<Duration>,
    },

    /// Start a cell conversion and print the voltages of every device.
    Sample {
        /// Cells to convert: 0 = all, 1..6 = cell pair n and n+6.
        /// Can be specified in decimal or hexadecimal.
        #[arg(long, value_parser = parse_cell_channels, verbatim_doc_comment)]
        cells: Option<proto::CellChannels>,

        /// Keep discharge switches closed during the conversion.
        #[arg(long)]
        discharge: bool,
    },

    /// Start an auxiliary conversion and print the GPIO and reference codes.
    SampleAux {
        /// Channels to convert: 0 = all, 1..5 = GPIO1..GPIO5, 6 = VREF2.
        #[arg(long, value_parser = parse_aux_channels, verbatim_doc_comment)]
        channels: Option<proto::AuxChannels>,
    },

    /// Start a status conversion and print sum of cells, temperature and supplies.
    SampleStatus {
        /// Measurements to convert: 0 = all, 1 = SOC, 2 = ITMP, 3 = VA, 4 = VD.
        #[arg(long, value_parser = parse_status_channels, verbatim_doc_comment)]
        channels: Option<proto::StatusChannels>,
    },

    /// Read and display the configuration registers of every device.
    ReadConfig,

    /// Write the configuration registers, one block per device, device 0 first.
    /// Each block is 6 bytes written as 12 hex digits, e.g. "FE0000000000".
    #[clap(verbatim_doc_comment)]
    WriteConfig {
        #[arg(required = true, value_parser = parse_configuration_block)]
        blocks: Vec<proto::ConfigurationBlock>,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Reset every cell voltage register to 0xFFFF.
    ClearCells,

    /// Reset every auxiliary register to 0xFFFF.
    ClearAux,

    /// Compute the PEC of the given bytes.
    /// Bytes can be specified in decimal or hexadecimal (e.g., "0x03 0x60").
    #[clap(verbatim_doc_comment)]
    Pec {
        #[arg(required = true, value_parser = clap_num::maybe_hex::<u8>)]
        bytes: Vec<u8>,
    },

    /// Print the 4-byte frame of a command, e.g. "ADCV", "RDCVA" or "WRCFG".
    /// Conversion commands use the current ADC settings.
    #[clap(verbatim_doc_comment)]
    Encode { command: String },
}

const fn about_text() -> &'static str {
    "LTC6804 Battery Monitor CLI - Sample cell voltages from a daisy chain of LTC6804-1 devices."
}

#[derive(Parser, Debug)]
#[command(name="cellmon", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// YAML configuration file. Defaults to "cellmon.yml" if it exists.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Number of devices on the daisy chain (1 to 32).
    #[arg(global = true, short = 'n', long, value_parser = parse_device_count)]
    pub devices: Option<proto::DeviceCount>,

    /// ADC mode: "fast", "normal", "filtered" or 1 to 3.
    #[arg(global = true, short, long, value_parser = parse_adc_mode)]
    pub mode: Option<proto::AdcMode>,

    /// Read attempts per sample before giving up on a PEC mismatch.
    /// `0` retries forever.
    #[arg(global = true, long, verbatim_doc_comment)]
    pub max_attempts: Option<u32>,

    /// Cell voltages below this value (in volts) are shown as 0.
    #[arg(global = true, long, value_parser = parse_noise_floor, allow_negative_numbers = true)]
    pub noise_floor: Option<f32>,

    /// Probability (0 to 1) that the simulated chain corrupts a register block.
    #[arg(global = true, long)]
    pub corrupt_probability: Option<f64>,

    /// Seed for the simulated chain's random corruption.
    #[arg(global = true, long)]
    pub seed: Option<u64>,
}
