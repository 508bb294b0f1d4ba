//! Conversion orchestrator for a daisy chain of LTC6804-1 devices.
//!
//! [`Monitor`] owns the transport, remembers the ADC settings between calls and
//! turns the start-conversion / read-back sequence into one call per
//! measurement. When a read comes back with a bad PEC only the read is
//! repeated; the conversion results stay latched in the devices, so the
//! conversion is never started again.

use crate::chain::{ConfigRead, DaisyChain, GroupRead};
use crate::error::{Error, Result};
use crate::protocol as proto;
use crate::transport::Transport;
use log::{debug, info};
use std::fmt;
use std::num::NonZeroU32;

/// Cell voltages below this are reported as exactly 0 V.
pub const DEFAULT_NOISE_FLOOR: f32 = 0.1;
/// Read attempts per sample with the default [`RetryPolicy`].
pub const DEFAULT_MAX_ATTEMPTS: NonZeroU32 = match NonZeroU32::new(5) {
    Some(attempts) => attempts,
    None => unreachable!(),
};

/// Checks that a noise floor is a finite, non-negative voltage.
///
/// A NaN or negative floor would never clamp anything.
pub fn validate_noise_floor(volts: f32) -> std::result::Result<f32, proto::Error> {
    if volts.is_finite() && volts >= 0.0 {
        Ok(volts)
    } else {
        Err(proto::Error::NoiseFloorOutOfRange(volts))
    }
}

/// How often a read is attempted before a PEC mismatch becomes an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// At most this many read attempts per sample.
    Attempts(NonZeroU32),
    /// Keep reading until every PEC matches.
    Forever,
}

impl RetryPolicy {
    /// `0` means [`RetryPolicy::Forever`].
    pub fn from_max_attempts(max_attempts: u32) -> Self {
        NonZeroU32::new(max_attempts).map_or(Self::Forever, Self::Attempts)
    }

    fn allows_another(&self, attempts: u32) -> bool {
        match self {
            Self::Attempts(max) => attempts < max.get(),
            Self::Forever => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Attempts(DEFAULT_MAX_ATTEMPTS)
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempts(max) => write!(f, "up to {max} attempts"),
            Self::Forever => write!(f, "retry forever"),
        }
    }
}

/// Cell voltages of every device, in volts.
#[derive(Debug, Clone, PartialEq)]
pub struct CellVoltages {
    volts: Vec<[f32; proto::NUMBER_OF_CELLS]>,
    attempts: u32,
}

impl CellVoltages {
    /// All devices, device 0 first.
    pub fn devices(&self) -> &[[f32; proto::NUMBER_OF_CELLS]] {
        &self.volts
    }

    pub fn device(&self, device: usize) -> Option<&[f32; proto::NUMBER_OF_CELLS]> {
        self.volts.get(device)
    }

    /// Read attempts it took to get a clean sample.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Pack voltage: the sum over every cell of every device.
    pub fn total(&self) -> f32 {
        self.iter().sum()
    }

    /// Lowest cell voltage of the chain.
    pub fn min(&self) -> Option<f32> {
        self.iter().reduce(f32::min)
    }

    /// Highest cell voltage of the chain.
    pub fn max(&self) -> Option<f32> {
        self.iter().reduce(f32::max)
    }

    fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        self.volts.iter().flatten().copied()
    }
}

impl fmt::Display for CellVoltages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (device, cells) in self.volts.iter().enumerate() {
            write!(f, "Device {device}:")?;
            for volts in cells {
                write!(f, " {volts:.4}")?;
            }
            writeln!(f, " V")?;
        }
        write!(f, "Total: {:.4} V", self.total())
    }
}

/// Raw auxiliary codes (GPIO1..GPIO5, VREF2) of every device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxCodes {
    pub codes: Vec<[u16; proto::NUMBER_OF_AUX]>,
    pub attempts: u32,
}

impl fmt::Display for AuxCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_codes(f, &self.codes)
    }
}

/// Raw status words (SOC, ITMP, VA, VD and the two flag words) of every device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodes {
    pub codes: Vec<[u16; proto::NUMBER_OF_STATUS]>,
    pub attempts: u32,
}

impl StatusCodes {
    /// Sum of all cells of one device; SOC counts in steps of 20 × 100 µV.
    pub fn sum_of_cells(&self, device: usize) -> Option<f32> {
        self.word(device, 0).map(|code| code as f32 * 20.0 * proto::CELL_VOLTS_PER_LSB)
    }

    /// Die temperature in °C; ITMP is 7.5 mV/K.
    pub fn internal_temperature(&self, device: usize) -> Option<f32> {
        self.word(device, 1)
            .map(|code| code as f32 * proto::CELL_VOLTS_PER_LSB / 0.0075 - 273.0)
    }

    pub fn analog_supply(&self, device: usize) -> Option<f32> {
        self.word(device, 2).map(proto::cell_code_to_volts)
    }

    pub fn digital_supply(&self, device: usize) -> Option<f32> {
        self.word(device, 3).map(proto::cell_code_to_volts)
    }

    fn word(&self, device: usize, index: usize) -> Option<u16> {
        self.codes.get(device).map(|words| words[index])
    }
}

impl fmt::Display for StatusCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_codes(f, &self.codes)
    }
}

fn write_codes<const N: usize>(f: &mut fmt::Formatter<'_>, codes: &[[u16; N]]) -> fmt::Result {
    for (device, values) in codes.iter().enumerate() {
        if device > 0 {
            writeln!(f)?;
        }
        write!(f, "Device {device}:")?;
        for code in values {
            write!(f, " 0x{code:04X}")?;
        }
    }
    Ok(())
}

/// Battery monitor driver for a daisy chain of LTC6804-1 devices.
///
/// # Examples
///
/// ```no_run
/// # #[cfg(feature = "sim")]
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use ltc6804_lib::monitor::Monitor;
/// use ltc6804_lib::protocol::{AdcMode, AuxChannels, CellChannels, DeviceCount, DischargePermit};
/// use ltc6804_lib::sim::SimulatedChain;
///
/// let devices = DeviceCount::new(4)?;
/// let mut monitor = Monitor::new(SimulatedChain::new(devices), devices);
/// monitor.configure(
///     AdcMode::Normal,
///     DischargePermit::Disabled,
///     CellChannels::All,
///     AuxChannels::All,
/// );
/// let voltages = monitor.sample_voltages()?;
/// println!("{voltages}");
/// # Ok(())
/// # }
/// # #[cfg(not(feature = "sim"))]
/// # fn main() {}
/// ```
#[derive(Debug)]
pub struct Monitor<T: Transport> {
    transport: T,
    devices: proto::DeviceCount,
    config: proto::AdcConfig,
    retry: RetryPolicy,
    noise_floor: f32,
}

impl<T: Transport> Monitor<T> {
    /// Creates a monitor with the default ADC settings, retry policy and noise floor.
    ///
    /// # Arguments
    ///
    /// * `transport` - The bus the chain is attached to.
    /// * `devices` - Number of devices on the chain, fixed for the monitor's lifetime.
    pub fn new(transport: T, devices: proto::DeviceCount) -> Self {
        Self {
            transport,
            devices,
            config: proto::AdcConfig::default(),
            retry: RetryPolicy::default(),
            noise_floor: DEFAULT_NOISE_FLOOR,
        }
    }

    /// Replaces the default retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the voltage below which cells read as 0 V.
    ///
    /// # Errors
    ///
    /// * [`proto::Error::NoiseFloorOutOfRange`] if `volts` is NaN, infinite or negative.
    pub fn with_noise_floor(mut self, volts: f32) -> Result<Self> {
        self.noise_floor = validate_noise_floor(volts)?;
        Ok(self)
    }

    pub fn device_count(&self) -> proto::DeviceCount {
        self.devices
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Gives the transport back.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sets the ADC settings used by every following conversion.
    ///
    /// Nothing is sent to the chain; the settings travel with each start command.
    pub fn configure(
        &mut self,
        mode: proto::AdcMode,
        discharge: proto::DischargePermit,
        cell_channels: proto::CellChannels,
        aux_channels: proto::AuxChannels,
    ) {
        self.config = proto::AdcConfig {
            mode,
            discharge,
            cell_channels,
            aux_channels,
            status_channels: self.config.status_channels,
        };
        debug!("ADC configuration: {}", self.config);
    }

    /// Replaces every ADC setting at once, status channels included.
    pub fn set_config(&mut self, config: proto::AdcConfig) {
        self.config = config;
        debug!("ADC configuration: {}", self.config);
    }

    pub fn set_status_channels(&mut self, channels: proto::StatusChannels) {
        self.config.status_channels = channels;
    }

    pub fn config(&self) -> &proto::AdcConfig {
        &self.config
    }

    /// Reads until every PEC matches or the retry policy gives up.
    fn read_with_retry<const N: usize, F>(&mut self, read: F) -> Result<(GroupRead<N>, u32)>
    where
        F: Fn(&mut T, proto::DeviceCount) -> Result<GroupRead<N>>,
    {
        let mut attempts: u32 = 0;
        loop {
            let result = read(&mut self.transport, self.devices)?;
            attempts = attempts.saturating_add(1);
            if result.pec.is_ok() {
                return Ok((result, attempts));
            }
            let devices = result.pec.failed_devices();
            if !self.retry.allows_another(attempts) {
                return Err(Error::PecRetriesExhausted { attempts, devices });
            }
            info!("PEC mismatch on device(s) {devices:?}, reading again (attempt {attempts})");
        }
    }

    /// Starts a cell conversion and reads all 12 cells of every device.
    ///
    /// Codes are scaled to volts; readings below the noise floor become 0 V.
    ///
    /// # Errors
    ///
    /// * [`Error::PecRetriesExhausted`] if no read came back clean within the
    ///   retry policy. No partial data is returned in that case.
    /// * [`Error::Transport`] if the bus fails.
    pub fn sample_voltages(&mut self) -> Result<CellVoltages> {
        DaisyChain::start_cell_conversion(&mut self.transport, &self.config)?;
        let (read, attempts) = self.read_with_retry(|transport, devices| {
            DaisyChain::read_cell_group(transport, devices, proto::CellGroup::All)
        })?;
        let noise_floor = self.noise_floor;
        let volts = read
            .codes
            .iter()
            .map(|codes| {
                codes.map(|code| {
                    let volts = proto::cell_code_to_volts(code);
                    if volts < noise_floor {
                        0.0
                    } else {
                        volts
                    }
                })
            })
            .collect();
        Ok(CellVoltages { volts, attempts })
    }

    /// Starts an auxiliary conversion and reads both auxiliary groups.
    pub fn sample_aux(&mut self) -> Result<AuxCodes> {
        DaisyChain::start_aux_conversion(&mut self.transport, &self.config)?;
        let (read, attempts) = self.read_with_retry(|transport, devices| {
            DaisyChain::read_aux_group(transport, devices, proto::AuxGroup::All)
        })?;
        Ok(AuxCodes {
            codes: read.codes,
            attempts,
        })
    }

    /// Starts a status conversion and reads both status groups.
    pub fn sample_status(&mut self) -> Result<StatusCodes> {
        DaisyChain::start_status_conversion(&mut self.transport, &self.config)?;
        let (read, attempts) = self.read_with_retry(|transport, devices| {
            DaisyChain::read_status_group(transport, devices, proto::StatusGroup::All)
        })?;
        Ok(StatusCodes {
            codes: read.codes,
            attempts,
        })
    }

    /// Writes one configuration block per device, `blocks[i]` to device `i`.
    pub fn write_configuration(&mut self, blocks: &[proto::ConfigurationBlock]) -> Result<()> {
        DaisyChain::write_configuration(&mut self.transport, self.devices, blocks)
    }

    /// Reads the configuration registers once, without retrying.
    pub fn read_configuration(&mut self) -> Result<ConfigRead> {
        DaisyChain::read_configuration(&mut self.transport, self.devices)
    }

    pub fn clear_cell_registers(&mut self) -> Result<()> {
        DaisyChain::clear_cell_registers(&mut self.transport)
    }

    pub fn clear_aux_registers(&mut self) -> Result<()> {
        DaisyChain::clear_aux_registers(&mut self.transport)
    }

    pub fn wake_from_sleep(&mut self) -> Result<()> {
        DaisyChain::wake_from_sleep(&mut self.transport)
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::protocol::{
        AdcMode, AuxChannels, CellChannels, Command, DeviceCount, DischargePermit,
    };
    use crate::sim::SimulatedChain;
    use assert_matches::assert_matches;

    fn monitor(n: usize) -> Monitor<SimulatedChain> {
        let devices = DeviceCount::new(n).unwrap();
        Monitor::new(SimulatedChain::new(devices), devices)
    }

    fn count(log: &[Command], pred: impl Fn(&Command) -> bool) -> usize {
        log.iter().filter(|c| pred(c)).count()
    }

    fn is_adcv(c: &Command) -> bool {
        matches!(c, Command::StartCellConversion { .. })
    }

    fn is_rdcv(c: &Command) -> bool {
        matches!(c, Command::ReadCellRegister(_))
    }

    #[test]
    fn clean_sample() {
        let mut m = monitor(2);
        let voltages = m.sample_voltages().unwrap();
        assert_eq!(voltages.attempts(), 1);
        assert_eq!(voltages.devices().len(), 2);
        for volts in voltages.devices().iter().flatten() {
            assert!((volts - 3.6).abs() < 1e-4);
        }
        assert!((voltages.total() - 86.4).abs() < 1e-2);
    }

    #[test]
    fn transient_corruption_rereads_without_new_conversion() {
        let mut m = monitor(2);
        // First attempt reads 4 groups, so 5 corrupted reads spill into the second.
        m.transport.corrupt_next_reads(1, 5);
        let voltages = m.sample_voltages().unwrap();
        assert_eq!(voltages.attempts(), 3);

        let log = m.into_inner().command_log().to_vec();
        assert_eq!(count(&log, is_adcv), 1);
        assert_eq!(count(&log, is_rdcv), 12);
    }

    #[test]
    fn persistent_corruption_exhausts_policy() {
        let mut m = monitor(3).with_retry_policy(RetryPolicy::from_max_attempts(3));
        m.transport.corrupt_next_reads(2, 1_000);
        let result = m.sample_voltages();
        assert_matches!(
            result,
            Err(Error::PecRetriesExhausted { attempts: 3, ref devices }) if devices == &vec![2]
        );
        let log = m.into_inner().command_log().to_vec();
        assert_eq!(count(&log, is_adcv), 1);
        assert_eq!(count(&log, is_rdcv), 12);
    }

    #[test]
    fn forever_outlasts_the_default_policy() {
        let mut m = monitor(1).with_retry_policy(RetryPolicy::from_max_attempts(0));
        assert_eq!(m.retry_policy(), RetryPolicy::Forever);
        m.transport.corrupt_next_reads(0, 4 * 7);
        assert_eq!(m.sample_voltages().unwrap().attempts(), 8);

        let mut m = monitor(1);
        m.transport.corrupt_next_reads(0, 4 * 7);
        assert_matches!(
            m.sample_voltages(),
            Err(Error::PecRetriesExhausted { attempts: 5, .. })
        );
    }

    #[test]
    fn configuration_is_sticky() {
        let mut m = monitor(1);
        m.configure(
            AdcMode::Fast,
            DischargePermit::Enabled,
            CellChannels::All,
            AuxChannels::Gpio1,
        );
        m.sample_voltages().unwrap();
        m.sample_voltages().unwrap();
        m.sample_aux().unwrap();

        let log = m.into_inner().command_log().to_vec();
        let starts: Vec<&Command> = log
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Command::StartCellConversion { .. } | Command::StartAuxConversion { .. }
                )
            })
            .collect();
        assert_eq!(starts.len(), 3);
        assert_eq!(
            *starts[0],
            Command::StartCellConversion {
                mode: AdcMode::Fast,
                discharge: DischargePermit::Enabled,
                channels: CellChannels::All,
            }
        );
        assert_eq!(starts[0], starts[1]);
        assert_eq!(
            *starts[2],
            Command::StartAuxConversion {
                mode: AdcMode::Fast,
                channels: AuxChannels::Gpio1,
            }
        );
    }

    #[test]
    fn readings_below_noise_floor_are_zero() {
        let mut m = monitor(1);
        let device = m.transport.device_mut(0).unwrap();
        device.set_cell_volts(2, 0.05);
        device.set_cell_volts(3, 0.15);
        let voltages = m.sample_voltages().unwrap();
        let cells = voltages.device(0).unwrap();
        assert_eq!(cells[2], 0.0);
        assert!((cells[3] - 0.15).abs() < 1e-4);
        assert_eq!(voltages.min(), Some(0.0));

        let mut m = monitor(1).with_noise_floor(0.2).unwrap();
        m.transport.device_mut(0).unwrap().set_cell_volts(0, 0.15);
        assert_eq!(m.sample_voltages().unwrap().device(0).unwrap()[0], 0.0);
    }

    #[test]
    fn noise_floor_must_be_finite_and_non_negative() {
        for volts in [f32::NAN, f32::INFINITY, -0.1] {
            assert_matches!(
                monitor(1).with_noise_floor(volts),
                Err(Error::Protocol(proto::Error::NoiseFloorOutOfRange(_)))
            );
        }
        let mut m = monitor(1).with_noise_floor(0.0).unwrap();
        m.transport.device_mut(0).unwrap().set_cell_volts(0, 0.05);
        let cell = m.sample_voltages().unwrap().device(0).unwrap()[0];
        assert!((cell - 0.05).abs() < 1e-4);
    }

    #[test]
    fn channel_count_follows_device_count() {
        for n in 1..=16 {
            let mut m = monitor(n);
            m.transport.device_mut(n - 1).unwrap().set_cell_volts(11, 4.1);
            let voltages = m.sample_voltages().unwrap();
            assert_eq!(voltages.devices().iter().flatten().count(), n * 12);
            assert!((voltages.device(n - 1).unwrap()[11] - 4.1).abs() < 1e-4);
            assert_eq!(voltages.device(n), None);
        }
    }

    #[test]
    fn configuration_round_trip() {
        let mut m = monitor(2);
        let blocks = [[0xFC, 0x11, 0x22, 0x33, 0x44, 0x55], [0x04, 0, 0, 0, 0, 0x0F]];
        m.write_configuration(&blocks).unwrap();
        let read = m.read_configuration().unwrap();
        assert!(read.pec.is_ok());
        assert_eq!(read.payload(0), Some(blocks[0]));
        assert_eq!(read.payload(1), Some(blocks[1]));
    }

    #[test]
    fn invalid_block_count_sends_nothing() {
        let mut m = monitor(2);
        assert_matches!(
            m.write_configuration(&[[0; 6]; 3]),
            Err(Error::Protocol(proto::Error::BlockCountMismatch {
                expected: 2,
                actual: 3
            }))
        );
        assert_eq!(m.into_inner().transaction_count(), 0);
    }

    #[test]
    fn aux_and_status_samples() {
        let mut m = monitor(2);
        let aux = m.sample_aux().unwrap();
        assert_eq!(aux.codes[1], [15_000, 15_000, 15_000, 15_000, 15_000, 30_000]);
        assert_eq!(aux.attempts, 1);

        let status = m.sample_status().unwrap();
        assert!((status.sum_of_cells(0).unwrap() - 43.2).abs() < 1e-2);
        assert!((status.internal_temperature(0).unwrap() - 25.0).abs() < 1e-2);
        assert!((status.analog_supply(1).unwrap() - 5.0).abs() < 1e-4);
        assert!((status.digital_supply(1).unwrap() - 3.0).abs() < 1e-4);
        assert_eq!(status.sum_of_cells(2), None);
    }

    #[test]
    fn clear_and_wake_pass_through() {
        let mut m = monitor(1);
        m.wake_from_sleep().unwrap();
        m.sample_voltages().unwrap();
        m.clear_cell_registers().unwrap();
        m.clear_aux_registers().unwrap();
        let sim = m.into_inner();
        assert_eq!(sim.wake_count(), 1);
        assert_eq!(sim.device(0).unwrap().cell_registers(), &[0xFFFF; 12]);
        assert_eq!(
            sim.command_log().last(),
            Some(&Command::ClearAuxRegisters)
        );
    }

    #[test]
    fn display_lists_every_device() {
        let voltages = CellVoltages {
            volts: vec![[3.5; 12], [3.25; 12]],
            attempts: 1,
        };
        let text = voltages.to_string();
        assert!(text.starts_with("Device 0: 3.5000"));
        assert!(text.contains("Device 1: 3.2500"));
        assert!(text.ends_with("Total: 81.0000 V"));
        assert_eq!(voltages.max(), Some(3.5));
        assert_eq!(voltages.min(), Some(3.25));
    }
}
