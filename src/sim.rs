//! Software model of an LTC6804-1 daisy chain.
//!
//! [`SimulatedChain`] implements [`Transport`] and answers commands the way a
//! chain of real devices does at the byte level: frames with a bad PEC are
//! ignored, conversions latch the analog inputs into the result registers,
//! configuration writes travel through the chain last device first, and reads
//! come back device 0 first with a PEC per block. Faults can be injected to
//! exercise the PEC handling of the layers above.

use crate::pec;
use crate::protocol::{self as proto, Command, CommandFrame, Register};
use crate::transport::Transport;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::convert::Infallible;

/// Value of a result register after a clear, and of every byte nobody drives.
const CLEARED: u16 = 0xFFFF;
const IDLE_BYTE: u8 = 0xFF;

/// Configuration register after power-on: GPIO pull-downs off, everything else 0.
pub const POWER_ON_CONFIGURATION: proto::ConfigurationBlock = [0xF8, 0, 0, 0, 0, 0];

/// One device of the simulated chain.
///
/// The `*_inputs` fields are what the ADC would measure; conversions copy the
/// selected inputs into the result registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDevice {
    pub cell_inputs: [u16; proto::NUMBER_OF_CELLS],
    pub aux_inputs: [u16; proto::NUMBER_OF_AUX],
    pub status_inputs: [u16; proto::NUMBER_OF_STATUS],
    cell_registers: [u16; proto::NUMBER_OF_CELLS],
    aux_registers: [u16; proto::NUMBER_OF_AUX],
    status_registers: [u16; proto::NUMBER_OF_STATUS],
    configuration: proto::ConfigurationBlock,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        let cell_inputs = [proto::volts_to_cell_code(3.6); proto::NUMBER_OF_CELLS];
        let sum_of_cells: u32 = cell_inputs.iter().map(|&c| c as u32).sum();
        Self {
            cell_inputs,
            // GPIO1..5 at 1.5 V, VREF2 at 3 V
            aux_inputs: [15_000, 15_000, 15_000, 15_000, 15_000, 30_000],
            // SOC (sum of cells / 20), ITMP (25 degC), VA (5 V), VD (3 V), flags
            status_inputs: [(sum_of_cells / 20) as u16, 22_350, 50_000, 30_000, 0, 0],
            cell_registers: [CLEARED; proto::NUMBER_OF_CELLS],
            aux_registers: [CLEARED; proto::NUMBER_OF_AUX],
            status_registers: [CLEARED; proto::NUMBER_OF_STATUS],
            configuration: POWER_ON_CONFIGURATION,
        }
    }
}

impl SimulatedDevice {
    /// Sets the voltage seen on one cell input.
    pub fn set_cell_volts(&mut self, cell: usize, volts: f32) {
        if let Some(input) = self.cell_inputs.get_mut(cell) {
            *input = proto::volts_to_cell_code(volts);
        }
    }

    pub fn cell_registers(&self) -> &[u16; proto::NUMBER_OF_CELLS] {
        &self.cell_registers
    }

    pub fn aux_registers(&self) -> &[u16; proto::NUMBER_OF_AUX] {
        &self.aux_registers
    }

    pub fn status_registers(&self) -> &[u16; proto::NUMBER_OF_STATUS] {
        &self.status_registers
    }

    pub fn configuration(&self) -> &proto::ConfigurationBlock {
        &self.configuration
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::StartCellConversion { channels, .. } => {
                for cell in channels.cells() {
                    self.cell_registers[cell] = self.cell_inputs[cell];
                }
            }
            Command::StartAuxConversion { channels, .. } => {
                for channel in channels.channels() {
                    self.aux_registers[channel] = self.aux_inputs[channel];
                }
            }
            Command::StartStatusConversion { channels, .. } => {
                for channel in channels.channels() {
                    self.status_registers[channel] = self.status_inputs[channel];
                }
                // Group B flag words are refreshed by every status conversion.
                self.status_registers[4..].copy_from_slice(&self.status_inputs[4..]);
            }
            Command::ClearCellRegisters => self.cell_registers = [CLEARED; proto::NUMBER_OF_CELLS],
            Command::ClearAuxRegisters => self.aux_registers = [CLEARED; proto::NUMBER_OF_AUX],
            _ => {}
        }
    }

    /// Payload this device shifts out for a read command.
    fn payload(&self, command: Command) -> Option<[u8; proto::REGISTER_PAYLOAD_LEN]> {
        match command {
            Command::ReadConfiguration => Some(self.configuration),
            Command::ReadCellRegister(r) => Some(group_payload(&self.cell_registers, r)),
            Command::ReadAuxRegister(r) => Some(group_payload(&self.aux_registers, r)),
            Command::ReadStatusRegister(r) => Some(group_payload(&self.status_registers, r)),
            _ => None,
        }
    }
}

fn group_payload<R: Register>(registers: &[u16], register: R) -> [u8; proto::REGISTER_PAYLOAD_LEN] {
    let offset = register.offset();
    let mut codes = [0u16; proto::CODES_PER_REGISTER];
    codes.copy_from_slice(&registers[offset..offset + proto::CODES_PER_REGISTER]);
    proto::encode_codes(&codes)
}

/// A chain of [`SimulatedDevice`]s behind a [`Transport`].
#[derive(Debug)]
pub struct SimulatedChain {
    devices: Vec<SimulatedDevice>,
    selected: bool,
    command_log: Vec<Command>,
    wake_count: usize,
    transaction_count: usize,
    pending_corruption: Vec<usize>,
    random_corruption: Option<(f64, StdRng)>,
}

impl SimulatedChain {
    /// Creates a chain of devices in their power-on state.
    pub fn new(devices: proto::DeviceCount) -> Self {
        Self {
            devices: vec![SimulatedDevice::default(); *devices],
            selected: false,
            command_log: Vec::new(),
            wake_count: 0,
            transaction_count: 0,
            pending_corruption: vec![0; *devices],
            random_corruption: None,
        }
    }

    /// Flips a random bit in each returned block with the given probability.
    ///
    /// The probability is clamped to `0.0..=1.0`; the same seed gives the same faults.
    pub fn with_random_corruption(mut self, probability: f64, seed: u64) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self.random_corruption = Some((probability, StdRng::seed_from_u64(seed)));
        self
    }

    /// Corrupts the block of `device` in each of the next `count` read transactions.
    pub fn corrupt_next_reads(&mut self, device: usize, count: usize) {
        if let Some(pending) = self.pending_corruption.get_mut(device) {
            *pending += count;
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, device: usize) -> Option<&SimulatedDevice> {
        self.devices.get(device)
    }

    pub fn device_mut(&mut self, device: usize) -> Option<&mut SimulatedDevice> {
        self.devices.get_mut(device)
    }

    /// Commands the chain accepted, oldest first.
    pub fn command_log(&self) -> &[Command] {
        &self.command_log
    }

    /// Number of wake-from-sleep pulses seen.
    pub fn wake_count(&self) -> usize {
        self.wake_count
    }

    /// Number of exchanges seen, accepted or not.
    pub fn transaction_count(&self) -> usize {
        self.transaction_count
    }

    fn write_configuration(&mut self, blocks: &[u8]) {
        let count = self.devices.len();
        for (position, block) in blocks
            .chunks_exact(proto::REGISTER_BLOCK_LEN)
            .take(count)
            .enumerate()
        {
            let device = count - 1 - position;
            let (payload, received) = block.split_at(proto::REGISTER_PAYLOAD_LEN);
            if !pec::verify(payload, pec::from_bytes([received[0], received[1]])) {
                debug!("device {device} dropped a configuration block with a bad PEC");
                continue;
            }
            self.devices[device]
                .configuration
                .copy_from_slice(payload);
        }
    }

    fn read(&mut self, command: Command, rx: &mut [u8]) {
        let mut response = Vec::with_capacity(self.devices.len() * proto::REGISTER_BLOCK_LEN);
        for device in &self.devices {
            if let Some(payload) = device.payload(command) {
                pec::append(&mut response, &payload);
            }
        }
        for (device, block) in response
            .chunks_exact_mut(proto::REGISTER_BLOCK_LEN)
            .enumerate()
        {
            if self.pending_corruption[device] > 0 {
                self.pending_corruption[device] -= 1;
                block[0] ^= 0x01;
                trace!("corrupted block of device {device}");
            }
            if let Some((probability, rng)) = self.random_corruption.as_mut() {
                if rng.random_bool(*probability) {
                    let byte = rng.random_range(0..proto::REGISTER_BLOCK_LEN);
                    let bit = rng.random_range(0..8u8);
                    block[byte] ^= 1 << bit;
                    trace!("randomly corrupted byte {byte} bit {bit} of device {device}");
                }
            }
        }
        for (i, byte) in rx.iter_mut().enumerate() {
            *byte = response.get(i).copied().unwrap_or(IDLE_BYTE);
        }
    }
}

impl Transport for SimulatedChain {
    type Error = Infallible;

    fn wake_stay_awake(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn wake_from_sleep(&mut self) -> Result<(), Self::Error> {
        self.wake_count += 1;
        Ok(())
    }

    fn select(&mut self) -> Result<(), Self::Error> {
        self.selected = true;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), Self::Error> {
        self.selected = false;
        Ok(())
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        self.transaction_count += 1;
        rx.fill(IDLE_BYTE);
        if !self.selected || tx.len() < proto::COMMAND_LEN {
            return Ok(());
        }

        let mut bytes = [0u8; proto::COMMAND_LEN];
        bytes.copy_from_slice(&tx[..proto::COMMAND_LEN]);
        let frame = CommandFrame::from_bytes(bytes);
        let Some(command) = frame.command() else {
            debug!("chain ignored frame {frame}");
            return Ok(());
        };
        self.command_log.push(command);

        match command {
            Command::WriteConfiguration => self.write_configuration(&tx[proto::COMMAND_LEN..]),
            Command::ReadConfiguration
            | Command::ReadCellRegister(_)
            | Command::ReadAuxRegister(_)
            | Command::ReadStatusRegister(_) => self.read(command, rx),
            other => self.devices.iter_mut().for_each(|d| d.execute(other)),
        }
        Ok(())
    }
}
