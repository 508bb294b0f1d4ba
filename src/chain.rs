//! Register access for a daisy chain of LTC6804-1 devices.
//!
//! [`DaisyChain`] is stateless: every function takes the [`Transport`] and the
//! [`proto::DeviceCount`] it works on, runs one or more bus transactions and
//! returns what came back. It never retries. A block with a bad PEC is still
//! decoded and returned, flagged in the accompanying [`PecStatus`]; deciding
//! whether to read again is up to the caller (see [`crate::monitor::Monitor`]).
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "sim")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use ltc6804_lib::chain::DaisyChain;
//! use ltc6804_lib::protocol::{AdcConfig, CellGroup, DeviceCount};
//! use ltc6804_lib::sim::SimulatedChain;
//!
//! let devices = DeviceCount::new(2)?;
//! let mut bus = SimulatedChain::new(devices);
//!
//! DaisyChain::start_cell_conversion(&mut bus, &AdcConfig::default())?;
//! let read = DaisyChain::read_cell_group(&mut bus, devices, CellGroup::All)?;
//! if read.pec.is_ok() {
//!     println!("cell 1 of device 0: {}", read.codes[0][0]);
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sim"))]
//! # fn main() {}
//! ```

use crate::error::{Error, Result};
use crate::pec;
use crate::protocol::{self as proto, Register};
use crate::transport::Transport;
use log::{debug, trace, warn};

/// Per-device outcome of the PEC checks of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PecStatus(Vec<bool>);

impl PecStatus {
    fn new(devices: proto::DeviceCount) -> Self {
        Self(vec![true; *devices])
    }

    fn mark_failed(&mut self, device: usize) {
        if let Some(ok) = self.0.get_mut(device) {
            *ok = false;
        }
    }

    /// `true` if every block of every device carried a valid PEC.
    pub fn is_ok(&self) -> bool {
        self.0.iter().all(|ok| *ok)
    }

    /// PEC outcome for one device, `None` if the index is beyond the chain.
    pub fn device(&self, device: usize) -> Option<bool> {
        self.0.get(device).copied()
    }

    /// Indices of devices with at least one bad block.
    pub fn failed_devices(&self) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, ok)| !**ok)
            .map(|(device, _)| device)
            .collect()
    }
}

/// Codes read from a family of register groups, `N` channels per device.
///
/// `codes[i]` belongs to device `i`. Slots of groups that were not read are 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRead<const N: usize> {
    pub codes: Vec<[u16; N]>,
    pub pec: PecStatus,
}

/// Raw configuration registers, one 8-byte block (6 data + 2 PEC) per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRead {
    pub blocks: Vec<[u8; proto::REGISTER_BLOCK_LEN]>,
    pub pec: PecStatus,
}

impl ConfigRead {
    /// The 6 configuration bytes of one device, without their PEC.
    pub fn payload(&self, device: usize) -> Option<proto::ConfigurationBlock> {
        self.blocks.get(device).map(|block| split_block(block).0)
    }
}

/// Stateless register access over any [`Transport`].
#[derive(Debug)]
pub struct DaisyChain;

impl DaisyChain {
    /// Runs one transaction: stay-awake pulse, select, exchange, deselect.
    ///
    /// Deselect is attempted even when the exchange failed; the exchange error wins.
    fn transact<T: Transport>(transport: &mut T, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        transport.wake_stay_awake().map_err(Error::transport)?;
        transport.select().map_err(Error::transport)?;
        let exchanged = transport.exchange(tx, rx).map_err(Error::transport);
        let released = transport.deselect().map_err(Error::transport);
        exchanged?;
        released
    }

    /// Sends a command that every device executes and nobody answers.
    fn broadcast<T: Transport>(transport: &mut T, command: proto::Command) -> Result<()> {
        let frame = command.frame();
        debug!("{command}: {frame}");
        Self::transact(transport, frame.as_bytes(), &mut [])
    }

    /// Sends a read command and returns the `8 × n` response bytes.
    fn read_blocks<T: Transport>(
        transport: &mut T,
        devices: proto::DeviceCount,
        command: proto::Command,
    ) -> Result<Vec<u8>> {
        let frame = command.frame();
        let mut response = vec![0u8; devices.response_len()];
        debug!("{command}: {frame}");
        Self::transact(transport, frame.as_bytes(), &mut response)?;
        trace!("{} response: {:02X?}", command.mnemonic(), response);
        Ok(response)
    }

    /// Reads `registers` in order and gathers the codes by channel offset.
    fn read_registers<T, R, const N: usize>(
        transport: &mut T,
        devices: proto::DeviceCount,
        registers: &[R],
    ) -> Result<GroupRead<N>>
    where
        T: Transport,
        R: Register,
    {
        let mut codes = vec![[0u16; N]; *devices];
        let mut status = PecStatus::new(devices);
        for &register in registers {
            let command = register.read_command();
            let response = Self::read_blocks(transport, devices, command)?;
            let offset = register.offset();
            for (device, block) in response
                .chunks_exact(proto::REGISTER_BLOCK_LEN)
                .enumerate()
            {
                let (payload, received) = split_block(block);
                if !pec::verify(&payload, received) {
                    warn!(
                        "{}: PEC mismatch on device {device} (received {received:04X}, expected {:04X})",
                        command.mnemonic(),
                        pec::compute(&payload)
                    );
                    status.mark_failed(device);
                }
                let values = proto::decode_codes(&payload);
                if let Some(slots) = codes[device].get_mut(offset..offset + values.len()) {
                    slots.copy_from_slice(&values);
                }
            }
        }
        Ok(GroupRead {
            codes,
            pec: status,
        })
    }

    /// Reads cell voltage codes from every device.
    ///
    /// A single group costs one transaction, [`proto::CellGroup::All`] four.
    ///
    /// # Errors
    ///
    /// * [`Error::Transport`] if the bus fails. PEC mismatches are not errors,
    ///   they are reported in [`GroupRead::pec`].
    pub fn read_cell_group<T: Transport>(
        transport: &mut T,
        devices: proto::DeviceCount,
        group: proto::CellGroup,
    ) -> Result<GroupRead<{ proto::NUMBER_OF_CELLS }>> {
        Self::read_registers(transport, devices, group.registers())
    }

    /// Reads auxiliary (GPIO and reference) codes from every device.
    pub fn read_aux_group<T: Transport>(
        transport: &mut T,
        devices: proto::DeviceCount,
        group: proto::AuxGroup,
    ) -> Result<GroupRead<{ proto::NUMBER_OF_AUX }>> {
        Self::read_registers(transport, devices, group.registers())
    }

    /// Reads status words (sum of cells, temperature, supplies, flags) from every device.
    pub fn read_status_group<T: Transport>(
        transport: &mut T,
        devices: proto::DeviceCount,
        group: proto::StatusGroup,
    ) -> Result<GroupRead<{ proto::NUMBER_OF_STATUS }>> {
        Self::read_registers(transport, devices, group.registers())
    }

    /// Writes one configuration block per device.
    ///
    /// `blocks[i]` is meant for device `i`. On the wire the blocks go out
    /// last device first, each followed by its own PEC, since every device
    /// keeps the first block it sees pass through and forwards the rest.
    ///
    /// # Errors
    ///
    /// * [`proto::Error::BlockCountMismatch`] if `blocks` does not hold exactly
    ///   one block per device. Nothing is sent in that case.
    /// * [`Error::Transport`] if the bus fails.
    pub fn write_configuration<T: Transport>(
        transport: &mut T,
        devices: proto::DeviceCount,
        blocks: &[proto::ConfigurationBlock],
    ) -> Result<()> {
        if blocks.len() != *devices {
            return Err(proto::Error::BlockCountMismatch {
                expected: *devices,
                actual: blocks.len(),
            }
            .into());
        }
        let command = proto::Command::WriteConfiguration;
        let frame = command.frame();
        let mut tx = Vec::with_capacity(proto::COMMAND_LEN + devices.response_len());
        tx.extend_from_slice(frame.as_bytes());
        for block in blocks.iter().rev() {
            pec::append(&mut tx, block);
        }
        debug!("{command}: {frame}");
        trace!("WRCFG payload: {:02X?}", &tx[proto::COMMAND_LEN..]);
        Self::transact(transport, &tx, &mut [])
    }

    /// Reads the configuration registers of every device, device 0 first.
    pub fn read_configuration<T: Transport>(
        transport: &mut T,
        devices: proto::DeviceCount,
    ) -> Result<ConfigRead> {
        let command = proto::Command::ReadConfiguration;
        let response = Self::read_blocks(transport, devices, command)?;
        let mut status = PecStatus::new(devices);
        let mut blocks = Vec::with_capacity(*devices);
        for (device, chunk) in response
            .chunks_exact(proto::REGISTER_BLOCK_LEN)
            .enumerate()
        {
            let (payload, received) = split_block(chunk);
            if !pec::verify(&payload, received) {
                warn!("RDCFG: PEC mismatch on device {device}");
                status.mark_failed(device);
            }
            let mut block = [0u8; proto::REGISTER_BLOCK_LEN];
            block.copy_from_slice(chunk);
            blocks.push(block);
        }
        Ok(ConfigRead {
            blocks,
            pec: status,
        })
    }

    /// Starts a cell voltage conversion (ADCV) on every device.
    pub fn start_cell_conversion<T: Transport>(
        transport: &mut T,
        config: &proto::AdcConfig,
    ) -> Result<()> {
        Self::broadcast(transport, config.start_cell_conversion())
    }

    /// Starts an auxiliary conversion (ADAX) on every device.
    pub fn start_aux_conversion<T: Transport>(
        transport: &mut T,
        config: &proto::AdcConfig,
    ) -> Result<()> {
        Self::broadcast(transport, config.start_aux_conversion())
    }

    /// Starts a status conversion (ADSTAT) on every device.
    pub fn start_status_conversion<T: Transport>(
        transport: &mut T,
        config: &proto::AdcConfig,
    ) -> Result<()> {
        Self::broadcast(transport, config.start_status_conversion())
    }

    /// Resets every cell voltage register to `0xFFFF`.
    pub fn clear_cell_registers<T: Transport>(transport: &mut T) -> Result<()> {
        Self::broadcast(transport, proto::Command::ClearCellRegisters)
    }

    /// Resets every auxiliary register to `0xFFFF`.
    pub fn clear_aux_registers<T: Transport>(transport: &mut T) -> Result<()> {
        Self::broadcast(transport, proto::Command::ClearAuxRegisters)
    }

    /// Wakes the whole chain from sleep.
    pub fn wake_from_sleep<T: Transport>(transport: &mut T) -> Result<()> {
        debug!("Waking chain from sleep");
        transport.wake_from_sleep().map_err(Error::transport)
    }
}

/// Splits an 8-byte register block into its payload and received PEC.
fn split_block(block: &[u8]) -> (proto::ConfigurationBlock, u16) {
    let mut payload = [0u8; proto::REGISTER_PAYLOAD_LEN];
    payload.copy_from_slice(&block[..proto::REGISTER_PAYLOAD_LEN]);
    let received = pec::from_bytes([
        block[proto::REGISTER_PAYLOAD_LEN],
        block[proto::REGISTER_PAYLOAD_LEN + 1],
    ]);
    (payload, received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AdcConfig, AdcMode, AuxGroup, CellGroup, Command, StatusGroup};
    use assert_matches::assert_matches;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        StayAwake,
        Sleep,
        Select,
        Deselect,
        Exchange(Vec<u8>, usize),
    }

    #[derive(Debug, thiserror::Error)]
    #[error("bus fault")]
    struct BusFault;

    /// Records every call; answers reads with scripted responses, or with
    /// valid blocks holding codes `[3i, 3i+1, 3i+2]` for device `i`.
    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
        responses: VecDeque<Vec<u8>>,
        fail_exchange: bool,
    }

    impl Transport for Recorder {
        type Error = BusFault;

        fn wake_stay_awake(&mut self) -> std::result::Result<(), BusFault> {
            self.events.push(Event::StayAwake);
            Ok(())
        }

        fn wake_from_sleep(&mut self) -> std::result::Result<(), BusFault> {
            self.events.push(Event::Sleep);
            Ok(())
        }

        fn select(&mut self) -> std::result::Result<(), BusFault> {
            self.events.push(Event::Select);
            Ok(())
        }

        fn deselect(&mut self) -> std::result::Result<(), BusFault> {
            self.events.push(Event::Deselect);
            Ok(())
        }

        fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> std::result::Result<(), BusFault> {
            self.events.push(Event::Exchange(tx.to_vec(), rx.len()));
            if self.fail_exchange {
                return Err(BusFault);
            }
            match self.responses.pop_front() {
                Some(response) => rx.copy_from_slice(&response),
                None => {
                    for (i, chunk) in rx.chunks_exact_mut(proto::REGISTER_BLOCK_LEN).enumerate() {
                        let base = 3 * i as u16;
                        chunk.copy_from_slice(&block([base, base + 1, base + 2]));
                    }
                }
            }
            Ok(())
        }
    }

    fn block(codes: [u16; 3]) -> Vec<u8> {
        let mut out = Vec::new();
        pec::append(&mut out, &proto::encode_codes(&codes));
        out
    }

    fn devices(n: usize) -> proto::DeviceCount {
        proto::DeviceCount::new(n).unwrap()
    }

    fn exchanges(events: &[Event]) -> Vec<(Vec<u8>, usize)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Exchange(tx, len) => Some((tx.clone(), *len)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_group_is_one_framed_transaction() {
        let mut bus = Recorder::default();
        bus.responses
            .push_back([block([1, 2, 3]), block([4, 5, 6])].concat());
        let read = DaisyChain::read_cell_group(&mut bus, devices(2), CellGroup::B).unwrap();

        assert_eq!(
            bus.events,
            vec![
                Event::StayAwake,
                Event::Select,
                Event::Exchange(vec![0x00, 0x06, 0x9A, 0x94], 16),
                Event::Deselect,
            ]
        );
        assert!(read.pec.is_ok());
        assert_eq!(read.codes.len(), 2);
        assert_eq!(read.codes[0][3..6], [1, 2, 3]);
        assert_eq!(read.codes[1][3..6], [4, 5, 6]);
        assert_eq!(read.codes[0][0..3], [0, 0, 0]);
    }

    #[test]
    fn all_cell_groups_read_in_order() {
        let mut bus = Recorder::default();
        for g in 0..4u16 {
            bus.responses.push_back(block([10 * g, 10 * g + 1, 10 * g + 2]));
        }
        let read = DaisyChain::read_cell_group(&mut bus, devices(1), CellGroup::All).unwrap();

        let opcodes: Vec<u8> = exchanges(&bus.events).iter().map(|(tx, _)| tx[1]).collect();
        assert_eq!(opcodes, vec![0x04, 0x06, 0x08, 0x0A]);
        assert_eq!(
            read.codes[0],
            [0, 1, 2, 10, 11, 12, 20, 21, 22, 30, 31, 32]
        );
    }

    #[test]
    fn aux_and_status_groups() {
        let mut bus = Recorder::default();
        let aux = DaisyChain::read_aux_group(&mut bus, devices(1), AuxGroup::All).unwrap();
        assert_eq!(aux.codes[0], [0, 1, 2, 0, 1, 2]);

        let status = DaisyChain::read_status_group(&mut bus, devices(2), StatusGroup::B).unwrap();
        assert_eq!(status.codes[1], [0, 0, 0, 3, 4, 5]);

        let commands: Vec<Vec<u8>> = exchanges(&bus.events).into_iter().map(|(tx, _)| tx).collect();
        assert_eq!(
            commands,
            vec![
                vec![0x00, 0x0C, 0xEF, 0xCC],
                vec![0x00, 0x0E, 0x72, 0x9A],
                Command::ReadStatusRegister(proto::StatusRegister::B)
                    .frame()
                    .as_bytes()
                    .to_vec(),
            ]
        );
    }

    #[test]
    fn bad_pec_is_flagged_but_decoded() {
        let mut bus = Recorder::default();
        let mut corrupted = block([7, 8, 9]);
        corrupted[7] ^= 0x02;
        bus.responses
            .push_back([block([1, 2, 3]), corrupted, block([4, 5, 6])].concat());
        let read = DaisyChain::read_cell_group(&mut bus, devices(3), CellGroup::A).unwrap();

        assert!(!read.pec.is_ok());
        assert_eq!(read.pec.failed_devices(), vec![1]);
        assert_eq!(read.pec.device(0), Some(true));
        assert_eq!(read.pec.device(3), None);
        assert_eq!(read.codes.len(), 3);
        assert_eq!(read.codes[1][0..3], [7, 8, 9]);
    }

    #[test]
    fn channel_count_follows_device_count() {
        for n in 1..=16 {
            let mut bus = Recorder::default();
            let read = DaisyChain::read_cell_group(&mut bus, devices(n), CellGroup::All).unwrap();
            assert_eq!(read.codes.len() * proto::NUMBER_OF_CELLS, n * 12);
            let last = n - 1;
            let base = 3 * last as u16;
            assert_eq!(read.codes[last][9..12], [base, base + 1, base + 2]);
            for (_, len) in exchanges(&bus.events) {
                assert_eq!(len, 8 * n);
            }
        }
    }

    #[test]
    fn configuration_is_written_last_device_first() {
        let mut bus = Recorder::default();
        let blocks = [[0xA0; 6], [0xB1; 6], [0xC2; 6]];
        DaisyChain::write_configuration(&mut bus, devices(3), &blocks).unwrap();

        let sent = exchanges(&bus.events);
        assert_eq!(sent.len(), 1);
        let (tx, rx_len) = &sent[0];
        assert_eq!(*rx_len, 0);
        assert_eq!(tx.len(), 4 + 3 * 8);
        assert_eq!(tx[..4], [0x00, 0x01, 0x3D, 0x6E]);
        let mut expected = Vec::new();
        for b in blocks.iter().rev() {
            pec::append(&mut expected, b);
        }
        assert_eq!(tx[4..], expected[..]);
    }

    #[test]
    fn block_count_mismatch_touches_nothing() {
        let mut bus = Recorder::default();
        let result = DaisyChain::write_configuration(&mut bus, devices(2), &[[0; 6]]);
        assert_matches!(
            result,
            Err(Error::Protocol(proto::Error::BlockCountMismatch {
                expected: 2,
                actual: 1
            }))
        );
        assert!(bus.events.is_empty());
    }

    #[test]
    fn configuration_read_keeps_whole_blocks() {
        let mut bus = Recorder::default();
        let mut first = Vec::new();
        pec::append(&mut first, &[0xFE, 0, 0, 0, 0, 0]);
        let mut second = Vec::new();
        pec::append(&mut second, &[0x04, 1, 2, 3, 4, 5]);
        second[0] ^= 0x80;
        bus.responses.push_back([first.clone(), second.clone()].concat());

        let read = DaisyChain::read_configuration(&mut bus, devices(2)).unwrap();
        assert_eq!(read.blocks[0].to_vec(), first);
        assert_eq!(read.blocks[1].to_vec(), second);
        assert_eq!(read.payload(0), Some([0xFE, 0, 0, 0, 0, 0]));
        assert_eq!(read.payload(2), None);
        assert_eq!(read.pec.failed_devices(), vec![1]);
        assert_eq!(
            exchanges(&bus.events)[0],
            (vec![0x00, 0x02, 0x2B, 0x0A], 16)
        );
    }

    #[test]
    fn conversions_use_the_given_config() {
        let mut bus = Recorder::default();
        let config = AdcConfig {
            mode: AdcMode::Fast,
            ..Default::default()
        };
        DaisyChain::start_cell_conversion(&mut bus, &config).unwrap();
        DaisyChain::start_aux_conversion(&mut bus, &AdcConfig::default()).unwrap();
        DaisyChain::clear_cell_registers(&mut bus).unwrap();
        DaisyChain::clear_aux_registers(&mut bus).unwrap();

        let sent = exchanges(&bus.events);
        assert_eq!(sent[0], (vec![0x02, 0xE0, 0x38, 0x06], 0));
        assert_eq!(sent[1], (vec![0x05, 0x60, 0xD3, 0xA0], 0));
        assert_eq!(sent[2], (vec![0x07, 0x11, 0xC9, 0xC0], 0));
        assert_eq!(sent[3], (vec![0x07, 0x12, 0xDF, 0xA4], 0));
    }

    #[test]
    fn deselect_follows_failed_exchange() {
        let mut bus = Recorder {
            fail_exchange: true,
            ..Default::default()
        };
        let result = DaisyChain::read_cell_group(&mut bus, devices(1), CellGroup::A);
        assert_matches!(result, Err(Error::Transport(_)));
        assert_eq!(bus.events.last(), Some(&Event::Deselect));
    }

    #[test]
    fn wake_from_sleep_is_a_bare_pulse() {
        let mut bus = Recorder::default();
        DaisyChain::wake_from_sleep(&mut bus).unwrap();
        assert_eq!(bus.events, vec![Event::Sleep]);
    }
}
