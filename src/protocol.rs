//! LTC6804-1 command set and register layout.
//!
//! This module is pure: it builds the 4-byte command frames sent to the daisy
//! chain and describes the register blocks that come back, without touching
//! the bus. The transaction logic lives in [`crate::chain`].
//!
//! Command frame layout:
//!
//! | byte 0   | byte 1   | byte 2   | byte 3   |
//! |----------|----------|----------|----------|
//! | CMD[0]   | CMD[1]   | PEC high | PEC low  |
//!
//! Conversion commands carry the ADC mode (MD), discharge permit (DCP) and
//! channel selection bits:
//!
//! | command | 15..11 | 10 | 9 | 8     | 7     | 6 | 5 | 4   | 3 | 2..0 |
//! |---------|--------|----|---|-------|-------|---|---|-----|---|------|
//! | ADCV    | 0      | 0  | 1 | MD[1] | MD[0] | 1 | 1 | DCP | 0 | CH   |
//! | ADAX    | 0      | 1  | 0 | MD[1] | MD[0] | 1 | 1 | 0   | 0 | CHG  |
//! | ADSTAT  | 0      | 1  | 0 | MD[1] | MD[0] | 1 | 1 | 0   | 1 | CHST |

use crate::pec;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Length of a command frame: 2 opcode bytes and 2 PEC bytes.
pub const COMMAND_LEN: usize = 4;
/// Payload bytes in one register group of one device.
pub const REGISTER_PAYLOAD_LEN: usize = 6;
/// Bytes one device returns for a register read: payload followed by PEC.
pub const REGISTER_BLOCK_LEN: usize = REGISTER_PAYLOAD_LEN + pec::PEC_LEN;
/// 16-bit codes in one register group.
pub const CODES_PER_REGISTER: usize = 3;
/// Cell voltage channels per device (4 register groups).
pub const NUMBER_OF_CELLS: usize = 12;
/// Auxiliary channels per device: GPIO1..GPIO5 and the second reference.
pub const NUMBER_OF_AUX: usize = 6;
/// Status words per device: SOC, ITMP, VA, VD and the flag words of group B.
pub const NUMBER_OF_STATUS: usize = 6;
/// Resolution of a cell voltage code.
pub const CELL_VOLTS_PER_LSB: f32 = 0.000_1;

/// Configuration register contents of one device (CFGR0..CFGR5).
pub type ConfigurationBlock = [u8; REGISTER_PAYLOAD_LEN];

/// Errors raised while validating caller input, before the bus is touched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Device count {0} out of range ({min}..={max})", min = DeviceCount::MIN, max = DeviceCount::MAX)]
    DeviceCountOutOfRange(usize),
    #[error("ADC mode {0} out of range (1 = fast, 2 = normal, 3 = filtered)")]
    AdcModeOutOfRange(u8),
    #[error("Unknown ADC mode '{0}' (expected fast, normal or filtered)")]
    UnknownAdcMode(String),
    #[error("Cell channel selection {0} out of range (0..=6)")]
    CellChannelsOutOfRange(u8),
    #[error("Auxiliary channel selection {0} out of range (0..=6)")]
    AuxChannelsOutOfRange(u8),
    #[error("Status channel selection {0} out of range (0..=4)")]
    StatusChannelsOutOfRange(u8),
    #[error("Cell register group {0} out of range (0 = all, 1..=4 = A..D)")]
    CellGroupOutOfRange(u8),
    #[error("Auxiliary register group {0} out of range (0 = all, 1..=2 = A..B)")]
    AuxGroupOutOfRange(u8),
    #[error("Status register group {0} out of range (0 = all, 1..=2 = A..B)")]
    StatusGroupOutOfRange(u8),
    #[error("Expected {expected} configuration blocks, one per device, got {actual}")]
    BlockCountMismatch { expected: usize, actual: usize },
    #[error("Invalid configuration block '{0}' (expected 6 bytes as 12 hex digits)")]
    InvalidConfigurationBlock(String),
    #[error("Noise floor {0} V out of range (expected a finite value >= 0)")]
    NoiseFloorOutOfRange(f32),
}

/// Number of devices on the daisy chain.
///
/// The chain composition is fixed when the driver is built, so this value is
/// validated once and then trusted by every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "usize", into = "usize"))]
pub struct DeviceCount(usize);

impl DeviceCount {
    pub const MIN: usize = 1;
    pub const MAX: usize = 32;

    /// Validates a device count against `MIN..=MAX`.
    pub fn new(count: usize) -> Result<Self, Error> {
        if (Self::MIN..=Self::MAX).contains(&count) {
            Ok(Self(count))
        } else {
            Err(Error::DeviceCountOutOfRange(count))
        }
    }

    /// Bytes returned by the whole chain for one register read.
    pub fn response_len(&self) -> usize {
        self.0 * REGISTER_BLOCK_LEN
    }
}

impl Default for DeviceCount {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl Deref for DeviceCount {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<usize> for DeviceCount {
    type Error = Error;
    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceCount> for usize {
    fn from(count: DeviceCount) -> Self {
        count.0
    }
}

impl fmt::Display for DeviceCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ADC conversion mode (MD bits). Filter corners assume ADCOPT = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum AdcMode {
    /// 27 kHz
    Fast = 1,
    /// 7 kHz
    #[default]
    Normal = 2,
    /// 26 Hz
    Filtered = 3,
}

impl AdcMode {
    fn high_bit(self) -> u8 {
        (self as u8 & 0x02) >> 1
    }

    fn low_bit(self) -> u8 {
        (self as u8 & 0x01) << 7
    }
}

impl TryFrom<u8> for AdcMode {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Fast),
            2 => Ok(Self::Normal),
            3 => Ok(Self::Filtered),
            _ => Err(Error::AdcModeOutOfRange(value)),
        }
    }
}

impl FromStr for AdcMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "normal" => Ok(Self::Normal),
            "filtered" => Ok(Self::Filtered),
            _ => Err(Error::UnknownAdcMode(s.to_string())),
        }
    }
}

impl fmt::Display for AdcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fast => "fast",
            Self::Normal => "normal",
            Self::Filtered => "filtered",
        };
        write!(f, "{name}")
    }
}

/// Whether discharge switches may stay closed during a cell conversion (DCP bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum DischargePermit {
    #[default]
    Disabled = 0,
    Enabled = 1,
}

impl From<bool> for DischargePermit {
    fn from(permitted: bool) -> Self {
        if permitted {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl fmt::Display for DischargePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "discharge not permitted"),
            Self::Enabled => write!(f, "discharge permitted"),
        }
    }
}

/// Cells converted by ADCV (CH bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum CellChannels {
    #[default]
    All = 0,
    Cells1And7 = 1,
    Cells2And8 = 2,
    Cells3And9 = 3,
    Cells4And10 = 4,
    Cells5And11 = 5,
    Cells6And12 = 6,
}

impl CellChannels {
    /// Zero-based cell indices covered by this selection.
    pub fn cells(self) -> Vec<usize> {
        match self {
            Self::All => (0..NUMBER_OF_CELLS).collect(),
            pair => {
                let first = pair as usize - 1;
                vec![first, first + NUMBER_OF_CELLS / 2]
            }
        }
    }
}

impl TryFrom<u8> for CellChannels {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::Cells1And7),
            2 => Ok(Self::Cells2And8),
            3 => Ok(Self::Cells3And9),
            4 => Ok(Self::Cells4And10),
            5 => Ok(Self::Cells5And11),
            6 => Ok(Self::Cells6And12),
            _ => Err(Error::CellChannelsOutOfRange(value)),
        }
    }
}

impl fmt::Display for CellChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all cells"),
            pair => {
                let first = *pair as u8;
                write!(f, "cells {} and {}", first, first + 6)
            }
        }
    }
}

/// Auxiliary inputs converted by ADAX (CHG bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum AuxChannels {
    #[default]
    All = 0,
    Gpio1 = 1,
    Gpio2 = 2,
    Gpio3 = 3,
    Gpio4 = 4,
    Gpio5 = 5,
    Vref2 = 6,
}

impl AuxChannels {
    /// Zero-based auxiliary channel indices covered by this selection.
    pub fn channels(self) -> Vec<usize> {
        match self {
            Self::All => (0..NUMBER_OF_AUX).collect(),
            single => vec![single as usize - 1],
        }
    }
}

impl TryFrom<u8> for AuxChannels {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::Gpio1),
            2 => Ok(Self::Gpio2),
            3 => Ok(Self::Gpio3),
            4 => Ok(Self::Gpio4),
            5 => Ok(Self::Gpio5),
            6 => Ok(Self::Vref2),
            _ => Err(Error::AuxChannelsOutOfRange(value)),
        }
    }
}

impl fmt::Display for AuxChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all GPIOs and VREF2"),
            Self::Vref2 => write!(f, "VREF2"),
            gpio => write!(f, "GPIO{}", *gpio as u8),
        }
    }
}

/// Status measurements converted by ADSTAT (CHST bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum StatusChannels {
    #[default]
    All = 0,
    Soc = 1,
    InternalTemperature = 2,
    AnalogSupply = 3,
    DigitalSupply = 4,
}

impl StatusChannels {
    /// Zero-based status word indices covered by this selection.
    pub fn channels(self) -> Vec<usize> {
        match self {
            Self::All => (0..4).collect(),
            single => vec![single as usize - 1],
        }
    }
}

impl TryFrom<u8> for StatusChannels {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::Soc),
            2 => Ok(Self::InternalTemperature),
            3 => Ok(Self::AnalogSupply),
            4 => Ok(Self::DigitalSupply),
            _ => Err(Error::StatusChannelsOutOfRange(value)),
        }
    }
}

impl fmt::Display for StatusChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::All => "all status measurements",
            Self::Soc => "sum of cells",
            Self::InternalTemperature => "internal temperature",
            Self::AnalogSupply => "analog supply",
            Self::DigitalSupply => "digital supply",
        };
        write!(f, "{name}")
    }
}

/// A single register group holding three 16-bit codes per device.
pub trait Register: Copy + fmt::Debug + 'static {
    /// Position of the group within its family (A = 0).
    fn index(self) -> usize;

    /// Command that reads this group back from every device.
    fn read_command(self) -> Command;

    /// First channel slot filled by this group.
    fn offset(self) -> usize {
        self.index() * CODES_PER_REGISTER
    }
}

/// Cell voltage register groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRegister {
    A,
    B,
    C,
    D,
}

impl CellRegister {
    pub const ALL: [Self; 4] = [Self::A, Self::B, Self::C, Self::D];
}

impl Register for CellRegister {
    fn index(self) -> usize {
        self as usize
    }

    fn read_command(self) -> Command {
        Command::ReadCellRegister(self)
    }
}

/// Auxiliary register groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxRegister {
    A,
    B,
}

impl AuxRegister {
    pub const ALL: [Self; 2] = [Self::A, Self::B];
}

impl Register for AuxRegister {
    fn index(self) -> usize {
        self as usize
    }

    fn read_command(self) -> Command {
        Command::ReadAuxRegister(self)
    }
}

/// Status register groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRegister {
    A,
    B,
}

impl StatusRegister {
    pub const ALL: [Self; 2] = [Self::A, Self::B];
}

impl Register for StatusRegister {
    fn index(self) -> usize {
        self as usize
    }

    fn read_command(self) -> Command {
        Command::ReadStatusRegister(self)
    }
}

/// Which cell voltage register groups to read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellGroup {
    #[default]
    All,
    A,
    B,
    C,
    D,
}

impl CellGroup {
    pub fn registers(self) -> &'static [CellRegister] {
        match self {
            Self::All => &CellRegister::ALL,
            Self::A => &[CellRegister::A],
            Self::B => &[CellRegister::B],
            Self::C => &[CellRegister::C],
            Self::D => &[CellRegister::D],
        }
    }
}

impl TryFrom<u8> for CellGroup {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::A),
            2 => Ok(Self::B),
            3 => Ok(Self::C),
            4 => Ok(Self::D),
            _ => Err(Error::CellGroupOutOfRange(value)),
        }
    }
}

/// Which auxiliary register groups to read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuxGroup {
    #[default]
    All,
    A,
    B,
}

impl AuxGroup {
    pub fn registers(self) -> &'static [AuxRegister] {
        match self {
            Self::All => &AuxRegister::ALL,
            Self::A => &[AuxRegister::A],
            Self::B => &[AuxRegister::B],
        }
    }
}

impl TryFrom<u8> for AuxGroup {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::A),
            2 => Ok(Self::B),
            _ => Err(Error::AuxGroupOutOfRange(value)),
        }
    }
}

/// Which status register groups to read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusGroup {
    #[default]
    All,
    A,
    B,
}

impl StatusGroup {
    pub fn registers(self) -> &'static [StatusRegister] {
        match self {
            Self::All => &StatusRegister::ALL,
            Self::A => &[StatusRegister::A],
            Self::B => &[StatusRegister::B],
        }
    }
}

impl TryFrom<u8> for StatusGroup {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::All),
            1 => Ok(Self::A),
            2 => Ok(Self::B),
            _ => Err(Error::StatusGroupOutOfRange(value)),
        }
    }
}

impl fmt::Display for CellGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all cell groups"),
            group => write!(f, "cell group {group:?}"),
        }
    }
}

impl fmt::Display for AuxGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all auxiliary groups"),
            group => write!(f, "auxiliary group {group:?}"),
        }
    }
}

impl fmt::Display for StatusGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all status groups"),
            group => write!(f, "status group {group:?}"),
        }
    }
}

/// Conversion settings reused by every start-conversion command until changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AdcConfig {
    pub mode: AdcMode,
    pub discharge: DischargePermit,
    pub cell_channels: CellChannels,
    pub aux_channels: AuxChannels,
    pub status_channels: StatusChannels,
}

impl AdcConfig {
    /// ADCV with the mode, discharge permit and cell selection of this config.
    pub fn start_cell_conversion(&self) -> Command {
        Command::StartCellConversion {
            mode: self.mode,
            discharge: self.discharge,
            channels: self.cell_channels,
        }
    }

    /// ADAX with the mode and auxiliary selection of this config.
    pub fn start_aux_conversion(&self) -> Command {
        Command::StartAuxConversion {
            mode: self.mode,
            channels: self.aux_channels,
        }
    }

    /// ADSTAT with the mode and status selection of this config.
    pub fn start_status_conversion(&self) -> Command {
        Command::StartStatusConversion {
            mode: self.mode,
            channels: self.status_channels,
        }
    }
}

impl fmt::Display for AdcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode={}, {}, cells: {}, aux: {}, status: {}",
            self.mode, self.discharge, self.cell_channels, self.aux_channels, self.status_channels
        )
    }
}

/// Commands understood by the LTC6804-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// ADCV
    StartCellConversion {
        mode: AdcMode,
        discharge: DischargePermit,
        channels: CellChannels,
    },
    /// ADAX
    StartAuxConversion { mode: AdcMode, channels: AuxChannels },
    /// ADSTAT
    StartStatusConversion {
        mode: AdcMode,
        channels: StatusChannels,
    },
    /// RDCVA..RDCVD
    ReadCellRegister(CellRegister),
    /// RDAUXA, RDAUXB
    ReadAuxRegister(AuxRegister),
    /// RDSTATA, RDSTATB
    ReadStatusRegister(StatusRegister),
    /// WRCFG
    WriteConfiguration,
    /// RDCFG
    ReadConfiguration,
    /// CLRCELL
    ClearCellRegisters,
    /// CLRAUX
    ClearAuxRegisters,
}

impl Command {
    /// The two opcode bytes of this command.
    pub fn opcode(&self) -> [u8; 2] {
        match *self {
            Self::StartCellConversion {
                mode,
                discharge,
                channels,
            } => [
                0x02 | mode.high_bit(),
                mode.low_bit() | 0x60 | ((discharge as u8) << 4) | channels as u8,
            ],
            Self::StartAuxConversion { mode, channels } => {
                [0x04 | mode.high_bit(), mode.low_bit() | 0x60 | channels as u8]
            }
            Self::StartStatusConversion { mode, channels } => {
                [0x04 | mode.high_bit(), mode.low_bit() | 0x68 | channels as u8]
            }
            Self::ReadCellRegister(register) => [0x00, 0x04 + 2 * register as u8],
            Self::ReadAuxRegister(register) => [0x00, 0x0C + 2 * register as u8],
            Self::ReadStatusRegister(register) => [0x00, 0x10 + 2 * register as u8],
            Self::WriteConfiguration => [0x00, 0x01],
            Self::ReadConfiguration => [0x00, 0x02],
            Self::ClearCellRegisters => [0x07, 0x11],
            Self::ClearAuxRegisters => [0x07, 0x12],
        }
    }

    /// Builds the command frame, opcode followed by its PEC.
    pub fn frame(&self) -> CommandFrame {
        CommandFrame::new(self.opcode())
    }

    /// Identifies the command carried by an opcode, if it is one of ours.
    pub fn decode(opcode: [u8; 2]) -> Option<Self> {
        let word = u16::from_be_bytes(opcode);
        let fixed = match word {
            0x0001 => Some(Self::WriteConfiguration),
            0x0002 => Some(Self::ReadConfiguration),
            0x0004 => Some(Self::ReadCellRegister(CellRegister::A)),
            0x0006 => Some(Self::ReadCellRegister(CellRegister::B)),
            0x0008 => Some(Self::ReadCellRegister(CellRegister::C)),
            0x000A => Some(Self::ReadCellRegister(CellRegister::D)),
            0x000C => Some(Self::ReadAuxRegister(AuxRegister::A)),
            0x000E => Some(Self::ReadAuxRegister(AuxRegister::B)),
            0x0010 => Some(Self::ReadStatusRegister(StatusRegister::A)),
            0x0012 => Some(Self::ReadStatusRegister(StatusRegister::B)),
            0x0711 => Some(Self::ClearCellRegisters),
            0x0712 => Some(Self::ClearAuxRegisters),
            _ => None,
        };
        if fixed.is_some() {
            return fixed;
        }

        // Conversion commands: strip MD[1:0] (bits 8 and 7) and match the rest.
        let mode = AdcMode::try_from(((word >> 7) & 0x03) as u8).ok()?;
        let base = word & !0x0180;
        let selection = (base & 0x07) as u8;
        if base & !0x0017 == 0x0260 {
            Some(Self::StartCellConversion {
                mode,
                discharge: DischargePermit::from(base & 0x10 != 0),
                channels: CellChannels::try_from(selection).ok()?,
            })
        } else if base & !0x0007 == 0x0460 {
            Some(Self::StartAuxConversion {
                mode,
                channels: AuxChannels::try_from(selection).ok()?,
            })
        } else if base & !0x0007 == 0x0468 {
            Some(Self::StartStatusConversion {
                mode,
                channels: StatusChannels::try_from(selection).ok()?,
            })
        } else {
            None
        }
    }

    /// Datasheet mnemonic.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::StartCellConversion { .. } => "ADCV",
            Self::StartAuxConversion { .. } => "ADAX",
            Self::StartStatusConversion { .. } => "ADSTAT",
            Self::ReadCellRegister(CellRegister::A) => "RDCVA",
            Self::ReadCellRegister(CellRegister::B) => "RDCVB",
            Self::ReadCellRegister(CellRegister::C) => "RDCVC",
            Self::ReadCellRegister(CellRegister::D) => "RDCVD",
            Self::ReadAuxRegister(AuxRegister::A) => "RDAUXA",
            Self::ReadAuxRegister(AuxRegister::B) => "RDAUXB",
            Self::ReadStatusRegister(StatusRegister::A) => "RDSTATA",
            Self::ReadStatusRegister(StatusRegister::B) => "RDSTATB",
            Self::WriteConfiguration => "WRCFG",
            Self::ReadConfiguration => "RDCFG",
            Self::ClearCellRegisters => "CLRCELL",
            Self::ClearAuxRegisters => "CLRAUX",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartCellConversion {
                mode,
                discharge,
                channels,
            } => write!(f, "ADCV ({mode}, {discharge}, {channels})"),
            Self::StartAuxConversion { mode, channels } => {
                write!(f, "ADAX ({mode}, {channels})")
            }
            Self::StartStatusConversion { mode, channels } => {
                write!(f, "ADSTAT ({mode}, {channels})")
            }
            other => write!(f, "{}", other.mnemonic()),
        }
    }
}

/// A complete 4-byte command: opcode followed by its PEC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame([u8; COMMAND_LEN]);

impl CommandFrame {
    pub fn new(opcode: [u8; 2]) -> Self {
        let [pec_high, pec_low] = pec::to_bytes(pec::compute(&opcode));
        Self([opcode[0], opcode[1], pec_high, pec_low])
    }

    /// Wraps raw bytes received from the bus without checking them.
    pub fn from_bytes(bytes: [u8; COMMAND_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }

    pub fn opcode(&self) -> [u8; 2] {
        [self.0[0], self.0[1]]
    }

    pub fn pec(&self) -> u16 {
        pec::from_bytes([self.0[2], self.0[3]])
    }

    /// Whether the trailing PEC matches the opcode.
    pub fn is_valid(&self) -> bool {
        pec::verify(&self.opcode(), self.pec())
    }

    /// The command carried by this frame, if its PEC is valid and the opcode known.
    pub fn command(&self) -> Option<Command> {
        if self.is_valid() {
            Command::decode(self.opcode())
        } else {
            None
        }
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} {:02X} {:02X} {:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Splits a register payload into its three little-endian codes.
pub fn decode_codes(payload: &[u8; REGISTER_PAYLOAD_LEN]) -> [u16; CODES_PER_REGISTER] {
    [
        u16::from_le_bytes([payload[0], payload[1]]),
        u16::from_le_bytes([payload[2], payload[3]]),
        u16::from_le_bytes([payload[4], payload[5]]),
    ]
}

/// Packs three codes into a register payload, as a device sends them.
pub fn encode_codes(codes: &[u16; CODES_PER_REGISTER]) -> [u8; REGISTER_PAYLOAD_LEN] {
    let mut payload = [0u8; REGISTER_PAYLOAD_LEN];
    for (chunk, code) in payload.chunks_exact_mut(2).zip(codes) {
        chunk.copy_from_slice(&code.to_le_bytes());
    }
    payload
}

/// Converts a cell voltage code to volts.
pub fn cell_code_to_volts(code: u16) -> f32 {
    code as f32 * CELL_VOLTS_PER_LSB
}

/// Converts volts to the nearest cell voltage code, saturating at the code range.
pub fn volts_to_cell_code(volts: f32) -> u16 {
    (volts / CELL_VOLTS_PER_LSB).round().clamp(0.0, u16::MAX as f32) as u16
}

/// Parses a configuration block written as 12 hex digits, e.g. `FE0000000000`.
pub fn parse_configuration_block(s: &str) -> Result<ConfigurationBlock, Error> {
    let digits: String = s.chars().filter(|c| !matches!(c, ' ' | ':' | '_')).collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);
    if digits.len() != 2 * REGISTER_PAYLOAD_LEN
        || !digits.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(Error::InvalidConfigurationBlock(s.to_string()));
    }
    let mut block = [0u8; REGISTER_PAYLOAD_LEN];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[2 * i..2 * i + 2], 16)
            .map_err(|_| Error::InvalidConfigurationBlock(s.to_string()))?;
    }
    Ok(block)
}
