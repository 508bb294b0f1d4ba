//! A driver for daisy chains of LTC6804-1 multicell battery monitors.
//!
//! The LTC6804-1 measures up to 12 series cells. Several devices are chained
//! over isoSPI and addressed all at once: every command is broadcast, and a
//! read returns one register block per device. Every command and every block
//! carries a 15-bit PEC that the driver computes and checks.
//!
//! The crate is layered the same way the chain is driven:
//!
//! 1.  **High-Level Monitor**: [`monitor::Monitor`] owns the bus, keeps the ADC
//!     settings between calls and turns start-conversion plus read-back into a
//!     single call, re-reading (never re-converting) when a PEC does not match.
//!     This is the recommended entry point.
//!
//! 2.  **Low-Level, Stateless Functions**: [`chain::DaisyChain`] maps one
//!     function to one command. PEC mismatches are reported per device and
//!     never retried.
//!
//! ## Features
//!
//! - **Protocol Implementation**: Command encoding and register layout in [`protocol`], PEC in [`pec`].
//! - **Transport Agnostic**: Anything implementing [`transport::Transport`] can carry the chain.
//! - **`embedded-hal` Support**: `SpiTransport` over any `embedded-hal` 1.0 SPI bus (feature `embedded-hal`).
//! - **Simulator**: A byte-accurate software chain with fault injection (feature `sim`).
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "sim")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use ltc6804_lib::{monitor::Monitor, protocol::DeviceCount, sim::SimulatedChain};
//!
//! let devices = DeviceCount::new(2)?;
//! let mut monitor = Monitor::new(SimulatedChain::new(devices), devices);
//!
//! let voltages = monitor.sample_voltages()?;
//! println!("Pack voltage: {:.3} V", voltages.total());
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sim"))]
//! # fn main() {}
//! ```

pub mod chain;
pub mod error;
pub mod monitor;
pub mod pec;
pub mod protocol;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "sim")))]
#[cfg(feature = "sim")]
pub mod sim;

pub use error::{Error, Result};
