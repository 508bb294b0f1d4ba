//! Bus access used by the daisy-chain driver.
//!
//! The driver never talks to hardware directly. Everything it needs from the
//! isoSPI port is behind the [`Transport`] trait: two wake pulses, chip-select
//! control and a write-then-read exchange. With the `embedded-hal` feature,
//! [`SpiTransport`] provides it on top of any `embedded-hal` 1.0 SPI bus,
//! chip-select pin and delay; the `sim` feature provides a software chain in
//! [`crate::sim`].

/// Raw byte access to the daisy chain.
///
/// A logical transaction is always `wake_stay_awake`, `select`, one
/// `exchange`, `deselect`, driven by [`crate::chain`].
pub trait Transport {
    /// Error reported by the underlying bus.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short pulse that keeps the isoSPI port from entering its idle state.
    fn wake_stay_awake(&mut self) -> Result<(), Self::Error>;

    /// Long pulse that brings every device on the chain out of sleep.
    fn wake_from_sleep(&mut self) -> Result<(), Self::Error>;

    /// Asserts chip-select.
    fn select(&mut self) -> Result<(), Self::Error>;

    /// Releases chip-select.
    fn deselect(&mut self) -> Result<(), Self::Error>;

    /// Writes all of `tx`, then reads `rx.len()` bytes within the same
    /// chip-select window. `rx` may be empty for write-only commands.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error>;
}

#[cfg(feature = "embedded-hal")]
pub use self::spi::{SpiTransport, SpiTransportError};

#[cfg(feature = "embedded-hal")]
mod spi {
    use super::Transport;
    use embedded_hal::delay::DelayNs;
    use embedded_hal::digital::OutputPin;
    use embedded_hal::spi::SpiBus;

    /// Chip-select low time that keeps the isoSPI port awake.
    pub const STAY_AWAKE_PULSE_US: u32 = 2;
    /// Chip-select low time that wakes the chain from sleep.
    pub const WAKE_FROM_SLEEP_PULSE_US: u32 = 1_000;
    /// Byte clocked out while reading a response.
    const FILL_BYTE: u8 = 0xFF;

    /// All possible errors of the SPI transport.
    #[derive(Debug, thiserror::Error)]
    pub enum SpiTransportError<S, P> {
        #[error("SPI bus error: {0:?}")]
        Spi(S),
        #[error("Chip-select pin error: {0:?}")]
        Pin(P),
    }

    /// LTC6804 daisy chain on an `embedded-hal` SPI bus with a GPIO chip-select.
    ///
    /// Chip-select is active low. The bus must be configured for SPI mode 3
    /// at no more than 1 MHz.
    #[derive(Debug)]
    pub struct SpiTransport<SPI, CS, D> {
        spi: SPI,
        cs: CS,
        delay: D,
    }

    impl<SPI, CS, D> SpiTransport<SPI, CS, D>
    where
        SPI: SpiBus<u8>,
        CS: OutputPin,
        D: DelayNs,
    {
        /// Creates a transport and parks chip-select high.
        pub fn new(
            spi: SPI,
            mut cs: CS,
            delay: D,
        ) -> Result<Self, SpiTransportError<SPI::Error, CS::Error>> {
            cs.set_high().map_err(SpiTransportError::Pin)?;
            Ok(Self { spi, cs, delay })
        }

        /// Gives back the bus, the pin and the delay.
        pub fn release(self) -> (SPI, CS, D) {
            (self.spi, self.cs, self.delay)
        }

        fn pulse(&mut self, low_us: u32) -> Result<(), SpiTransportError<SPI::Error, CS::Error>> {
            self.cs.set_low().map_err(SpiTransportError::Pin)?;
            self.delay.delay_us(low_us);
            self.cs.set_high().map_err(SpiTransportError::Pin)
        }
    }

    impl<SPI, CS, D> Transport for SpiTransport<SPI, CS, D>
    where
        SPI: SpiBus<u8>,
        SPI::Error: Send + Sync + 'static,
        CS: OutputPin,
        CS::Error: Send + Sync + 'static,
        D: DelayNs,
    {
        type Error = SpiTransportError<SPI::Error, CS::Error>;

        fn wake_stay_awake(&mut self) -> Result<(), Self::Error> {
            self.pulse(STAY_AWAKE_PULSE_US)
        }

        fn wake_from_sleep(&mut self) -> Result<(), Self::Error> {
            self.pulse(WAKE_FROM_SLEEP_PULSE_US)
        }

        fn select(&mut self) -> Result<(), Self::Error> {
            self.cs.set_low().map_err(SpiTransportError::Pin)
        }

        fn deselect(&mut self) -> Result<(), Self::Error> {
            self.cs.set_high().map_err(SpiTransportError::Pin)
        }

        fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
            self.spi.write(tx).map_err(SpiTransportError::Spi)?;
            if !rx.is_empty() {
                rx.fill(FILL_BYTE);
                self.spi.transfer_in_place(rx).map_err(SpiTransportError::Spi)?;
            }
            self.spi.flush().map_err(SpiTransportError::Spi)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::cell::RefCell;
        use std::convert::Infallible;
        use std::rc::Rc;

        #[derive(Debug, Clone, PartialEq)]
        enum Event {
            CsLow,
            CsHigh,
            Delay(u32),
            Write(Vec<u8>),
            Transfer(Vec<u8>),
            Flush,
        }

        type Log = Rc<RefCell<Vec<Event>>>;

        struct Bus(Log, u8);
        struct Pin(Log);
        struct Delay(Log);

        impl embedded_hal::spi::ErrorType for Bus {
            type Error = Infallible;
        }

        impl SpiBus<u8> for Bus {
            fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
                words.fill(self.1);
                Ok(())
            }
            fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
                self.0.borrow_mut().push(Event::Write(words.to_vec()));
                Ok(())
            }
            fn transfer(&mut self, read: &mut [u8], _write: &[u8]) -> Result<(), Infallible> {
                read.fill(self.1);
                Ok(())
            }
            fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
                self.0.borrow_mut().push(Event::Transfer(words.to_vec()));
                words.fill(self.1);
                Ok(())
            }
            fn flush(&mut self) -> Result<(), Infallible> {
                self.0.borrow_mut().push(Event::Flush);
                Ok(())
            }
        }

        impl embedded_hal::digital::ErrorType for Pin {
            type Error = Infallible;
        }

        impl OutputPin for Pin {
            fn set_low(&mut self) -> Result<(), Infallible> {
                self.0.borrow_mut().push(Event::CsLow);
                Ok(())
            }
            fn set_high(&mut self) -> Result<(), Infallible> {
                self.0.borrow_mut().push(Event::CsHigh);
                Ok(())
            }
        }

        impl DelayNs for Delay {
            fn delay_ns(&mut self, ns: u32) {
                self.0.borrow_mut().push(Event::Delay(ns / 1_000));
            }
            fn delay_us(&mut self, us: u32) {
                self.0.borrow_mut().push(Event::Delay(us));
            }
        }

        fn transport(answer: u8) -> (SpiTransport<Bus, Pin, Delay>, Log) {
            let log = Log::default();
            let transport = SpiTransport::new(
                Bus(log.clone(), answer),
                Pin(log.clone()),
                Delay(log.clone()),
            )
            .unwrap();
            log.borrow_mut().clear();
            (transport, log)
        }

        #[test]
        fn wake_pulses() {
            let (mut t, log) = transport(0);
            t.wake_stay_awake().unwrap();
            t.wake_from_sleep().unwrap();
            assert_eq!(
                *log.borrow(),
                vec![
                    Event::CsLow,
                    Event::Delay(STAY_AWAKE_PULSE_US),
                    Event::CsHigh,
                    Event::CsLow,
                    Event::Delay(WAKE_FROM_SLEEP_PULSE_US),
                    Event::CsHigh,
                ]
            );
        }

        #[test]
        fn exchange_writes_then_clocks_out_fill_bytes() {
            let (mut t, log) = transport(0x5A);
            let mut rx = [0u8; 3];
            t.exchange(&[0x00, 0x02, 0x2B, 0x0A], &mut rx).unwrap();
            assert_eq!(rx, [0x5A; 3]);
            assert_eq!(
                *log.borrow(),
                vec![
                    Event::Write(vec![0x00, 0x02, 0x2B, 0x0A]),
                    Event::Transfer(vec![0xFF; 3]),
                    Event::Flush,
                ]
            );
        }

        #[test]
        fn write_only_exchange_skips_transfer() {
            let (mut t, log) = transport(0);
            t.exchange(&[0x07, 0x11, 0xC9, 0xC0], &mut []).unwrap();
            assert_eq!(
                *log.borrow(),
                vec![Event::Write(vec![0x07, 0x11, 0xC9, 0xC0]), Event::Flush]
            );
        }
    }
}
