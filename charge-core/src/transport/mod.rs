//! Register transport seam.
//!
//! The control core never talks to a bus directly. Everything it needs from the
//! port chip goes through [`RegisterTransport`], one byte register at a time.
//! [`I2cTransport`] adapts any `embedded-hal-async` I2C bus to that seam.

pub mod registers;

use core::fmt;

use embedded_hal_async::i2c::{Error as _, ErrorKind, I2c};

pub use registers::Reg;

/// Register I/O failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The device did not acknowledge its address or the register byte.
    NoAcknowledge,
    /// Arbitration loss, bus error, or any other bus-level failure.
    Bus,
    /// The transport has no device behind it (detached or powered down).
    Unavailable,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoAcknowledge => f.write_str("register access not acknowledged"),
            TransportError::Bus => f.write_str("bus error during register access"),
            TransportError::Unavailable => f.write_str("register transport unavailable"),
        }
    }
}

/// Byte-wide register access to the port chip.
#[allow(async_fn_in_trait)]
pub trait RegisterTransport {
    /// Reads one register.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] the bus reported.
    async fn read(&mut self, reg: Reg) -> Result<u8, TransportError>;

    /// Writes one register.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] the bus reported.
    async fn write(&mut self, reg: Reg, value: u8) -> Result<(), TransportError>;

    /// Reads a big-endian register pair starting at `high`.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] the bus reported.
    async fn read_pair(&mut self, high: Reg, low: Reg) -> Result<u16, TransportError> {
        let msb = self.read(high).await?;
        let lsb = self.read(low).await?;
        Ok(u16::from_be_bytes([msb, lsb]))
    }
}

impl<T> RegisterTransport for &mut T
where
    T: RegisterTransport,
{
    async fn read(&mut self, reg: Reg) -> Result<u8, TransportError> {
        (**self).read(reg).await
    }

    async fn write(&mut self, reg: Reg, value: u8) -> Result<(), TransportError> {
        (**self).write(reg, value).await
    }
}

/// Default 7-bit address of the port chip's PM/MUIC block.
pub const DEFAULT_ADDRESS: u8 = 0x3c;

/// [`RegisterTransport`] over an async I2C bus.
pub struct I2cTransport<I> {
    bus: I,
    address: u8,
}

impl<I: I2c> I2cTransport<I> {
    /// Wraps `bus`, talking to the chip at [`DEFAULT_ADDRESS`].
    pub const fn new(bus: I) -> Self {
        Self::with_address(bus, DEFAULT_ADDRESS)
    }

    /// Wraps `bus`, talking to the chip at `address`.
    pub const fn with_address(bus: I, address: u8) -> Self {
        Self { bus, address }
    }

    /// Releases the underlying bus.
    #[must_use]
    pub fn into_inner(self) -> I {
        self.bus
    }
}

impl<I: I2c> RegisterTransport for I2cTransport<I> {
    async fn read(&mut self, reg: Reg) -> Result<u8, TransportError> {
        let mut buf = [0u8; 1];
        self.bus
            .write_read(self.address, core::slice::from_ref(&reg.to_u8()), &mut buf)
            .await
            .map_err(|err| classify(err.kind()))?;
        Ok(buf[0])
    }

    async fn write(&mut self, reg: Reg, value: u8) -> Result<(), TransportError> {
        self.bus
            .write(self.address, &[reg.to_u8(), value])
            .await
            .map_err(|err| classify(err.kind()))
    }
}

fn classify(kind: ErrorKind) -> TransportError {
    match kind {
        ErrorKind::NoAcknowledge(_) => TransportError::NoAcknowledge,
        _ => TransportError::Bus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embedded_hal_async::i2c::{ErrorType, NoAcknowledgeSource, Operation};

    #[derive(Debug)]
    struct BusError(ErrorKind);

    impl embedded_hal_async::i2c::Error for BusError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    /// Single-register fake bus that remembers the last write.
    struct FakeBus {
        registers: [u8; 256],
        fail: Option<ErrorKind>,
    }

    impl ErrorType for FakeBus {
        type Error = BusError;
    }

    impl I2c for FakeBus {
        async fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            assert_eq!(address, DEFAULT_ADDRESS);
            if let Some(kind) = self.fail {
                return Err(BusError(kind));
            }

            let mut pointer = 0usize;
            for operation in operations {
                match operation {
                    Operation::Write(bytes) => {
                        pointer = usize::from(bytes[0]);
                        if let Some(value) = bytes.get(1) {
                            self.registers[pointer] = *value;
                        }
                    }
                    Operation::Read(buffer) => {
                        for slot in buffer.iter_mut() {
                            *slot = self.registers[pointer];
                            pointer += 1;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn i2c_transport_round_trips_register_bytes() {
        let bus = FakeBus {
            registers: [0; 256],
            fail: None,
        };
        let mut transport = I2cTransport::new(bus);

        block_on(async {
            transport
                .write(registers::ADC_CTRL, 0x02)
                .await
                .expect("write should succeed");
            assert_eq!(transport.read(registers::ADC_CTRL).await, Ok(0x02));
        });
    }

    #[test]
    fn nack_maps_to_no_acknowledge() {
        let bus = FakeBus {
            registers: [0; 256],
            fail: Some(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
        };
        let mut transport = I2cTransport::new(bus);

        let result = block_on(transport.read(registers::SENSE_RESULT_H));
        assert_eq!(result, Err(TransportError::NoAcknowledge));
    }

    #[test]
    fn other_bus_failures_map_to_bus() {
        let bus = FakeBus {
            registers: [0; 256],
            fail: Some(ErrorKind::ArbitrationLoss),
        };
        let mut transport = I2cTransport::new(bus);

        let result = block_on(transport.write(registers::AFC_CTRL, 1));
        assert_eq!(result, Err(TransportError::Bus));
    }
}
