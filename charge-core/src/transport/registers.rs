//! Logical register map of the port chip.
//!
//! Only the registers the control loop touches are listed. Values written to
//! the control registers are symbolic encodings owned by this crate; board
//! support code translating them to a specific silicon revision lives outside.

/// Register address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reg(pub u8);

impl Reg {
    pub const fn new(val: u8) -> Self {
        Reg(val)
    }

    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self.0
    }
}

/// GPADC drive selection (see [`ADC_MODE_NONE`] and friends).
pub const ADC_CTRL: Reg = Reg(0x50);
/// Interrupt threshold hysteresis for the GPADC comparator.
pub const ADC_HYST: Reg = Reg(0x51);
/// Sense-pin conversion result, high byte.
pub const SENSE_RESULT_H: Reg = Reg(0x52);
/// Sense-pin conversion result, low byte.
pub const SENSE_RESULT_L: Reg = Reg(0x53);
/// Bus-voltage conversion result, high byte.
pub const VBUS_RESULT_H: Reg = Reg(0x54);
/// Bus-voltage conversion result, low byte.
pub const VBUS_RESULT_L: Reg = Reg(0x55);

/// AFC block control: handshake ping and data-line reset.
pub const AFC_CTRL: Reg = Reg(0x60);
/// AFC voltage-select transmit byte.
pub const AFC_TX: Reg = Reg(0x61);
/// QC data-line level selection.
pub const QC_CTRL: Reg = Reg(0x63);

pub const ADC_MODE_NONE: u8 = 0x00;
pub const ADC_MODE_RESISTANCE: u8 = 0x01;
pub const ADC_MODE_VOLTAGE: u8 = 0x02;

/// Starts an AFC "mping" handshake probe.
pub const AFC_CTRL_PING: u8 = 0x01;
/// Returns D+/D- to plain DCP signalling.
pub const AFC_CTRL_RESET: u8 = 0x80;

/// AFC voltage-select codes (upper nibble voltage, lower nibble current).
pub const AFC_TX_5V: u8 = 0x08;
pub const AFC_TX_9V: u8 = 0x46;

/// QC data-line levels.
pub const QC_LEVEL_DCP: u8 = 0x00;
pub const QC_LEVEL_5V: u8 = 0x01;
pub const QC_LEVEL_9V: u8 = 0x02;

/// Width of a conversion result; results are right-aligned.
pub const RESULT_BITS: u32 = 12;
/// Largest conversion code.
pub const FULL_SCALE: u16 = (1 << RESULT_BITS) - 1;
