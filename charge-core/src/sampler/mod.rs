//! Analog sampling of the port's sense pin and bus voltage.
//!
//! [`AnalogSampler`] owns the GPADC drive configuration and turns raw register
//! pairs into engineering units. It never sleeps: after a mode change the
//! caller waits out the settle delay, which lets a burst pay that delay once
//! instead of per sample. Bursts go through [`Burst`], which shares the sampler
//! behind an async mutex and only holds it for one sample at a time.

mod burst;

pub use burst::{Burst, BurstPlan, CancelToken};

use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;

use crate::transport::registers::{self, FULL_SCALE, Reg};
use crate::transport::{RegisterTransport, TransportError};

/// Sampler shared between the water detector and the HV negotiator.
pub type SharedSampler<M, T> = Mutex<M, AnalogSampler<T>>;

/// GPADC drive configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdcMode {
    /// Converter idle; no drive on the sense pin.
    #[default]
    None,
    /// Current source enabled; the result reflects pin resistance.
    ResistanceMode,
    /// High-impedance measurement of pin voltage.
    VoltageMode,
}

impl AdcMode {
    const fn register_value(self) -> u8 {
        match self {
            AdcMode::None => registers::ADC_MODE_NONE,
            AdcMode::ResistanceMode => registers::ADC_MODE_RESISTANCE,
            AdcMode::VoltageMode => registers::ADC_MODE_VOLTAGE,
        }
    }
}

/// Comparator hysteresis applied to the GPADC threshold interrupt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HysteresisLevel(pub u8);

impl HysteresisLevel {
    /// Narrow band used while idle so a droplet raises an interrupt quickly.
    pub const NARROW: HysteresisLevel = HysteresisLevel(1);
    /// Wide band used while checking so sampling noise does not re-trigger.
    pub const WIDE: HysteresisLevel = HysteresisLevel(3);
}

/// Sampler configuration; only mutated through [`AnalogSampler`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SamplerConfig {
    pub mode: AdcMode,
    pub hysteresis_level: HysteresisLevel,
}

/// Physical quantity a sample measures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleChannel {
    /// Sense-pin resistance in kΩ.
    SenseResistance,
    /// Sense-pin voltage in mV.
    SenseVoltage,
    /// Bus voltage in mV.
    BusVoltage,
}

impl SampleChannel {
    /// Drive mode that must be active for this channel.
    #[must_use]
    pub const fn mode(self) -> AdcMode {
        match self {
            SampleChannel::SenseResistance => AdcMode::ResistanceMode,
            SampleChannel::SenseVoltage | SampleChannel::BusVoltage => AdcMode::VoltageMode,
        }
    }

    const fn result_registers(self) -> (Reg, Reg) {
        match self {
            SampleChannel::SenseResistance | SampleChannel::SenseVoltage => {
                (registers::SENSE_RESULT_H, registers::SENSE_RESULT_L)
            }
            SampleChannel::BusVoltage => (registers::VBUS_RESULT_H, registers::VBUS_RESULT_L),
        }
    }
}

/// One converted ADC read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MeasurementSample<Instant> {
    /// Raw conversion code.
    pub code: u16,
    /// Resistance in kΩ or voltage in mV, depending on the channel.
    pub value: i32,
    pub timestamp: Instant,
}

/// Why a sample or burst could not produce a verdict.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InconclusiveReason {
    /// Raw code fell in the converter's known-invalid window.
    InvalidCode,
    /// The port detached or reattached while sampling.
    Detached,
    /// Power removal was signalled while sampling.
    PowerLost,
    /// Another user kept switching the drive mode underneath the burst.
    ModeContention,
}

impl fmt::Display for InconclusiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InconclusiveReason::InvalidCode => f.write_str("invalid conversion code"),
            InconclusiveReason::Detached => f.write_str("port detached"),
            InconclusiveReason::PowerLost => f.write_str("power removed"),
            InconclusiveReason::ModeContention => f.write_str("ADC mode contention"),
        }
    }
}

/// Sampling failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleError {
    Transport(TransportError),
    Inconclusive(InconclusiveReason),
}

impl SampleError {
    /// Returns the inconclusive reason, if any.
    #[must_use]
    pub const fn reason(self) -> Option<InconclusiveReason> {
        match self {
            SampleError::Inconclusive(reason) => Some(reason),
            SampleError::Transport(_) => None,
        }
    }
}

impl From<TransportError> for SampleError {
    fn from(error: TransportError) -> Self {
        SampleError::Transport(error)
    }
}

impl From<InconclusiveReason> for SampleError {
    fn from(reason: InconclusiveReason) -> Self {
        SampleError::Inconclusive(reason)
    }
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::Transport(err) => write!(f, "transport: {err}"),
            SampleError::Inconclusive(reason) => write!(f, "inconclusive: {reason}"),
        }
    }
}

/// Pull-up resistance of the sense divider in kΩ.
pub const PULL_UP_KOHM: i64 = 1_000;
/// Sense-pin voltage at full scale in mV.
pub const SENSE_FULL_SCALE_MV: i64 = 1_800;
/// Bus voltage at full scale in mV (after the on-chip 1:8 divider).
pub const BUS_FULL_SCALE_MV: i64 = 14_400;
/// Codes at or above this are saturated in resistance mode.
pub const SATURATION_CODE: u16 = FULL_SCALE - 2;
/// Codes at or below this never come out of a healthy conversion.
pub const INVALID_CODE_MAX: u16 = 3;

/// Converts a resistance-mode code with the divider quotient.
///
/// Saturated codes clamp to the resistance of [`SATURATION_CODE`] - 1 instead
/// of dividing by (nearly) zero.
#[must_use]
pub fn code_to_kohm(code: u16) -> i32 {
    let code = code.min(SATURATION_CODE - 1);
    let numerator = i64::from(code) * PULL_UP_KOHM;
    let denominator = i64::from(FULL_SCALE - code);
    i32::try_from(numerator / denominator).unwrap_or(i32::MAX)
}

/// Converts a voltage-mode code linearly against `full_scale_mv`.
#[must_use]
pub fn code_to_millivolts(code: u16, full_scale_mv: i64) -> i32 {
    let code = code.min(FULL_SCALE);
    let scaled = i64::from(code) * full_scale_mv / i64::from(FULL_SCALE);
    i32::try_from(scaled).unwrap_or(i32::MAX)
}

/// Register-level GPADC access.
pub struct AnalogSampler<T> {
    transport: T,
    config: SamplerConfig,
    config_writes: u32,
}

impl<T> AnalogSampler<T> {
    /// Wraps `transport`. The chip is assumed to power up idle.
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            config: SamplerConfig {
                mode: AdcMode::None,
                hysteresis_level: HysteresisLevel(0),
            },
            config_writes: 0,
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> SamplerConfig {
        self.config
    }

    /// Number of configuration register writes issued so far.
    #[must_use]
    pub fn config_writes(&self) -> u32 {
        self.config_writes
    }

    /// Direct transport access for non-ADC registers on the same chip.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Releases the transport.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: RegisterTransport> AnalogSampler<T> {
    /// Switches the drive mode.
    ///
    /// Returns `true` when a register write happened, in which case the
    /// caller owes the mode's settle delay before sampling.
    ///
    /// # Errors
    ///
    /// Propagates the transport error of the mode write.
    pub async fn set_mode(&mut self, mode: AdcMode) -> Result<bool, TransportError> {
        if self.config.mode == mode {
            return Ok(false);
        }

        self.transport
            .write(registers::ADC_CTRL, mode.register_value())
            .await?;
        self.config.mode = mode;
        self.config_writes = self.config_writes.wrapping_add(1);
        trace!("sampler: mode -> {:?}", mode);
        Ok(true)
    }

    /// Sets the threshold hysteresis. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates the transport error of the hysteresis write.
    pub async fn set_hysteresis(&mut self, level: HysteresisLevel) -> Result<bool, TransportError> {
        if self.config.hysteresis_level == level {
            return Ok(false);
        }

        self.transport.write(registers::ADC_HYST, level.0).await?;
        self.config.hysteresis_level = level;
        self.config_writes = self.config_writes.wrapping_add(1);
        Ok(true)
    }

    /// Reads and converts one sample of `channel`.
    ///
    /// The channel's drive mode must already be active.
    ///
    /// # Errors
    ///
    /// [`SampleError::Transport`] when a register read fails and
    /// [`SampleError::Inconclusive`] for a code in the invalid band.
    pub async fn sample<I>(
        &mut self,
        channel: SampleChannel,
        timestamp: I,
    ) -> Result<MeasurementSample<I>, SampleError> {
        if self.config.mode != channel.mode() {
            return Err(SampleError::Inconclusive(InconclusiveReason::ModeContention));
        }

        let (high, low) = channel.result_registers();
        let code = self.transport.read_pair(high, low).await? & FULL_SCALE;

        let value = match channel {
            SampleChannel::SenseResistance => {
                if code <= INVALID_CODE_MAX {
                    return Err(SampleError::Inconclusive(InconclusiveReason::InvalidCode));
                }
                code_to_kohm(code)
            }
            SampleChannel::SenseVoltage => code_to_millivolts(code, SENSE_FULL_SCALE_MV),
            SampleChannel::BusVoltage => code_to_millivolts(code, BUS_FULL_SCALE_MV),
        };

        Ok(MeasurementSample {
            code,
            value,
            timestamp,
        })
    }

    /// One sense-pin resistance sample.
    ///
    /// # Errors
    ///
    /// As [`Self::sample`].
    pub async fn sample_resistance<I>(
        &mut self,
        timestamp: I,
    ) -> Result<MeasurementSample<I>, SampleError> {
        self.sample(SampleChannel::SenseResistance, timestamp).await
    }

    /// One sense-pin voltage sample.
    ///
    /// # Errors
    ///
    /// As [`Self::sample`].
    pub async fn sample_voltage<I>(
        &mut self,
        timestamp: I,
    ) -> Result<MeasurementSample<I>, SampleError> {
        self.sample(SampleChannel::SenseVoltage, timestamp).await
    }

    /// One bus-voltage sample.
    ///
    /// # Errors
    ///
    /// As [`Self::sample`].
    pub async fn sample_bus_voltage<I>(
        &mut self,
        timestamp: I,
    ) -> Result<MeasurementSample<I>, SampleError> {
        self.sample(SampleChannel::BusVoltage, timestamp).await
    }
}

/// Creates a shared sampler behind an async mutex.
#[must_use]
pub const fn shared<M: RawMutex, T>(transport: T) -> SharedSampler<M, T> {
    Mutex::new(AnalogSampler::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedChip;
    use embassy_futures::block_on;

    #[test]
    fn resistance_conversion_follows_divider_quotient() {
        // Half scale means the sense resistance equals the pull-up.
        assert_eq!(code_to_kohm(FULL_SCALE / 2 + 1), 1_000);
        assert_eq!(code_to_kohm(410), 111);
    }

    #[test]
    fn saturated_codes_clamp_just_inside_max() {
        let clamped = code_to_kohm(SATURATION_CODE - 1);
        assert_eq!(code_to_kohm(FULL_SCALE), clamped);
        assert_eq!(code_to_kohm(SATURATION_CODE), clamped);
        assert!(clamped > 0);
    }

    #[test]
    fn voltage_conversion_is_linear() {
        assert_eq!(code_to_millivolts(0, SENSE_FULL_SCALE_MV), 0);
        assert_eq!(code_to_millivolts(FULL_SCALE, SENSE_FULL_SCALE_MV), 1_800);
        assert_eq!(code_to_millivolts(FULL_SCALE, BUS_FULL_SCALE_MV), 14_400);
    }

    #[test]
    fn set_mode_twice_writes_once() {
        let chip = ScriptedChip::new();
        let mut sampler = AnalogSampler::new(&chip);

        block_on(async {
            assert_eq!(sampler.set_mode(AdcMode::ResistanceMode).await, Ok(true));
            assert_eq!(sampler.set_mode(AdcMode::ResistanceMode).await, Ok(false));
        });

        assert_eq!(sampler.config_writes(), 1);
        assert_eq!(chip.writes_to(registers::ADC_CTRL), 1);
    }

    #[test]
    fn set_hysteresis_is_idempotent() {
        let chip = ScriptedChip::new();
        let mut sampler = AnalogSampler::new(&chip);

        block_on(async {
            assert_eq!(sampler.set_hysteresis(HysteresisLevel::WIDE).await, Ok(true));
            assert_eq!(sampler.set_hysteresis(HysteresisLevel::WIDE).await, Ok(false));
        });

        assert_eq!(chip.writes_to(registers::ADC_HYST), 1);
        assert_eq!(sampler.config().hysteresis_level, HysteresisLevel::WIDE);
    }

    #[test]
    fn sampling_in_wrong_mode_is_contention() {
        let chip = ScriptedChip::new();
        let mut sampler = AnalogSampler::new(&chip);

        let result = block_on(sampler.sample_voltage(0u32));
        assert_eq!(
            result,
            Err(SampleError::Inconclusive(InconclusiveReason::ModeContention))
        );
    }

    #[test]
    fn invalid_resistance_code_is_inconclusive() {
        let chip = ScriptedChip::new();
        chip.push_sense_code(2);
        let mut sampler = AnalogSampler::new(&chip);

        let result = block_on(async {
            sampler.set_mode(AdcMode::ResistanceMode).await?;
            sampler.sample_resistance(0u32).await
        });
        assert_eq!(
            result,
            Err(SampleError::Inconclusive(InconclusiveReason::InvalidCode))
        );
    }

    #[test]
    fn transport_failure_surfaces_as_transport_error() {
        let chip = ScriptedChip::new();
        let mut sampler = AnalogSampler::new(&chip);
        block_on(sampler.set_mode(AdcMode::VoltageMode)).expect("mode write");
        chip.fail_reads(true);

        let result = block_on(sampler.sample_bus_voltage(0u32));
        assert_eq!(result, Err(SampleError::Transport(TransportError::Bus)));
    }
}
