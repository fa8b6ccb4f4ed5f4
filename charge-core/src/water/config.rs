//! Water detector tuning.
//!
//! Every threshold, debounce count and interval lives in [`DetectorConfig`],
//! handed to the detector at construction and changed only through validated
//! setters. Values that would invert a band or leave the converter's range
//! are rejected as they are; nothing is clamped into range.

use core::fmt;
use core::time::Duration;

use crate::sampler::SENSE_FULL_SCALE_MV;

/// Upper bound on sampling loops per burst.
pub const MAX_LOOPS: u8 = 16;
/// Longest accepted timer interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(3_600);

/// Detection strictness.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaterSensitivity {
    Low,
    #[default]
    Middle,
    High,
}

impl WaterSensitivity {
    pub const ALL: [WaterSensitivity; 3] = [
        WaterSensitivity::Low,
        WaterSensitivity::Middle,
        WaterSensitivity::High,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            WaterSensitivity::Low => "low",
            WaterSensitivity::Middle => "middle",
            WaterSensitivity::High => "high",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.name() == name)
    }
}

impl fmt::Display for WaterSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Qualifying samples required per sensitivity level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DebounceCounts {
    pub low: u8,
    pub middle: u8,
    pub high: u8,
}

impl DebounceCounts {
    #[must_use]
    pub const fn for_level(&self, level: WaterSensitivity) -> u8 {
        match level {
            WaterSensitivity::Low => self.low,
            WaterSensitivity::Middle => self.middle,
            WaterSensitivity::High => self.high,
        }
    }

    fn slot_mut(&mut self, level: WaterSensitivity) -> &mut u8 {
        match level {
            WaterSensitivity::Low => &mut self.low,
            WaterSensitivity::Middle => &mut self.middle,
            WaterSensitivity::High => &mut self.high,
        }
    }
}

/// Thresholds adjustable by name from the console.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThresholdKey {
    WetResistanceMin,
    WetResistanceMax,
    DryResistanceMin,
    WetVoltageMax,
    DryVoltageMin,
    LongMonitorIntervalMs,
    Water1HoldMs,
}

impl ThresholdKey {
    pub const ALL: [ThresholdKey; 7] = [
        ThresholdKey::WetResistanceMin,
        ThresholdKey::WetResistanceMax,
        ThresholdKey::DryResistanceMin,
        ThresholdKey::WetVoltageMax,
        ThresholdKey::DryVoltageMin,
        ThresholdKey::LongMonitorIntervalMs,
        ThresholdKey::Water1HoldMs,
    ];

    /// Console name of the key.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ThresholdKey::WetResistanceMin => "wet-kohm-min",
            ThresholdKey::WetResistanceMax => "wet-kohm-max",
            ThresholdKey::DryResistanceMin => "dry-kohm-min",
            ThresholdKey::WetVoltageMax => "wet-mv-max",
            ThresholdKey::DryVoltageMin => "dry-mv-min",
            ThresholdKey::LongMonitorIntervalMs => "monitor-ms",
            ThresholdKey::Water1HoldMs => "water1-hold-ms",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }
}

impl fmt::Display for ThresholdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rejected configuration change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    InvalidConfiguration { field: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidConfiguration { field } => {
                write!(f, "invalid configuration value for {field}")
            }
        }
    }
}

const fn invalid(field: &'static str) -> ConfigError {
    ConfigError::InvalidConfiguration { field }
}

/// Water detector configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Samples per burst.
    pub loops: u8,
    pub sensitivity: WaterSensitivity,
    pub debounce: DebounceCounts,
    /// Inclusive wet resistance band in kΩ.
    pub wet_resistance_min_kohm: i32,
    pub wet_resistance_max_kohm: i32,
    /// Resistance at or above which a sample counts as dry.
    pub dry_resistance_min_kohm: i32,
    /// Voltage at or below which a confirm sample counts as wet.
    pub wet_voltage_max_mv: i32,
    /// Voltage at or above which a confirm sample counts as dry.
    pub dry_voltage_min_mv: i32,
    pub resistance_settle: Duration,
    pub voltage_settle: Duration,
    pub inter_sample: Duration,
    /// Mode re-establishments a burst tolerates before giving up.
    pub resettle_limit: u8,
    /// Extra attempts for a burst that failed on transport or an invalid code.
    pub burst_retry_limit: u8,
    pub burst_retry_delay: Duration,
    /// Delay before re-running an inconclusive check.
    pub recheck_delay: Duration,
    /// Time spent in `Water1Idle` before long-term monitoring.
    pub water1_hold: Duration,
    /// Dry-check period while in `Water2Idle`.
    pub long_monitor_interval: Duration,
    /// Run a wet check on every attach.
    pub check_on_attach: bool,
    /// Spacing of the wet checks in a factory water test.
    pub factory_check_interval: Duration,
    /// Wet checks a factory water test runs before reporting nothing.
    pub factory_check_limit: u8,
}

impl DetectorConfig {
    pub const DEFAULT: DetectorConfig = DetectorConfig {
        loops: 5,
        sensitivity: WaterSensitivity::Middle,
        debounce: DebounceCounts {
            low: 4,
            middle: 3,
            high: 2,
        },
        wet_resistance_min_kohm: 20,
        wet_resistance_max_kohm: 500,
        dry_resistance_min_kohm: 800,
        wet_voltage_max_mv: 600,
        dry_voltage_min_mv: 1_000,
        resistance_settle: Duration::from_millis(300),
        voltage_settle: Duration::from_millis(20),
        inter_sample: Duration::from_millis(10),
        resettle_limit: 2,
        burst_retry_limit: 3,
        burst_retry_delay: Duration::from_millis(50),
        recheck_delay: Duration::from_secs(1),
        water1_hold: Duration::from_secs(30),
        long_monitor_interval: Duration::from_secs(10),
        check_on_attach: true,
        factory_check_interval: Duration::from_millis(500),
        factory_check_limit: 14,
    };

    /// Debounce count for the active sensitivity.
    #[must_use]
    pub const fn threshold(&self) -> u8 {
        self.debounce.for_level(self.sensitivity)
    }

    /// Checks every cross-field invariant.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] naming the first field
    /// that breaks an invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loops == 0 || self.loops > MAX_LOOPS {
            return Err(invalid("loops"));
        }
        for level in WaterSensitivity::ALL {
            let count = self.debounce.for_level(level);
            if count == 0 || count > self.loops {
                return Err(invalid("debounce"));
            }
        }
        if self.wet_resistance_min_kohm < 0 {
            return Err(invalid(ThresholdKey::WetResistanceMin.name()));
        }
        if self.wet_resistance_max_kohm <= self.wet_resistance_min_kohm {
            return Err(invalid(ThresholdKey::WetResistanceMax.name()));
        }
        if self.dry_resistance_min_kohm <= self.wet_resistance_max_kohm {
            return Err(invalid(ThresholdKey::DryResistanceMin.name()));
        }
        let full_scale = i32::try_from(SENSE_FULL_SCALE_MV).unwrap_or(i32::MAX);
        if self.wet_voltage_max_mv < 0 || self.wet_voltage_max_mv >= full_scale {
            return Err(invalid(ThresholdKey::WetVoltageMax.name()));
        }
        if self.dry_voltage_min_mv <= self.wet_voltage_max_mv
            || self.dry_voltage_min_mv > full_scale
        {
            return Err(invalid(ThresholdKey::DryVoltageMin.name()));
        }
        if !interval_ok(self.long_monitor_interval) {
            return Err(invalid(ThresholdKey::LongMonitorIntervalMs.name()));
        }
        if !interval_ok(self.water1_hold) {
            return Err(invalid(ThresholdKey::Water1HoldMs.name()));
        }
        if !interval_ok(self.recheck_delay) {
            return Err(invalid("recheck_delay"));
        }
        if !interval_ok(self.factory_check_interval) {
            return Err(invalid("factory_check_interval"));
        }
        if self.factory_check_limit == 0 {
            return Err(invalid("factory_check_limit"));
        }
        Ok(())
    }

    /// Returns a copy with `key` set to `value`, or the reason it is invalid.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] when the updated config
    /// no longer validates.
    pub fn with_threshold(&self, key: ThresholdKey, value: u32) -> Result<Self, ConfigError> {
        let mut next = *self;
        let as_i32 = || i32::try_from(value).map_err(|_| invalid(key.name()));
        match key {
            ThresholdKey::WetResistanceMin => next.wet_resistance_min_kohm = as_i32()?,
            ThresholdKey::WetResistanceMax => next.wet_resistance_max_kohm = as_i32()?,
            ThresholdKey::DryResistanceMin => next.dry_resistance_min_kohm = as_i32()?,
            ThresholdKey::WetVoltageMax => next.wet_voltage_max_mv = as_i32()?,
            ThresholdKey::DryVoltageMin => next.dry_voltage_min_mv = as_i32()?,
            ThresholdKey::LongMonitorIntervalMs => {
                next.long_monitor_interval = Duration::from_millis(u64::from(value));
            }
            ThresholdKey::Water1HoldMs => {
                next.water1_hold = Duration::from_millis(u64::from(value));
            }
        }
        next.validate()?;
        Ok(next)
    }

    /// Returns a copy with the debounce count of `level` replaced.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] when the updated config
    /// no longer validates.
    pub fn with_debounce(&self, level: WaterSensitivity, count: u8) -> Result<Self, ConfigError> {
        let mut next = *self;
        *next.debounce.slot_mut(level) = count;
        next.validate()?;
        Ok(next)
    }

    /// Current value of `key` in its console units.
    #[must_use]
    pub fn threshold_value(&self, key: ThresholdKey) -> u64 {
        let signed = |value: i32| u64::try_from(value).unwrap_or(0);
        match key {
            ThresholdKey::WetResistanceMin => signed(self.wet_resistance_min_kohm),
            ThresholdKey::WetResistanceMax => signed(self.wet_resistance_max_kohm),
            ThresholdKey::DryResistanceMin => signed(self.dry_resistance_min_kohm),
            ThresholdKey::WetVoltageMax => signed(self.wet_voltage_max_mv),
            ThresholdKey::DryVoltageMin => signed(self.dry_voltage_min_mv),
            ThresholdKey::LongMonitorIntervalMs => {
                u64::try_from(self.long_monitor_interval.as_millis()).unwrap_or(u64::MAX)
            }
            ThresholdKey::Water1HoldMs => {
                u64::try_from(self.water1_hold.as_millis()).unwrap_or(u64::MAX)
            }
        }
    }

    /// `true` when `kohm` lies in the wet band.
    #[must_use]
    pub fn is_wet_resistance(&self, kohm: i32) -> bool {
        (self.wet_resistance_min_kohm..=self.wet_resistance_max_kohm).contains(&kohm)
    }

    #[must_use]
    pub fn is_dry_resistance(&self, kohm: i32) -> bool {
        kohm >= self.dry_resistance_min_kohm
    }

    #[must_use]
    pub fn is_wet_voltage(&self, millivolts: i32) -> bool {
        millivolts <= self.wet_voltage_max_mv
    }

    #[must_use]
    pub fn is_dry_voltage(&self, millivolts: i32) -> bool {
        millivolts >= self.dry_voltage_min_mv
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn interval_ok(interval: Duration) -> bool {
    !interval.is_zero() && interval <= MAX_INTERVAL
}
