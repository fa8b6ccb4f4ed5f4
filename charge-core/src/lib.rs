#![no_std]

// Shared control logic for the charge-port liquid detection and HV negotiation
// feature set.
//
// Nothing here touches the standard library: firmware and host tooling both
// drive the same coordinator through the register transport and timing traits
// exposed below.

pub(crate) mod fmt;

#[cfg(test)]
mod testing;

pub mod console;
pub mod hv;
pub mod port;
pub mod sampler;
pub mod schedule;
pub mod telemetry;
pub mod transport;
pub mod water;
