//! Edge-triggered inputs from the port controller and the power path.

use charge_core::port::{Attachment, PortEvent, PortIrq};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::Input;
use embassy_time::{Duration, Timer};

use crate::port::FirmwarePort;

const VBUS_DEBOUNCE: Duration = Duration::from_millis(20);

/// Active-low GPADC threshold interrupt.
#[embassy_executor::task]
pub async fn gpadc(port: &'static FirmwarePort, mut line: ExtiInput<'static>) -> ! {
    loop {
        line.wait_for_falling_edge().await;
        port.on_irq(PortIrq::Gpadc);
    }
}

/// Active-low "mping answered" interrupt.
#[embassy_executor::task]
pub async fn ping(port: &'static FirmwarePort, mut line: ExtiInput<'static>) -> ! {
    loop {
        line.wait_for_falling_edge().await;
        port.on_irq(PortIrq::PingReady);
    }
}

/// Tracks VBUS and turns stable edges into attach/detach events. The DCP
/// strap is sampled once VBUS has settled.
#[embassy_executor::task]
pub async fn vbus(
    port: &'static FirmwarePort,
    mut sense: ExtiInput<'static>,
    dcp: Input<'static>,
) -> ! {
    let mut present = false;
    loop {
        let now_present = sense.is_high();
        if now_present != present {
            present = now_present;
            port.on_vbus(present);
            if present {
                let is_dcp = dcp.is_high();
                defmt::info!("vbus: present (dcp={})", is_dcp);
                if is_dcp {
                    port.on_charger_ready();
                }
                port.on_port_event(PortEvent::Attached(Attachment::sink(is_dcp)));
            } else {
                defmt::info!("vbus: removed");
                port.on_port_event(PortEvent::Detached);
            }
        }

        sense.wait_for_any_edge().await;
        Timer::after(VBUS_DEBOUNCE).await;
    }
}

/// Supervisor output: low while the main rail is gone.
#[embassy_executor::task]
pub async fn power_fail(port: &'static FirmwarePort, mut line: ExtiInput<'static>) -> ! {
    loop {
        line.wait_for_low().await;
        defmt::warn!("power: rail lost");
        port.on_power_removal();
        line.wait_for_high().await;
        defmt::info!("power: rail restored");
        port.on_power_restored();
    }
}
