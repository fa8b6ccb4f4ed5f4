use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{Input, Pull};
use embassy_stm32::i2c::{self, I2c};
use embassy_stm32::time::Hertz;
use embassy_sync::channel::Channel;
use static_cell::StaticCell;

use charge_core::hv::{AnyProtocol, NegotiatorConfig, ProtocolKind};
use charge_core::port::PortCoordinator;
use charge_core::transport::I2cTransport;
use charge_core::water::DetectorConfig;

use crate::port::{FirmwareClock, FirmwarePort, NotificationQueue};

mod charger_task;
mod console_task;
mod irq_task;
mod port_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

const SENSE_I2C_FREQUENCY: Hertz = Hertz::khz(400);

embassy_stm32::bind_interrupts!(struct I2cIrqs {
    I2C1 => i2c::EventInterruptHandler<hal::peripherals::I2C1>, i2c::ErrorInterruptHandler<hal::peripherals::I2C1>;
});

pub(super) static NOTIFICATIONS: NotificationQueue = Channel::new();
static PORT: StaticCell<FirmwarePort> = StaticCell::new();

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        PA0,
        PA1,
        PA2,
        PA3,
        PB0,
        PB1,
        PB4,
        PB6,
        PB7,
        EXTI0,
        EXTI1,
        EXTI2,
        EXTI4,
        I2C1,
        DMA1_CH1,
        DMA1_CH2,
        USART5,
        ..
    } = hal::init(config);

    let mut i2c_config = i2c::Config::default();
    i2c_config.frequency = SENSE_I2C_FREQUENCY;
    let bus = I2c::new(I2C1, PB6, PB7, I2cIrqs, DMA1_CH1, DMA1_CH2, i2c_config);

    let port = match PortCoordinator::new(
        I2cTransport::new(bus),
        AnyProtocol::new(ProtocolKind::Afc),
        FirmwareClock,
        DetectorConfig::DEFAULT,
        NegotiatorConfig::DEFAULT,
    ) {
        Ok(port) => PORT.init(port),
        Err(err) => {
            defmt::error!("port: rejected configuration: {}", err);
            return;
        }
    };

    spawner
        .spawn(port_task::run(port, NOTIFICATIONS.sender()))
        .expect("failed to spawn port task");
    spawner
        .spawn(charger_task::run(NOTIFICATIONS.receiver()))
        .expect("failed to spawn charger task");

    spawner
        .spawn(irq_task::gpadc(port, ExtiInput::new(PA0, EXTI0, Pull::Up)))
        .expect("failed to spawn GPADC IRQ task");
    spawner
        .spawn(irq_task::ping(port, ExtiInput::new(PA1, EXTI1, Pull::Up)))
        .expect("failed to spawn ping IRQ task");
    spawner
        .spawn(irq_task::vbus(
            port,
            ExtiInput::new(PA2, EXTI2, Pull::Down),
            Input::new(PA3, Pull::Down),
        ))
        .expect("failed to spawn VBUS task");
    spawner
        .spawn(irq_task::power_fail(port, ExtiInput::new(PB4, EXTI4, Pull::Up)))
        .expect("failed to spawn power-fail task");

    spawner
        .spawn(console_task::run(port, USART5, PB0, PB1))
        .expect("failed to spawn console task");

    core::future::pending::<()>().await;
}
