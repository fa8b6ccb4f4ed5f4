use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{BufferedUart, Config as UartConfig, DataBits, Parity, StopBits};
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use heapless::String;

use charge_core::console::CommandExecutor;

use crate::console::{ConsoleError, LineAssembler, PROMPT, REPLY_CAPACITY, respond};
use crate::port::FirmwarePort;

const CONSOLE_UART_BAUD: u32 = 115_200;
const CONSOLE_BUFFER_SIZE: usize = 256;

static mut UART_TX_BUFFER: [u8; CONSOLE_BUFFER_SIZE] = [0; CONSOLE_BUFFER_SIZE];
static mut UART_RX_BUFFER: [u8; CONSOLE_BUFFER_SIZE] = [0; CONSOLE_BUFFER_SIZE];

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART3_4_5_6_LPUART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART5>;
});

#[embassy_executor::task]
pub async fn run(
    port: &'static FirmwarePort,
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = CONSOLE_UART_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let uart = unsafe {
        BufferedUart::new(
            usart,
            rx_pin,
            tx_pin,
            &mut UART_TX_BUFFER,
            &mut UART_RX_BUFFER,
            UartIrqs,
            config,
        )
        .expect("failed to initialize console UART")
    };
    let (mut tx, mut rx) = uart.split();

    let mut executor = CommandExecutor::new(port);
    let mut assembler = LineAssembler::new();
    let mut reply: String<REPLY_CAPACITY> = String::new();
    let mut ingress = [0u8; 32];

    write_text(&mut tx, PROMPT).await;
    loop {
        let count = match rx.read(&mut ingress).await {
            Ok(count) => count,
            Err(_) => {
                defmt::warn!("console: UART read error");
                Timer::after(Duration::from_millis(5)).await;
                continue;
            }
        };

        for &byte in &ingress[..count] {
            match assembler.push(byte) {
                Ok(None) => continue,
                Ok(Some(line)) => respond(&mut executor, line, &mut reply),
                Err(err) => {
                    defmt::warn!("console: {}", err);
                    reply.clear();
                    let _ = reply.push_str(match err {
                        ConsoleError::LineOverflow => "error: line too long\n",
                        ConsoleError::InvalidUtf8 => "error: invalid utf-8\n",
                    });
                }
            }
            write_text(&mut tx, &reply).await;
            write_text(&mut tx, PROMPT).await;
        }
    }
}

/// Writes `text`, expanding bare LF to CRLF for serial terminals.
async fn write_text<W: Write>(tx: &mut W, text: &str) {
    for (index, segment) in text.split('\n').enumerate() {
        if index > 0 && tx.write_all(b"\r\n").await.is_err() {
            defmt::warn!("console: UART write error");
            return;
        }
        if tx.write_all(segment.as_bytes()).await.is_err() {
            defmt::warn!("console: UART write error");
            return;
        }
    }
    if tx.flush().await.is_err() {
        defmt::warn!("console: UART flush error");
    }
}
