//! NFC door access controller - ESP32 firmware.
//!
//! Architecture:
//! - A single cooperative main loop (the access-control orchestrator) owns
//!   the MFRC522 reader's SPI bus, the network stack and the status strip.
//! - A periodic timer interrupt scans the keypad matrix and touches nothing
//!   but its own fixed-size state.
//!
//! The watchdog on TIMG1 is the only exit path: the panic handler spins
//! without feeding it, forcing a hardware reset.

#![no_std]
#![no_main]

use esp_bootloader_esp_idf::esp_app_desc;
esp_app_desc!();

mod config;
mod keypad;
mod mfrc522;
mod net;
mod orchestrator;
mod protocol;
mod status;

extern crate alloc;

use alloc::boxed::Box;
use core::cell::RefCell;
use core::mem::MaybeUninit;
use critical_section::Mutex;
use esp_hal::{
    clock::CpuClock,
    gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull},
    main,
    rmt::Rmt,
    spi::master::{Config as SpiConfig, Spi},
    spi::Mode as SpiMode,
    time::{Duration, Rate},
    timer::timg::{TimerGroup, Wdt},
    timer::PeriodicTimer,
};
use esp_hal_smartled::{smart_led_buffer, SmartLedsAdapter};
use esp_println::logger::init_logger;
use esp_radio::wifi::Config as WifiConfig;

use crate::config::Config;
use crate::keypad::Keypad;
use crate::mfrc522::{Mfrc522, SpiRegisterBus};
use crate::net::NetStack;
use crate::orchestrator::DoorControl;
use crate::status::{Status, StatusLed};

// Pin assignment (the rest of the configuration surface is in config.rs):
// - reader: SPI2 with SCK=14, MOSI=13, MISO=12, RST=26, CS=27
// - keypad: rows 15/2/0/4 (outputs), columns 16/17/5/18 (inputs, pull-down)
// - status strip: 2 WS2812 pixels on GPIO21 via RMT

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Watchdog timer, fed through [`feed_watchdog`] from every wait loop.
pub(crate) static WATCHDOG: Mutex<RefCell<Option<Wdt<esp_hal::peripherals::TIMG1<'static>>>>> =
    Mutex::new(RefCell::new(None));

/// Feed the watchdog timer. The status indicator calls this on every state
/// change request, which makes it the most frequently executed statement in
/// the firmware.
pub fn feed_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.feed();
        }
    });
}

/// Milliseconds since boot.
pub fn now_ms() -> u64 {
    esp_hal::time::Instant::now().duration_since_epoch().as_millis()
}

#[main]
fn main() -> ! {
    let config = Config::get();
    init_logger(if config.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    log::info!("NFC door controller starting...");

    // Heap for the radio driver's internal allocations
    const HEAP_SIZE: usize = 72 * 1024;
    static mut HEAP: MaybeUninit<[u8; HEAP_SIZE]> = MaybeUninit::uninit();
    unsafe {
        esp_alloc::HEAP.add_region(esp_alloc::HeapRegion::new(
            HEAP.as_mut_ptr() as *mut u8,
            HEAP_SIZE,
            esp_alloc::MemoryCapability::Internal.into(),
        ));
    }

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    // esp-rtos scheduler (required before esp_radio::init)
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // WiFi station. The radio controller must live for the entire program,
    // so it is leaked to 'static.
    let radio = Box::leak(Box::new(esp_radio::init().unwrap()));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio, peripherals.WIFI, WifiConfig::default()).unwrap();
    let net = NetStack::new(interfaces.sta, wifi_controller);

    // Watchdog on TIMG1 (TIMG0 is taken by the scheduler)
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.enable();
    wdt.set_timeout(esp_hal::timer::timg::MwdtStage::Stage0, WATCHDOG_TIMEOUT);
    critical_section::with(|cs| {
        WATCHDOG.borrow_ref_mut(cs).replace(wdt);
    });

    // Status strip
    let rmt = Rmt::new(peripherals.RMT, Rate::from_mhz(80)).unwrap();
    let strip = SmartLedsAdapter::new(rmt.channel0, peripherals.GPIO21, smart_led_buffer!(2));
    let mut status = StatusLed::new(strip);
    status.set(Status::Startup);

    // Card reader on SPI2. Reset is held low until the bus is ready.
    let mut reader_rst = Output::new(peripherals.GPIO26, Level::Low, OutputConfig::default());
    let spi = Spi::new(
        peripherals.SPI2,
        SpiConfig::default()
            .with_frequency(Rate::from_mhz(10))
            .with_mode(SpiMode::_0),
    )
    .unwrap()
    .with_sck(peripherals.GPIO14)
    .with_mosi(peripherals.GPIO13)
    .with_miso(peripherals.GPIO12);
    let reader_cs = Output::new(peripherals.GPIO27, Level::High, OutputConfig::default());
    reader_rst.set_high();

    let mut reader = Mfrc522::new(SpiRegisterBus::new(spi, reader_cs));
    reader.init().expect("reader init failed");

    // Keypad matrix, scanned from the periodic timer interrupt
    let rows = [
        Output::new(peripherals.GPIO15, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO2, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO0, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO4, Level::Low, OutputConfig::default()),
    ];
    let col_config = InputConfig::default().with_pull(Pull::Down);
    let cols = [
        Input::new(peripherals.GPIO16, col_config),
        Input::new(peripherals.GPIO17, col_config),
        Input::new(peripherals.GPIO5, col_config),
        Input::new(peripherals.GPIO18, col_config),
    ];
    let keypad = Keypad::new(rows, cols, PeriodicTimer::new(timg0.timer1));
    if config.code_auth {
        keypad.start();
    }

    DoorControl::new(config, reader, keypad, status, net).run()
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    critical_section::with(|_| {
        log::error!("PANIC: {}", info);
    });

    // Spin without feeding the watchdog; the timeout forces a full reset.
    loop {
        core::hint::spin_loop();
    }
}
