//! 4x4 matrix keypad scanned from a periodic timer interrupt.
//!
//! One row is energized per 10ms tick; the handler samples that row's
//! columns, records DOWN edges into a bounded character buffer, then asserts
//! the next row for the following tick. The handler touches only fixed-size
//! state behind a critical-section mutex and never allocates.

use core::cell::RefCell;
use critical_section::Mutex;
use esp_hal::gpio::{Input, Output};
use esp_hal::handler;
use esp_hal::interrupt::Priority;
use esp_hal::time::Duration;
use esp_hal::timer::PeriodicTimer;
use esp_hal::Blocking;

const ROWS: usize = 4;
const COLS: usize = 4;

/// Accumulation buffer capacity; DOWN edges past this are dropped until the
/// consumer drains the buffer.
pub const KEY_BUFFER: usize = 16;

const SCAN_PERIOD: Duration = Duration::from_millis(10);

/// Key labels in row-major scan order.
const KEY_LABELS: &[u8; ROWS * COLS] = b"123A456B789C*0#D";

#[derive(Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Up,
    Down,
}

struct ScanState {
    rows: [Output<'static>; ROWS],
    cols: [Input<'static>; COLS],
    states: [KeyState; ROWS * COLS],
    cursor: usize,
    buffer: heapless::String<KEY_BUFFER>,
    last_code: Option<u8>,
}

impl ScanState {
    /// One scan tick: edge-detect the row that was energized during this
    /// tick, then advance the cursor and energize the next row.
    fn step(&mut self) {
        for col in 0..COLS {
            let code = self.cursor * COLS + col;
            match (self.states[code], self.cols[col].is_high()) {
                (KeyState::Up, true) => {
                    self.states[code] = KeyState::Down;
                    let _ = self.buffer.push(KEY_LABELS[code] as char);
                    self.last_code = Some(code as u8);
                }
                (KeyState::Down, false) => self.states[code] = KeyState::Up,
                _ => {}
            }
        }

        self.rows[self.cursor].set_low();
        self.cursor = (self.cursor + 1) % ROWS;
        self.rows[self.cursor].set_high();
    }
}

// ISR-accessible state (single instance), same pattern as the reader-side
// GPIO handlers: pins and scan state live in statics, the public handle is
// just a capability to start/stop/drain.
static SCAN: Mutex<RefCell<Option<ScanState>>> = Mutex::new(RefCell::new(None));
static SCAN_TIMER: Mutex<RefCell<Option<PeriodicTimer<'static, Blocking>>>> =
    Mutex::new(RefCell::new(None));

/// Periodic timer interrupt handler driving the matrix scan.
#[handler(priority = Priority::Priority2)]
fn scan_tick() {
    critical_section::with(|cs| {
        if let Some(ref mut timer) = *SCAN_TIMER.borrow_ref_mut(cs) {
            timer.clear_interrupt();
        }
        if let Some(ref mut scan) = *SCAN.borrow_ref_mut(cs) {
            scan.step();
        }
    });
}

/// Keypad scanner handle.
pub struct Keypad {
    _initialized: bool,
}

impl Keypad {
    /// Take ownership of the row/column pins and the scan timer. Rows are
    /// push-pull outputs, columns pulled-down inputs; row 0 is energized so
    /// the first tick has a valid read.
    pub fn new(
        rows: [Output<'static>; ROWS],
        cols: [Input<'static>; COLS],
        mut timer: PeriodicTimer<'static, Blocking>,
    ) -> Self {
        timer.set_interrupt_handler(scan_tick);

        critical_section::with(|cs| {
            let mut state = ScanState {
                rows,
                cols,
                states: [KeyState::Up; ROWS * COLS],
                cursor: 0,
                buffer: heapless::String::new(),
                last_code: None,
            };
            state.rows[0].set_high();
            SCAN.borrow_ref_mut(cs).replace(state);
            SCAN_TIMER.borrow_ref_mut(cs).replace(timer);
        });

        Self { _initialized: true }
    }

    /// Arm the periodic scan.
    pub fn start(&self) {
        critical_section::with(|cs| {
            if let Some(ref mut timer) = *SCAN_TIMER.borrow_ref_mut(cs) {
                if timer.start(SCAN_PERIOD).is_err() {
                    log::error!("keypad: scan timer failed to start");
                    return;
                }
                timer.enable_interrupt(true);
            }
        });
    }

    /// Disarm the periodic scan. Cancellation happens inside a critical
    /// section, which cannot interleave with the handler, so scanning is
    /// fully quiesced when this returns.
    pub fn stop(&self) {
        critical_section::with(|cs| {
            if let Some(ref mut timer) = *SCAN_TIMER.borrow_ref_mut(cs) {
                timer.enable_interrupt(false);
                let _ = timer.cancel();
            }
        });
    }

    /// Return the characters accumulated since the previous call and clear
    /// the buffer (and the last-pressed code with it).
    pub fn take_keys(&self) -> heapless::String<KEY_BUFFER> {
        critical_section::with(|cs| {
            match *SCAN.borrow_ref_mut(cs) {
                Some(ref mut scan) => {
                    let keys = scan.buffer.clone();
                    scan.buffer.clear();
                    scan.last_code = None;
                    keys
                }
                None => heapless::String::new(),
            }
        })
    }

    /// Return and clear the code of the most recently pressed key.
    pub fn take_last_code(&self) -> Option<u8> {
        critical_section::with(|cs| {
            match *SCAN.borrow_ref_mut(cs) {
                Some(ref mut scan) => scan.last_code.take(),
                None => None,
            }
        })
    }
}
