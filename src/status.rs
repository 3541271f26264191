//! Two-pixel status indicator.
//!
//! Every `set` call feeds the watchdog, making the indicator the liveness
//! checkpoint of the whole firmware: it is touched on every loop iteration
//! and inside every wait loop.

use smart_leds::{SmartLedsWrite, RGB8};

/// Logical states shown on the strip. Several states share a color on
/// purpose; startup and long-tap are both magenta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Startup,
    Off,
    CardPresent,
    /// Provisioning or wipe in progress, and digit-echo during code entry.
    Admin,
    Granted,
    Denied,
    LongTap,
    /// Collected code is on its way to the server.
    Sending,
    /// Code entry in progress.
    Entry,
    /// Blink phases while waiting for the first code digit.
    EntryWaitA,
    EntryWaitB,
}

const BLACK: RGB8 = RGB8::new(0, 0, 0);
const WHITE: RGB8 = RGB8::new(255, 255, 255);
const RED: RGB8 = RGB8::new(255, 0, 0);
const GREEN: RGB8 = RGB8::new(0, 255, 0);
const BLUE: RGB8 = RGB8::new(0, 0, 255);
const MAGENTA: RGB8 = RGB8::new(255, 0, 255);
const YELLOW: RGB8 = RGB8::new(255, 255, 0);

fn colors(status: Status) -> [RGB8; 2] {
    match status {
        Status::Startup | Status::LongTap => [MAGENTA, MAGENTA],
        Status::Off => [BLACK, BLACK],
        Status::CardPresent | Status::Sending => [WHITE, WHITE],
        Status::Admin => [BLUE, BLUE],
        Status::Granted => [GREEN, GREEN],
        Status::Denied => [RED, RED],
        Status::Entry => [YELLOW, YELLOW],
        // Complementary pair signals "waiting for the second input type"
        Status::EntryWaitA => [BLUE, YELLOW],
        Status::EntryWaitB => [YELLOW, BLUE],
    }
}

pub struct StatusLed<W> {
    strip: W,
    last: Option<Status>,
}

impl<W> StatusLed<W>
where
    W: SmartLedsWrite<Color = RGB8>,
{
    pub fn new(strip: W) -> Self {
        Self { strip, last: None }
    }

    /// Show a status. Feeds the watchdog unconditionally; the strip is only
    /// rewritten when the state actually changes (blank, then commit).
    pub fn set(&mut self, status: Status) {
        crate::feed_watchdog();
        if self.last == Some(status) {
            return;
        }
        self.last = Some(status);
        let _ = self.strip.write([BLACK, BLACK].into_iter());
        let _ = self.strip.write(colors(status).into_iter());
    }
}
