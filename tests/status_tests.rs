//! Unit tests for the status indicator debounce and watchdog feeding.
//!
//! Mirrors the color table and set() logic from status.rs with a
//! write-counting strip and a feed counter in place of the hardware.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Startup,
    Off,
    CardPresent,
    Admin,
    Granted,
    Denied,
    LongTap,
    Sending,
    Entry,
    EntryWaitA,
    EntryWaitB,
}

type Rgb = (u8, u8, u8);

const BLACK: Rgb = (0, 0, 0);
const WHITE: Rgb = (255, 255, 255);
const RED: Rgb = (255, 0, 0);
const GREEN: Rgb = (0, 255, 0);
const BLUE: Rgb = (0, 0, 255);
const MAGENTA: Rgb = (255, 0, 255);
const YELLOW: Rgb = (255, 255, 0);

fn colors(status: Status) -> [Rgb; 2] {
    match status {
        Status::Startup | Status::LongTap => [MAGENTA, MAGENTA],
        Status::Off => [BLACK, BLACK],
        Status::CardPresent | Status::Sending => [WHITE, WHITE],
        Status::Admin => [BLUE, BLUE],
        Status::Granted => [GREEN, GREEN],
        Status::Denied => [RED, RED],
        Status::Entry => [YELLOW, YELLOW],
        Status::EntryWaitA => [BLUE, YELLOW],
        Status::EntryWaitB => [YELLOW, BLUE],
    }
}

#[derive(Default)]
struct MockStrip {
    writes: usize,
    shown: [Rgb; 2],
}

impl MockStrip {
    fn write(&mut self, pixels: [Rgb; 2]) {
        self.writes += 1;
        self.shown = pixels;
    }
}

struct StatusLed {
    strip: MockStrip,
    last: Option<Status>,
    watchdog_feeds: usize,
}

impl StatusLed {
    fn new() -> Self {
        Self { strip: MockStrip::default(), last: None, watchdog_feeds: 0 }
    }

    /// Mirrors StatusLed::set from status.rs.
    fn set(&mut self, status: Status) {
        self.watchdog_feeds += 1;
        if self.last == Some(status) {
            return;
        }
        self.last = Some(status);
        self.strip.write([BLACK, BLACK]);
        self.strip.write(colors(status));
    }
}

#[test]
fn test_first_set_writes_the_strip() {
    let mut led = StatusLed::new();
    led.set(Status::Startup);
    assert_eq!(led.strip.writes, 2); // blank, then commit
    assert_eq!(led.strip.shown, [MAGENTA, MAGENTA]);
}

#[test]
fn test_identical_consecutive_states_are_not_rewritten() {
    let mut led = StatusLed::new();
    led.set(Status::Off);
    let writes = led.strip.writes;

    for _ in 0..50 {
        led.set(Status::Off);
    }
    assert_eq!(led.strip.writes, writes);
}

#[test]
fn test_write_count_increases_only_on_changes() {
    let mut led = StatusLed::new();
    let sequence = [
        Status::Off,
        Status::Off,
        Status::CardPresent,
        Status::CardPresent,
        Status::Granted,
        Status::Off,
        Status::Off,
    ];
    for status in sequence {
        led.set(status);
    }
    // Four distinct transitions, two writes each
    assert_eq!(led.strip.writes, 8);
}

#[test]
fn test_watchdog_is_fed_on_every_call_regardless() {
    let mut led = StatusLed::new();
    for _ in 0..100 {
        led.set(Status::Entry);
    }
    assert_eq!(led.watchdog_feeds, 100);
    assert_eq!(led.strip.writes, 2);
}

#[test]
fn test_entry_wait_phases_are_complementary() {
    let [a0, a1] = colors(Status::EntryWaitA);
    let [b0, b1] = colors(Status::EntryWaitB);
    assert_ne!(a0, a1);
    assert_eq!(a0, b1);
    assert_eq!(a1, b0);
}

#[test]
fn test_blink_alternation_rewrites_each_phase() {
    let mut led = StatusLed::new();
    led.set(Status::EntryWaitA);
    led.set(Status::EntryWaitB);
    led.set(Status::EntryWaitA);
    led.set(Status::EntryWaitB);
    assert_eq!(led.strip.writes, 8);
    assert_eq!(led.strip.shown, [YELLOW, BLUE]);
}

#[test]
fn test_color_table() {
    assert_eq!(colors(Status::CardPresent), [WHITE, WHITE]);
    assert_eq!(colors(Status::Sending), [WHITE, WHITE]);
    assert_eq!(colors(Status::Granted), [GREEN, GREEN]);
    assert_eq!(colors(Status::Denied), [RED, RED]);
    assert_eq!(colors(Status::Admin), [BLUE, BLUE]);
    assert_eq!(colors(Status::LongTap), colors(Status::Startup));
    assert_eq!(colors(Status::Off), [BLACK, BLACK]);
}
