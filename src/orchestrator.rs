//! Access-control loop.
//!
//! Owns the reader, keypad, status strip and network stack, and runs the
//! multi-stage authentication protocol against the authorization server.
//! Every per-transaction failure is caught here, shown as the Denied color
//! and logged; the loop itself never exits.

use esp_hal::delay::Delay;
use smart_leds::{SmartLedsWrite, RGB8};

use crate::config::Config;
use crate::keypad::Keypad;
use crate::mfrc522::{CardUid, KeyKind, Mfrc522, ReaderError, RegisterBus, DEFAULT_KEY, REQ_IDLE};
use crate::net::{NetStack, TransportError};
use crate::protocol::{
    self, AuthRequest, ProtocolError, ProvisionPlan, Stage1Action, Stage2Outcome, Stage3Outcome,
    WipePlan,
};
use crate::status::{Status, StatusLed};

/// Fixed human-readable message on block 2 of freshly provisioned cards,
/// readable by any default-keyed device.
const WELCOME_MESSAGE: &[u8; 16] = b"Go Away!        ";

const ZERO_BLOCK: [u8; 16] = [0; 16];

/// Keypad-only code length.
const CODE_LENGTH: usize = 10;
/// Code entry ticks are 100ms; 100 idle ticks abort (roughly 10 seconds).
const CODE_TICK_MS: u32 = 100;
const CODE_ABORT_TICKS: u32 = 100;
/// Stage-4 entry shares the tick unit but aborts after roughly 60 seconds.
const ENTRY_ABORT_TICKS: u32 = 600;

/// Post-write block samples for the long-tap check, 1s apart.
const LONG_TAP_SAMPLES: u32 = 4;

// Response buffer for one server exchange; provisioning replies carry the
// full key and filler tables, so this is the largest buffer in the firmware.
static mut RESPONSE_BUF: [u8; 4096] = [0; 4096];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorCommand {
    Open,
    Close,
}

impl DoorCommand {
    fn as_str(self) -> &'static str {
        match self {
            DoorCommand::Open => "open",
            DoorCommand::Close => "close",
        }
    }
}

/// Anything that aborts one transaction. Converted to a status color and a
/// log line at the loop boundary.
#[derive(Debug)]
enum TxError {
    Reader(ReaderError),
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl From<ReaderError> for TxError {
    fn from(e: ReaderError) -> Self {
        TxError::Reader(e)
    }
}

impl From<TransportError> for TxError {
    fn from(e: TransportError) -> Self {
        TxError::Transport(e)
    }
}

impl From<ProtocolError> for TxError {
    fn from(e: ProtocolError) -> Self {
        TxError::Protocol(e)
    }
}

fn pad_block(text: &str) -> [u8; 16] {
    let mut data = [0u8; 16];
    for (slot, byte) in data.iter_mut().zip(text.bytes()) {
        *slot = byte;
    }
    data
}

pub struct DoorControl<B, W>
where
    B: RegisterBus,
    W: SmartLedsWrite<Color = RGB8>,
{
    config: Config,
    reader: Mfrc522<B>,
    keypad: Keypad,
    status: StatusLed<W>,
    net: NetStack,
    delay: Delay,
}

impl<B, W> DoorControl<B, W>
where
    B: RegisterBus,
    W: SmartLedsWrite<Color = RGB8>,
{
    pub fn new(
        config: Config,
        reader: Mfrc522<B>,
        keypad: Keypad,
        status: StatusLed<W>,
        net: NetStack,
    ) -> Self {
        Self { config, reader, keypad, status, net, delay: Delay::new() }
    }

    /// The control loop. Never returns; the watchdog handles the rest.
    pub fn run(mut self) -> ! {
        // SAFETY: single owner, the loop below never re-enters itself.
        let rsp: &'static mut [u8] = unsafe { &mut *core::ptr::addr_of_mut!(RESPONSE_BUF) };

        log::info!("door: place card before reader");
        loop {
            crate::feed_watchdog();
            self.status.set(Status::Off);
            self.net.poll(&self.config, crate::now_ms());

            if self.config.card_auth {
                match self.reader.request(REQ_IDLE) {
                    Ok(Some(_atqa)) => {
                        // The reader transaction is timing sensitive; no
                        // scan interrupts while it runs.
                        self.keypad.stop();
                        self.status.set(Status::CardPresent);

                        if let Err(e) = self.card_transaction(rsp) {
                            log::warn!("card: transaction aborted: {:?}", e);
                            self.status.set(Status::Denied);
                        }
                        let _ = self.reader.halt_and_stop_crypto();

                        self.settle(3_000);
                        if self.config.code_auth {
                            self.keypad.start();
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::error!("reader: poll failed: {:?}", e),
                }
            }

            if self.config.code_auth {
                let pending = self.keypad.take_keys();
                if !pending.is_empty() {
                    self.code_entry(&pending, rsp);
                }
            }

            self.settle(1_000);
        }
    }

    /// Bounded wait with frequent watchdog feeds.
    fn settle(&mut self, ms: u32) {
        let mut remaining = ms;
        while remaining > 0 {
            crate::feed_watchdog();
            let step = remaining.min(250);
            self.delay.delay_millis(step);
            remaining -= step;
        }
    }

    fn post(&mut self, request: &AuthRequest<'_>, rsp: &mut [u8]) -> Result<usize, TxError> {
        let mut body = [0u8; 256];
        let body_len = request.encode(&mut body)?;
        crate::feed_watchdog();
        Ok(self.net.post_json(&self.config, &body[..body_len], rsp)?)
    }

    // -----------------------------------------------------------------------
    // Card path
    // -----------------------------------------------------------------------

    fn card_transaction(&mut self, rsp: &mut [u8]) -> Result<(), TxError> {
        if self.reader.detect_cloned_uid()? {
            self.status.set(Status::Denied);
            self.report_cloned_uid(rsp);
            return Ok(());
        }

        let uid = self.reader.anticoll()?;
        self.reader.select(&uid)?;
        let uid_hex = uid.hex();
        log::info!("card: tag selected, uid={}", uid_hex);

        // Stage 1: announce the UID, get back a read challenge or an admin op
        let len = self.post(&AuthRequest::stage1(self.config.device_id, &uid_hex), rsp)?;
        let challenge = match protocol::classify_stage1(&rsp[..len])? {
            Stage1Action::Read(challenge) => challenge,
            Stage1Action::Provision(plan) => {
                self.status.set(Status::Admin);
                self.provision_card(&uid, &plan);
                self.status.set(Status::Granted);
                return Ok(());
            }
            Stage1Action::Wipe(plan) => {
                self.status.set(Status::Admin);
                self.wipe_card(&uid, &plan);
                self.status.set(Status::Granted);
                return Ok(());
            }
            Stage1Action::Denied => {
                log::warn!("stage1: uid rejected");
                self.status.set(Status::Denied);
                return Ok(());
            }
        };

        crate::feed_watchdog();
        self.reader
            .authenticate(KeyKind::A, challenge.block, &challenge.key_a, &uid)?;
        let data = self.reader.read_block(challenge.block)?;
        let text = protocol::block_text(&data[..challenge.len.min(16)]);
        log::debug!("stage1: read block {}", challenge.block);

        // Stage 2: prove the block contents, get back the write challenge
        let len = self.post(&AuthRequest::stage2(self.config.device_id, &uid_hex, &text), rsp)?;
        let (block, key_b, write_data) = match protocol::classify_stage2(&rsp[..len])? {
            Stage2Outcome::Continue(challenge) => {
                (challenge.block, challenge.key_b, pad_block(challenge.text))
            }
            Stage2Outcome::Denied => {
                log::warn!("stage2: key text rejected (tampered card?)");
                self.status.set(Status::Denied);
                return Ok(());
            }
        };

        // Stage 3: rotate the block, classify the tap, report the door command
        self.reader.authenticate(KeyKind::B, block, &key_b, &uid)?;
        crate::feed_watchdog();
        self.reader.write_block(block, &write_data)?;
        let written = self.reader.read_block(block)?;
        let written_text = protocol::block_text(&written);
        self.status.set(Status::Granted);

        let door_cmd = self.classify_tap(block, &written);
        if door_cmd == DoorCommand::Close {
            self.status.set(Status::LongTap);
        }
        log::info!("stage3: door command {}", door_cmd.as_str());

        let len = self.post(
            &AuthRequest::stage3(self.config.device_id, &uid_hex, &written_text, door_cmd.as_str()),
            rsp,
        )?;
        match protocol::classify_stage3(&rsp[..len])? {
            Stage3Outcome::CodeRequired(num) => {
                log::info!("stage3: server requests a {}-digit code", num);
                let code = self.collect_one_time_code(num);
                let len = self.post(
                    &AuthRequest::stage4(
                        self.config.device_id,
                        &uid_hex,
                        &written_text,
                        door_cmd.as_str(),
                        &code,
                    ),
                    rsp,
                )?;
                if protocol::classify_stage4(&rsp[..len])? {
                    log::info!("stage4: code accepted");
                    self.status.set(Status::Granted);
                } else {
                    log::warn!("stage4: code rejected");
                    self.status.set(Status::Denied);
                }
            }
            Stage3Outcome::Done => {
                // Door action applied server-side; current color stands.
            }
        }
        Ok(())
    }

    /// Report a rewritable-UID card. Best effort: the UID is whatever a
    /// fresh anticollision returns, and transport failures only log.
    fn report_cloned_uid(&mut self, rsp: &mut [u8]) {
        let uid_hex = match self.reader.request(REQ_IDLE) {
            Ok(Some(_)) => match self.reader.anticoll() {
                Ok(uid) => uid.hex(),
                Err(_) => heapless::String::try_from("00000000").unwrap_or_default(),
            },
            _ => heapless::String::try_from("00000000").unwrap_or_default(),
        };
        log::warn!("card: rewritable uid detected ({})", uid_hex);

        if let Err(e) = self.post(&AuthRequest::china_uid(self.config.device_id, &uid_hex), rsp) {
            log::warn!("card: cloned-uid report failed: {:?}", e);
        }
    }

    /// Sample the freshly written block up to four times, one second apart.
    /// A card held still echoes the written bytes every time, which reads as
    /// the long-tap intent; any divergence or failed read means the card
    /// left the field and this was a normal tap.
    fn classify_tap(&mut self, block: u8, written: &[u8; 16]) -> DoorCommand {
        for sample in 0..LONG_TAP_SAMPLES {
            match self.reader.read_block(block) {
                Ok(data) if data == *written => {
                    log::debug!("tap: sample {} unchanged", sample);
                }
                _ => return DoorCommand::Open,
            }
            self.settle(1_000);
        }
        DoorCommand::Close
    }

    // -----------------------------------------------------------------------
    // Provisioning and wipe
    // -----------------------------------------------------------------------

    /// Write all 16 sectors of a factory-fresh card: server hash into the
    /// designated block, filler everywhere else, then the per-sector keys.
    fn provision_card(&mut self, uid: &CardUid, plan: &ProvisionPlan<'_>) {
        log::info!("provision: initializing card, target block {}", plan.target_block);

        // Sector 0 only gets the welcome text on its free data block.
        if self.reader.authenticate(KeyKind::A, 2, &DEFAULT_KEY, uid).is_ok() {
            let _ = self.reader.write_block(2, WELCOME_MESSAGE);
        }

        for sector in 1..protocol::SECTORS {
            crate::feed_watchdog();
            let first_block = (sector * 4) as u8;
            if self
                .reader
                .authenticate(KeyKind::A, first_block, &DEFAULT_KEY, uid)
                .is_err()
            {
                log::warn!("provision: sector {} auth failed", sector);
                continue;
            }

            for offset in 0..3 {
                let block = first_block + offset as u8;
                let data = if block == plan.target_block {
                    pad_block(plan.text)
                } else {
                    pad_block(plan.filler(sector, offset))
                };
                if let Err(e) = self.reader.write_block(block, &data) {
                    log::warn!("provision: block {} write failed: {:?}", block, e);
                }
            }

            match (plan.key_a(sector), plan.key_b(sector)) {
                (Ok(key_a), Ok(key_b)) => {
                    if let Err(e) = self.reader.set_keys(sector as u8, &key_a, &key_b) {
                        log::warn!("provision: sector {} trailer failed: {:?}", sector, e);
                    }
                }
                _ => log::warn!("provision: sector {} keys malformed", sector),
            }
            log::debug!("provision: sector {} done", sector);
        }
    }

    /// Zero all data blocks and restore factory keys with open access bits.
    fn wipe_card(&mut self, uid: &CardUid, plan: &WipePlan<'_>) {
        if plan.is_empty() {
            log::warn!("wipe: server sent no key table");
            return;
        }
        log::info!("wipe: resetting card to factory keys");

        if self.reader.authenticate(KeyKind::B, 2, &DEFAULT_KEY, uid).is_ok() {
            let _ = self.reader.write_block(2, &ZERO_BLOCK);
        }

        for sector in 1..protocol::SECTORS {
            crate::feed_watchdog();
            let key_b = match plan.key_b(sector) {
                Ok(key) => key,
                Err(_) => {
                    log::warn!("wipe: sector {} key malformed", sector);
                    continue;
                }
            };
            let first_block = (sector * 4) as u8;
            if self
                .reader
                .authenticate(KeyKind::B, first_block, &key_b, uid)
                .is_err()
            {
                log::warn!("wipe: sector {} auth failed", sector);
                continue;
            }
            for offset in 0..3 {
                if let Err(e) = self.reader.write_block(first_block + offset, &ZERO_BLOCK) {
                    log::warn!("wipe: block {} failed: {:?}", first_block + offset, e);
                }
            }
            if let Err(e) = self.reader.reset_keys_open(sector as u8) {
                log::warn!("wipe: sector {} trailer failed: {:?}", sector, e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Keypad entry
    // -----------------------------------------------------------------------

    /// Keypad-only authentication: accumulate ten digits and submit them.
    /// `#`/`*` aborts immediately; ten seconds without a key abort silently.
    fn code_entry(&mut self, initial: &str, rsp: &mut [u8]) {
        log::info!("keypad: code entry started");
        let mut code: heapless::String<32> = heapless::String::new();
        let _ = code.push_str(initial);
        let mut idle_ticks = 0u32;

        loop {
            crate::feed_watchdog();
            idle_ticks += 1;
            self.status.set(Status::Entry);

            if code.len() >= CODE_LENGTH {
                self.keypad.stop();
                self.status.set(Status::Sending);
                self.submit_code(&code, rsp);
                self.settle(1_000);
                self.keypad.start();
                return;
            }

            let fresh = self.keypad.take_keys();
            for c in fresh.chars() {
                idle_ticks = 0;
                if c == '#' || c == '*' {
                    log::info!("keypad: entry aborted");
                    self.status.set(Status::Off);
                    return;
                }
                let _ = code.push(c);
                self.status.set(Status::Admin);
            }

            if idle_ticks >= CODE_ABORT_TICKS {
                log::info!("keypad: entry timed out");
                return;
            }
            self.delay.delay_millis(CODE_TICK_MS);
        }
    }

    fn submit_code(&mut self, code: &str, rsp: &mut [u8]) {
        let verdict = self
            .post(&AuthRequest::key_auth(self.config.device_id, code), rsp)
            .and_then(|len| Ok(protocol::classify_keyauth(&rsp[..len])?));
        match verdict {
            Ok(true) => {
                log::info!("keyauth: accepted");
                self.status.set(Status::Granted);
            }
            Ok(false) => {
                log::warn!("keyauth: rejected");
                self.status.set(Status::Denied);
            }
            Err(e) => {
                log::warn!("keyauth: {:?}", e);
                self.status.set(Status::Denied);
            }
        }
    }

    /// Stage-4 one-time-code entry. Blinks the two-tone waiting pattern
    /// until the first digit, then ticks like regular code entry but with a
    /// sixty-second budget. Abort or timeout yields the all-zero sentinel;
    /// the server is the one that rejects it.
    fn collect_one_time_code(&mut self, target_len: usize) -> heapless::String<32> {
        let target_len = target_len.min(16);
        log::info!("entry: collecting {} digits", target_len);

        self.keypad.start();
        let mut code: heapless::String<32> = heapless::String::new();
        let mut ticks = 0u32;
        let mut blink_b = false;
        let mut aborted = false;

        loop {
            crate::feed_watchdog();

            if code.is_empty() {
                let fresh = self.keypad.take_keys();
                for c in fresh.chars() {
                    if c == '#' || c == '*' {
                        aborted = true;
                        break;
                    }
                    let _ = code.push(c);
                }
                if aborted {
                    break;
                }
                self.status
                    .set(if blink_b { Status::EntryWaitB } else { Status::EntryWaitA });
                blink_b = !blink_b;
                self.delay.delay_millis(500);
                ticks += 5;
            } else {
                ticks += 1;
                self.status.set(Status::Entry);

                if code.len() >= target_len {
                    self.keypad.stop();
                    self.status.set(Status::Off);
                    return code;
                }

                let fresh = self.keypad.take_keys();
                for c in fresh.chars() {
                    ticks = 0;
                    if c == '#' || c == '*' {
                        log::info!("entry: aborted with {}", c);
                        aborted = true;
                        break;
                    }
                    let _ = code.push(c);
                    self.status.set(Status::Admin);
                }
                if aborted {
                    break;
                }
                self.delay.delay_millis(100);
            }

            if ticks >= ENTRY_ABORT_TICKS {
                log::info!("entry: timed out");
                break;
            }
        }

        self.keypad.stop();
        self.status.set(Status::Off);
        code.clear();
        for _ in 0..target_len {
            let _ = code.push('0');
        }
        code
    }
}
