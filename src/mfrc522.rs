//! MFRC522 contactless reader driver over SPI.
//!
//! The chip is driven through 8-bit register reads/writes; every card
//! exchange is a Transceive command that loads the FIFO, fires the command
//! and polls the interrupt status register with a hard iteration cap. CRC-A
//! for outgoing frames comes from the chip's own coprocessor.

use embedded_hal::spi::SpiBus;
use esp_hal::gpio::Output;
use esp_hal::spi::master::Spi;
use esp_hal::Blocking;
use heapless::Vec;

/// Factory default sector key (KeyA and KeyB on blank cards).
pub const DEFAULT_KEY: [u8; 6] = [0xFF; 6];

/// REQA, 7-bit idle request.
pub const REQ_IDLE: u8 = 0x26;
/// WUPA, wakes halted cards back into the anticollision-ready state.
const WAKE_UP: u8 = 0x52;
/// Vendor backdoor probe sent as a 7-bit frame; rewritable-UID clones ack it.
const MAGIC_BACKDOOR: u8 = 0x40;

/// ComIrq poll cap for one chip command.
const POLL_BUDGET: u16 = 500;
/// DivIrq poll cap for one CRC coprocessor run.
const CRC_POLL_BUDGET: u16 = 255;

/// Trailer access bytes for provisioned sectors: KeyB writes, KeyA reads.
const ACCESS_PROVISIONED: [u8; 4] = [0x78, 0x77, 0x88, 0x69];
/// Trailer access bytes for factory-open sectors.
const ACCESS_OPEN: [u8; 4] = [0xFF, 0x07, 0x80, 0x69];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderError {
    /// Chip could not be probed at startup (wrong wiring or SPI parameters).
    Init,
    /// SPI transfer failed.
    Bus,
    /// Chip did not raise an interrupt within the polling cap.
    BusTimeout,
    /// No card answered (timer interrupt fired first).
    NoTag,
    /// UID checksum mismatch in the anticollision reply.
    Checksum,
    /// Chip error flags set (collision, parity, FIFO overflow).
    Chip,
    /// Mutual authentication failed or the card left the field.
    Auth,
    Read,
    Write,
}

/// MFRC522 register map (subset used by this driver).
#[derive(Clone, Copy)]
#[allow(dead_code)]
pub enum Register {
    Command = 0x01,
    ComIEn = 0x02,
    ComIrq = 0x04,
    DivIrq = 0x05,
    Error = 0x06,
    Status2 = 0x08,
    FifoData = 0x09,
    FifoLevel = 0x0A,
    Control = 0x0C,
    BitFraming = 0x0D,
    Mode = 0x11,
    TxControl = 0x14,
    TxAuto = 0x15,
    CrcResultH = 0x21,
    CrcResultL = 0x22,
    RfCfg = 0x26,
    TMode = 0x2A,
    TPrescaler = 0x2B,
    TReloadH = 0x2C,
    TReloadL = 0x2D,
    Version = 0x37,
}

#[derive(Clone, Copy)]
enum ChipCommand {
    Idle = 0x00,
    CalcCrc = 0x03,
    Transceive = 0x0C,
    MfAuthent = 0x0E,
    SoftReset = 0x0F,
}

/// Which of the two sector credentials to authenticate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    A,
    B,
}

impl KeyKind {
    fn command(self) -> u8 {
        match self {
            KeyKind::A => 0x60,
            KeyKind::B => 0x61,
        }
    }
}

/// Register-level access to the chip.
///
/// Exactly one register access per chip-select bracket; the bus has a single
/// owner (the main loop), so accesses are never interleaved.
pub trait RegisterBus {
    fn write_reg(&mut self, reg: Register, val: u8) -> Result<(), ReaderError>;
    fn read_reg(&mut self, reg: Register) -> Result<u8, ReaderError>;
}

/// SPI + chip-select implementation of [`RegisterBus`].
pub struct SpiRegisterBus {
    spi: Spi<'static, Blocking>,
    cs: Output<'static>,
}

impl SpiRegisterBus {
    pub fn new(spi: Spi<'static, Blocking>, mut cs: Output<'static>) -> Self {
        cs.set_high();
        Self { spi, cs }
    }
}

impl RegisterBus for SpiRegisterBus {
    fn write_reg(&mut self, reg: Register, val: u8) -> Result<(), ReaderError> {
        let addr = ((reg as u8) << 1) & 0x7E;
        self.cs.set_low();
        let result = SpiBus::write(&mut self.spi, &[addr, val]);
        self.cs.set_high();
        result.map_err(|_| ReaderError::Bus)
    }

    fn read_reg(&mut self, reg: Register) -> Result<u8, ReaderError> {
        let addr = (((reg as u8) << 1) & 0x7E) | 0x80;
        let mut buf = [0u8; 1];
        self.cs.set_low();
        let result = SpiBus::write(&mut self.spi, &[addr])
            .and_then(|_| SpiBus::read(&mut self.spi, &mut buf));
        self.cs.set_high();
        result.map_err(|_| ReaderError::Bus)?;
        Ok(buf[0])
    }
}

/// UID from a successful anticollision round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardUid {
    pub bytes: [u8; 4],
    bcc: u8,
}

impl CardUid {
    /// Lowercase hex form used in every server exchange.
    pub fn hex(&self) -> heapless::String<8> {
        use core::fmt::Write;
        let mut s = heapless::String::new();
        for b in self.bytes {
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

/// Raw answer from one Transceive command.
struct Answer {
    data: Vec<u8, 18>,
    /// Valid bit count, which is what correctness checks run on.
    bits: u16,
}

pub struct Mfrc522<B: RegisterBus> {
    bus: B,
}

impl<B: RegisterBus> Mfrc522<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Probe and configure the chip: soft reset, protocol timer, forced
    /// 100% ASK, CRC preset 0x6363, 48dB receiver gain, antenna on.
    pub fn init(&mut self) -> Result<(), ReaderError> {
        let version = self.bus.read_reg(Register::Version)?;
        if version == 0x00 || version == 0xFF {
            return Err(ReaderError::Init);
        }
        log::debug!("mfrc522: chip version 0x{:02X}", version);

        self.bus.write_reg(Register::Command, ChipCommand::SoftReset as u8)?;
        self.bus.write_reg(Register::TMode, 0x8D)?;
        self.bus.write_reg(Register::TPrescaler, 0x3E)?;
        self.bus.write_reg(Register::TReloadL, 30)?;
        self.bus.write_reg(Register::TReloadH, 0)?;
        self.bus.write_reg(Register::TxAuto, 0x40)?;
        self.bus.write_reg(Register::Mode, 0x3D)?;
        self.bus.write_reg(Register::RfCfg, 0x7F)?;
        self.antenna_on()
    }

    fn set_flags(&mut self, reg: Register, mask: u8) -> Result<(), ReaderError> {
        let val = self.bus.read_reg(reg)?;
        self.bus.write_reg(reg, val | mask)
    }

    fn clear_flags(&mut self, reg: Register, mask: u8) -> Result<(), ReaderError> {
        let val = self.bus.read_reg(reg)?;
        self.bus.write_reg(reg, val & !mask)
    }

    fn antenna_on(&mut self) -> Result<(), ReaderError> {
        let control = self.bus.read_reg(Register::TxControl)?;
        if control & 0x03 != 0x03 {
            self.bus.write_reg(Register::TxControl, control | 0x03)?;
        }
        Ok(())
    }

    /// Run one chip command: arm the interrupt mask, load the FIFO, start,
    /// poll ComIrq up to [`POLL_BUDGET`] times, then drain the response.
    fn transceive(&mut self, cmd: ChipCommand, send: &[u8]) -> Result<Answer, ReaderError> {
        let (irq_en, wait_irq) = match cmd {
            ChipCommand::MfAuthent => (0x12u8, 0x10u8),
            ChipCommand::Transceive => (0x77, 0x30),
            _ => (0, 0),
        };

        self.bus.write_reg(Register::ComIEn, irq_en | 0x80)?;
        self.clear_flags(Register::ComIrq, 0x80)?;
        self.set_flags(Register::FifoLevel, 0x80)?;
        self.bus.write_reg(Register::Command, ChipCommand::Idle as u8)?;
        for &byte in send {
            self.bus.write_reg(Register::FifoData, byte)?;
        }
        self.bus.write_reg(Register::Command, cmd as u8)?;
        if matches!(cmd, ChipCommand::Transceive) {
            // StartSend
            self.set_flags(Register::BitFraming, 0x80)?;
        }

        let mut budget = POLL_BUDGET;
        let irq = loop {
            let irq = self.bus.read_reg(Register::ComIrq)?;
            if irq & 0x01 != 0 || irq & wait_irq != 0 {
                break Some(irq);
            }
            budget -= 1;
            if budget == 0 {
                break None;
            }
        };
        self.clear_flags(Register::BitFraming, 0x80)?;

        let irq = irq.ok_or(ReaderError::BusTimeout)?;
        if self.bus.read_reg(Register::Error)? & 0x1B != 0 {
            return Err(ReaderError::Chip);
        }
        if irq & irq_en & 0x01 != 0 {
            return Err(ReaderError::NoTag);
        }

        let mut answer = Answer { data: Vec::new(), bits: 0 };
        if matches!(cmd, ChipCommand::Transceive) {
            let level = self.bus.read_reg(Register::FifoLevel)?;
            let last_bits = (self.bus.read_reg(Register::Control)? & 0x07) as u16;
            answer.bits = if last_bits != 0 {
                (level.max(1) as u16 - 1) * 8 + last_bits
            } else {
                level as u16 * 8
            };
            for _ in 0..level.clamp(1, 16) {
                let _ = answer.data.push(self.bus.read_reg(Register::FifoData)?);
            }
        }
        Ok(answer)
    }

    /// CRC-A via the chip coprocessor, busy-polled like any other command.
    fn calculate_crc(&mut self, data: &[u8]) -> Result<[u8; 2], ReaderError> {
        self.clear_flags(Register::DivIrq, 0x04)?;
        self.set_flags(Register::FifoLevel, 0x80)?;
        for &byte in data {
            self.bus.write_reg(Register::FifoData, byte)?;
        }
        self.bus.write_reg(Register::Command, ChipCommand::CalcCrc as u8)?;

        let mut budget = CRC_POLL_BUDGET;
        loop {
            if self.bus.read_reg(Register::DivIrq)? & 0x04 != 0 {
                break;
            }
            budget -= 1;
            if budget == 0 {
                return Err(ReaderError::BusTimeout);
            }
        }
        Ok([
            self.bus.read_reg(Register::CrcResultL)?,
            self.bus.read_reg(Register::CrcResultH)?,
        ])
    }

    /// Broadcast a short request frame. A tag is present only when exactly
    /// 16 response bits (the ATQA) come back; everything else reads as an
    /// empty field.
    pub fn request(&mut self, mode: u8) -> Result<Option<u16>, ReaderError> {
        self.bus.write_reg(Register::BitFraming, 0x07)?;
        match self.transceive(ChipCommand::Transceive, &[mode]) {
            Ok(answer) if answer.bits == 16 => {
                let atqa = match answer.data[..] {
                    [lo, hi, ..] => u16::from_le_bytes([lo, hi]),
                    _ => 0,
                };
                Ok(Some(atqa))
            }
            Ok(_) => Ok(None),
            Err(ReaderError::NoTag | ReaderError::BusTimeout | ReaderError::Chip) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Cascade level 1 anticollision. The four UID bytes must XOR to the
    /// trailing check byte.
    pub fn anticoll(&mut self) -> Result<CardUid, ReaderError> {
        self.bus.write_reg(Register::BitFraming, 0x00)?;
        let answer = self.transceive(ChipCommand::Transceive, &[0x93, 0x20])?;
        if answer.data.len() != 5 {
            return Err(ReaderError::Checksum);
        }
        let mut check = 0u8;
        for &byte in &answer.data[..4] {
            check ^= byte;
        }
        if check != answer.data[4] {
            return Err(ReaderError::Checksum);
        }
        Ok(CardUid {
            bytes: [answer.data[0], answer.data[1], answer.data[2], answer.data[3]],
            bcc: answer.data[4],
        })
    }

    /// SELECT the tag; the card acknowledges with a 24-bit SAK frame.
    pub fn select(&mut self, uid: &CardUid) -> Result<(), ReaderError> {
        let mut frame: Vec<u8, 9> = Vec::new();
        let _ = frame.extend_from_slice(&[0x93, 0x70]);
        let _ = frame.extend_from_slice(&uid.bytes);
        let _ = frame.push(uid.bcc);
        let crc = self.calculate_crc(&frame)?;
        let _ = frame.extend_from_slice(&crc);

        let answer = self.transceive(ChipCommand::Transceive, &frame)?;
        if answer.bits == 0x18 {
            Ok(())
        } else {
            Err(ReaderError::NoTag)
        }
    }

    /// Mutual (Crypto1) authentication of one block's sector. Read and write
    /// on that sector are only honored by the card while this holds.
    pub fn authenticate(
        &mut self,
        kind: KeyKind,
        block: u8,
        key: &[u8; 6],
        uid: &CardUid,
    ) -> Result<(), ReaderError> {
        let mut frame: Vec<u8, 12> = Vec::new();
        let _ = frame.push(kind.command());
        let _ = frame.push(block);
        let _ = frame.extend_from_slice(key);
        let _ = frame.extend_from_slice(&uid.bytes);

        self.transceive(ChipCommand::MfAuthent, &frame)
            .map(|_| ())
            .map_err(|_| ReaderError::Auth)
    }

    /// Read one 16-byte block. Requires prior authentication of its sector.
    pub fn read_block(&mut self, block: u8) -> Result<[u8; 16], ReaderError> {
        let mut frame: Vec<u8, 4> = Vec::new();
        let _ = frame.extend_from_slice(&[0x30, block]);
        let crc = self.calculate_crc(&frame)?;
        let _ = frame.extend_from_slice(&crc);

        let answer = self
            .transceive(ChipCommand::Transceive, &frame)
            .map_err(|_| ReaderError::Read)?;
        if answer.data.len() < 16 {
            return Err(ReaderError::Read);
        }
        let mut data = [0u8; 16];
        data.copy_from_slice(&answer.data[..16]);
        Ok(data)
    }

    /// Two-phase block write: the command and the data payload must each be
    /// acknowledged with a 4-bit frame whose low nibble is 0xA.
    pub fn write_block(&mut self, block: u8, data: &[u8; 16]) -> Result<(), ReaderError> {
        let mut frame: Vec<u8, 4> = Vec::new();
        let _ = frame.extend_from_slice(&[0xA0, block]);
        let crc = self.calculate_crc(&frame)?;
        let _ = frame.extend_from_slice(&crc);
        self.expect_ack(&frame)?;

        let mut payload: Vec<u8, 18> = Vec::new();
        let _ = payload.extend_from_slice(data);
        let crc = self.calculate_crc(&payload)?;
        let _ = payload.extend_from_slice(&crc);
        self.expect_ack(&payload)
    }

    fn expect_ack(&mut self, frame: &[u8]) -> Result<(), ReaderError> {
        let answer = self
            .transceive(ChipCommand::Transceive, frame)
            .map_err(|_| ReaderError::Write)?;
        let acked = answer.bits == 4 && answer.data.first().map(|b| b & 0x0F) == Some(0x0A);
        if acked {
            Ok(())
        } else {
            Err(ReaderError::Write)
        }
    }

    /// Write a sector trailer with the provisioned access policy
    /// (KeyB-holder writes, KeyA-holder reads).
    pub fn set_keys(&mut self, sector: u8, key_a: &[u8; 6], key_b: &[u8; 6]) -> Result<(), ReaderError> {
        self.write_trailer(sector, key_a, key_b, &ACCESS_PROVISIONED)
    }

    /// Restore a sector trailer to factory defaults with open access bits.
    pub fn reset_keys_open(&mut self, sector: u8) -> Result<(), ReaderError> {
        self.write_trailer(sector, &DEFAULT_KEY, &DEFAULT_KEY, &ACCESS_OPEN)
    }

    fn write_trailer(
        &mut self,
        sector: u8,
        key_a: &[u8; 6],
        key_b: &[u8; 6],
        access: &[u8; 4],
    ) -> Result<(), ReaderError> {
        let mut data = [0u8; 16];
        data[..6].copy_from_slice(key_a);
        data[6..10].copy_from_slice(access);
        data[10..].copy_from_slice(key_b);
        self.write_block(sector * 4 + 3, &data)
    }

    /// Probe for a rewritable-UID counterfeit: halt the card, send the magic
    /// backdoor request as a 7-bit frame, and treat a 0x0A reply as the
    /// unlock acknowledgement. The card is re-woken either way.
    pub fn detect_cloned_uid(&mut self) -> Result<bool, ReaderError> {
        let _ = self.halt();
        self.bus.write_reg(Register::BitFraming, 0x07)?;
        let cloned = match self.transceive(ChipCommand::Transceive, &[MAGIC_BACKDOOR]) {
            Ok(answer) => answer.data.first() == Some(&0x0A),
            Err(ReaderError::NoTag | ReaderError::BusTimeout | ReaderError::Chip) => false,
            Err(e) => {
                let _ = self.wake();
                return Err(e);
            }
        };
        let _ = self.wake();
        Ok(cloned)
    }

    fn wake(&mut self) -> Result<(), ReaderError> {
        self.bus.write_reg(Register::BitFraming, 0x07)?;
        let answer = self.transceive(ChipCommand::Transceive, &[WAKE_UP])?;
        if answer.bits == 16 {
            Ok(())
        } else {
            Err(ReaderError::NoTag)
        }
    }

    fn halt(&mut self) -> Result<(), ReaderError> {
        let mut frame: Vec<u8, 4> = Vec::new();
        let _ = frame.extend_from_slice(&[0x50, 0x00]);
        let crc = self.calculate_crc(&frame)?;
        let _ = frame.extend_from_slice(&crc);
        // A halted card goes silent, so "no answer" is the success path.
        match self.transceive(ChipCommand::Transceive, &frame) {
            Ok(_) | Err(ReaderError::NoTag) | Err(ReaderError::BusTimeout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// End the authenticated session: halt the card (best effort, it may
    /// already be gone) and drop the chip's Crypto1 state.
    pub fn halt_and_stop_crypto(&mut self) -> Result<(), ReaderError> {
        let _ = self.halt();
        self.clear_flags(Register::Status2, 0x08)
    }
}
