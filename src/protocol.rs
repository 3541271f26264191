//! Authorization server protocol.
//!
//! Requests are flat JSON objects keyed by `cmd`; replies are decoded once
//! at this boundary into per-stage outcomes so the control loop never does
//! dynamic field lookups. Reply fields the server emits as strings
//! (`antiblk`, `len`, block numbers) are parsed here too.

use heapless::Vec;
use serde::{Deserialize, Serialize};

/// Per-sector key tables carry one entry for each of the 16 sectors.
pub const SECTORS: usize = 16;
/// The server ships four filler entries per provisioned sector (3 used).
const FILLER_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Reply was not valid JSON.
    Json,
    /// Reply status implies a field that is absent.
    MissingField,
    /// A hex key field did not decode to 6 bytes.
    BadHex,
    /// A numeric string field did not parse.
    BadNumber,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One POST body. Absent fields are omitted from the JSON entirely.
#[derive(Serialize)]
pub struct AuthRequest<'a> {
    pub cmd: &'a str,
    pub device_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doorcmd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcode: Option<&'a str>,
}

impl<'a> AuthRequest<'a> {
    pub fn stage1(device_id: &'a str, uid: &'a str) -> Self {
        Self { cmd: "stage1", device_id, uid: Some(uid), key: None, doorcmd: None, gcode: None }
    }

    pub fn stage2(device_id: &'a str, uid: &'a str, key: &'a str) -> Self {
        Self { cmd: "stage2", device_id, uid: Some(uid), key: Some(key), doorcmd: None, gcode: None }
    }

    pub fn stage3(device_id: &'a str, uid: &'a str, key: &'a str, doorcmd: &'a str) -> Self {
        Self {
            cmd: "stage3",
            device_id,
            uid: Some(uid),
            key: Some(key),
            doorcmd: Some(doorcmd),
            gcode: None,
        }
    }

    pub fn stage4(
        device_id: &'a str,
        uid: &'a str,
        key: &'a str,
        doorcmd: &'a str,
        gcode: &'a str,
    ) -> Self {
        Self {
            cmd: "stage4",
            device_id,
            uid: Some(uid),
            key: Some(key),
            doorcmd: Some(doorcmd),
            gcode: Some(gcode),
        }
    }

    pub fn china_uid(device_id: &'a str, uid: &'a str) -> Self {
        Self { cmd: "chinauid", device_id, uid: Some(uid), key: None, doorcmd: None, gcode: None }
    }

    pub fn key_auth(device_id: &'a str, key: &'a str) -> Self {
        Self { cmd: "keyauth", device_id, uid: None, key: Some(key), doorcmd: None, gcode: None }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        serde_json_core::to_slice(self, buf).map_err(|_| ProtocolError::Json)
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Union of every reply field; classification narrows it per stage.
#[derive(Deserialize)]
struct RawReply<'a> {
    status: &'a str,
    #[serde(default)]
    key: Option<&'a str>,
    #[serde(default)]
    antiblk: Option<&'a str>,
    #[serde(default)]
    len: Option<&'a str>,
    #[serde(default)]
    setantiblk: Option<&'a str>,
    #[serde(default)]
    txt: Option<&'a str>,
    #[serde(default)]
    num: Option<u16>,
    #[serde(default)]
    keya: Option<Vec<&'a str, SECTORS>>,
    #[serde(default)]
    keyb: Option<Vec<&'a str, SECTORS>>,
    #[serde(default)]
    filler: Option<Vec<&'a str, FILLER_SLOTS>>,
}

fn decode(body: &[u8]) -> Result<RawReply<'_>, ProtocolError> {
    serde_json_core::from_slice::<RawReply>(body)
        .map(|(reply, _)| reply)
        .map_err(|_| ProtocolError::Json)
}

/// Decode a 12-hex-digit sector key.
pub fn parse_hex_key(s: &str) -> Result<[u8; 6], ProtocolError> {
    let raw = s.as_bytes();
    if raw.len() != 12 {
        return Err(ProtocolError::BadHex);
    }
    let mut key = [0u8; 6];
    for (i, chunk) in raw.chunks_exact(2).enumerate() {
        let hi = hex_nibble(chunk[0])?;
        let lo = hex_nibble(chunk[1])?;
        key[i] = (hi << 4) | lo;
    }
    Ok(key)
}

fn hex_nibble(c: u8) -> Result<u8, ProtocolError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(ProtocolError::BadHex),
    }
}

fn parse_number(s: &str) -> Result<u8, ProtocolError> {
    s.trim().parse().map_err(|_| ProtocolError::BadNumber)
}

/// Card block bytes as text, one char per byte (the server stores ASCII).
pub fn block_text(data: &[u8]) -> heapless::String<32> {
    let mut text = heapless::String::new();
    for &b in data {
        let _ = text.push(char::from(b));
    }
    text
}

/// Stage-1 challenge: which block to read and with what key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadChallenge {
    pub key_a: [u8; 6],
    pub block: u8,
    pub len: usize,
}

/// Server-supplied provisioning material for all 16 sectors.
pub struct ProvisionPlan<'a> {
    pub target_block: u8,
    pub text: &'a str,
    key_a: Vec<&'a str, SECTORS>,
    key_b: Vec<&'a str, SECTORS>,
    filler: Vec<&'a str, FILLER_SLOTS>,
}

impl<'a> ProvisionPlan<'a> {
    pub fn key_a(&self, sector: usize) -> Result<[u8; 6], ProtocolError> {
        parse_hex_key(self.key_a.get(sector).ok_or(ProtocolError::MissingField)?)
    }

    pub fn key_b(&self, sector: usize) -> Result<[u8; 6], ProtocolError> {
        parse_hex_key(self.key_b.get(sector).ok_or(ProtocolError::MissingField)?)
    }

    /// Filler text for data block `offset` (0..3) of `sector` (1..16).
    pub fn filler(&self, sector: usize, offset: usize) -> &'a str {
        self.filler.get((sector - 1) * 4 + offset).copied().unwrap_or("")
    }
}

/// Server-supplied key table for a wipe.
pub struct WipePlan<'a> {
    key_b: Vec<&'a str, SECTORS>,
}

impl<'a> WipePlan<'a> {
    pub fn is_empty(&self) -> bool {
        self.key_b.is_empty()
    }

    pub fn key_b(&self, sector: usize) -> Result<[u8; 6], ProtocolError> {
        parse_hex_key(self.key_b.get(sector).ok_or(ProtocolError::MissingField)?)
    }
}

pub enum Stage1Action<'a> {
    /// `status == "k"`: read the challenge block and continue to stage 2.
    Read(ReadChallenge),
    /// `status == "init"`: provision the card.
    Provision(ProvisionPlan<'a>),
    /// `status == "reset"`: wipe the card back to factory keys.
    Wipe(WipePlan<'a>),
    /// Anything else: this UID is not welcome here.
    Denied,
}

pub fn classify_stage1(body: &[u8]) -> Result<Stage1Action<'_>, ProtocolError> {
    let reply = decode(body)?;
    match reply.status {
        "k" => {
            let key = reply.key.ok_or(ProtocolError::MissingField)?;
            let antiblk = reply.antiblk.ok_or(ProtocolError::MissingField)?;
            let len = reply.len.ok_or(ProtocolError::MissingField)?;
            Ok(Stage1Action::Read(ReadChallenge {
                key_a: parse_hex_key(key)?,
                block: parse_number(antiblk)?,
                len: parse_number(len)? as usize,
            }))
        }
        "init" => Ok(Stage1Action::Provision(ProvisionPlan {
            target_block: parse_number(reply.setantiblk.ok_or(ProtocolError::MissingField)?)?,
            text: reply.txt.ok_or(ProtocolError::MissingField)?,
            key_a: reply.keya.ok_or(ProtocolError::MissingField)?,
            key_b: reply.keyb.ok_or(ProtocolError::MissingField)?,
            filler: reply.filler.ok_or(ProtocolError::MissingField)?,
        })),
        "reset" => Ok(Stage1Action::Wipe(WipePlan {
            key_b: reply.keyb.unwrap_or_default(),
        })),
        _ => Ok(Stage1Action::Denied),
    }
}

/// Stage-2 continuation: which block to rewrite and with what key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteChallenge<'a> {
    pub block: u8,
    pub key_b: [u8; 6],
    pub text: &'a str,
}

pub enum Stage2Outcome<'a> {
    Continue(WriteChallenge<'a>),
    /// Wrong key text: tampered or stale card.
    Denied,
}

pub fn classify_stage2(body: &[u8]) -> Result<Stage2Outcome<'_>, ProtocolError> {
    let reply = decode(body)?;
    if reply.status != "kk" {
        return Ok(Stage2Outcome::Denied);
    }
    Ok(Stage2Outcome::Continue(WriteChallenge {
        block: parse_number(reply.setantiblk.ok_or(ProtocolError::MissingField)?)?,
        key_b: parse_hex_key(reply.key.ok_or(ProtocolError::MissingField)?)?,
        text: reply.txt.ok_or(ProtocolError::MissingField)?,
    }))
}

pub enum Stage3Outcome {
    /// `status == "getcode"`: collect this many keypad digits for stage 4.
    CodeRequired(usize),
    /// Door action already applied server-side.
    Done,
}

pub fn classify_stage3(body: &[u8]) -> Result<Stage3Outcome, ProtocolError> {
    let reply = decode(body)?;
    if reply.status == "getcode" {
        let num = reply.num.ok_or(ProtocolError::MissingField)?;
        Ok(Stage3Outcome::CodeRequired(num as usize))
    } else {
        Ok(Stage3Outcome::Done)
    }
}

/// Stage-4 verdict on the submitted one-time code.
pub fn classify_stage4(body: &[u8]) -> Result<bool, ProtocolError> {
    Ok(decode(body)?.status == "done")
}

/// Keypad-only authentication verdict.
pub fn classify_keyauth(body: &[u8]) -> Result<bool, ProtocolError> {
    Ok(decode(body)?.status == "kk")
}
