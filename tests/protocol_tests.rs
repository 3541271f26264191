//! Unit tests for the server protocol models.
//!
//! Mirrors the request builders and reply classification from protocol.rs
//! and feeds them the JSON fixtures the authorization server produces.

use heapless::Vec;
use serde::{Deserialize, Serialize};

const SECTORS: usize = 16;
const FILLER_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolError {
    Json,
    MissingField,
    BadHex,
    BadNumber,
}

// Mirrors AuthRequest from protocol.rs
#[derive(Serialize)]
struct AuthRequest<'a> {
    cmd: &'a str,
    device_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    doorcmd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gcode: Option<&'a str>,
}

impl<'a> AuthRequest<'a> {
    fn stage1(device_id: &'a str, uid: &'a str) -> Self {
        Self { cmd: "stage1", device_id, uid: Some(uid), key: None, doorcmd: None, gcode: None }
    }

    fn stage3(device_id: &'a str, uid: &'a str, key: &'a str, doorcmd: &'a str) -> Self {
        Self {
            cmd: "stage3",
            device_id,
            uid: Some(uid),
            key: Some(key),
            doorcmd: Some(doorcmd),
            gcode: None,
        }
    }

    fn key_auth(device_id: &'a str, key: &'a str) -> Self {
        Self { cmd: "keyauth", device_id, uid: None, key: Some(key), doorcmd: None, gcode: None }
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        serde_json_core::to_slice(self, buf).map_err(|_| ProtocolError::Json)
    }
}

// Mirrors RawReply and the classifiers from protocol.rs
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

fn parse_hex_key(s: &str) -> Result<[u8; 6], ProtocolError> {
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

fn block_text(data: &[u8]) -> String {
    data.iter().map(|&b| char::from(b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadChallenge {
    key_a: [u8; 6],
    block: u8,
    len: usize,
}

struct ProvisionPlan<'a> {
    target_block: u8,
    text: &'a str,
    key_a: Vec<&'a str, SECTORS>,
    key_b: Vec<&'a str, SECTORS>,
    filler: Vec<&'a str, FILLER_SLOTS>,
}

impl<'a> ProvisionPlan<'a> {
    fn key_a(&self, sector: usize) -> Result<[u8; 6], ProtocolError> {
        parse_hex_key(self.key_a.get(sector).ok_or(ProtocolError::MissingField)?)
    }

    fn key_b(&self, sector: usize) -> Result<[u8; 6], ProtocolError> {
        parse_hex_key(self.key_b.get(sector).ok_or(ProtocolError::MissingField)?)
    }

    fn filler(&self, sector: usize, offset: usize) -> &'a str {
        self.filler.get((sector - 1) * 4 + offset).copied().unwrap_or("")
    }
}

struct WipePlan<'a> {
    key_b: Vec<&'a str, SECTORS>,
}

impl<'a> WipePlan<'a> {
    fn is_empty(&self) -> bool {
        self.key_b.is_empty()
    }

    fn key_b(&self, sector: usize) -> Result<[u8; 6], ProtocolError> {
        parse_hex_key(self.key_b.get(sector).ok_or(ProtocolError::MissingField)?)
    }
}

enum Stage1Action<'a> {
    Read(ReadChallenge),
    Provision(ProvisionPlan<'a>),
    Wipe(WipePlan<'a>),
    Denied,
}

fn classify_stage1(body: &[u8]) -> Result<Stage1Action<'_>, ProtocolError> {
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
        "reset" => Ok(Stage1Action::Wipe(WipePlan { key_b: reply.keyb.unwrap_or_default() })),
        _ => Ok(Stage1Action::Denied),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriteChallenge<'a> {
    block: u8,
    key_b: [u8; 6],
    text: &'a str,
}

enum Stage2Outcome<'a> {
    Continue(WriteChallenge<'a>),
    Denied,
}

fn classify_stage2(body: &[u8]) -> Result<Stage2Outcome<'_>, ProtocolError> {
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

#[derive(Debug, PartialEq, Eq)]
enum Stage3Outcome {
    CodeRequired(usize),
    Done,
}

fn classify_stage3(body: &[u8]) -> Result<Stage3Outcome, ProtocolError> {
    let reply = decode(body)?;
    if reply.status == "getcode" {
        let num = reply.num.ok_or(ProtocolError::MissingField)?;
        Ok(Stage3Outcome::CodeRequired(num as usize))
    } else {
        Ok(Stage3Outcome::Done)
    }
}

fn classify_stage4(body: &[u8]) -> Result<bool, ProtocolError> {
    Ok(decode(body)?.status == "done")
}

fn classify_keyauth(body: &[u8]) -> Result<bool, ProtocolError> {
    Ok(decode(body)?.status == "kk")
}

// ============================================================================
// Request tests
// ============================================================================

#[test]
fn test_stage1_request_layout() {
    let mut buf = [0u8; 256];
    let req = AuthRequest::stage1("frontdoor", "a1b2c3d4");
    let len = req.encode(&mut buf).unwrap();
    assert_eq!(
        core::str::from_utf8(&buf[..len]).unwrap(),
        r#"{"cmd":"stage1","device_id":"frontdoor","uid":"a1b2c3d4"}"#
    );
}

#[test]
fn test_keyauth_request_omits_uid() {
    let mut buf = [0u8; 256];
    let req = AuthRequest::key_auth("frontdoor", "1234567890");
    let len = req.encode(&mut buf).unwrap();
    assert_eq!(
        core::str::from_utf8(&buf[..len]).unwrap(),
        r#"{"cmd":"keyauth","device_id":"frontdoor","key":"1234567890"}"#
    );
}

#[test]
fn test_stage3_request_carries_door_command() {
    let mut buf = [0u8; 256];
    let req = AuthRequest::stage3("frontdoor", "a1b2c3d4", "NEWDATA", "open");
    let len = req.encode(&mut buf).unwrap();
    let json = core::str::from_utf8(&buf[..len]).unwrap();
    assert!(json.contains(r#""doorcmd":"open""#));
    assert!(!json.contains("gcode"));
}

// ============================================================================
// Reply classification tests
// ============================================================================

#[test]
fn test_stage1_read_challenge() {
    let body = br#"{"status":"k","key":"ffffffffffff","antiblk":"8","len":"16"}"#;
    match classify_stage1(body).unwrap() {
        Stage1Action::Read(challenge) => {
            assert_eq!(challenge.key_a, [0xFF; 6]);
            assert_eq!(challenge.block, 8);
            assert_eq!(challenge.len, 16);
        }
        _ => panic!("expected read challenge"),
    }
}

#[test]
fn test_stage1_missing_key_is_rejected() {
    let body = br#"{"status":"k","antiblk":"8","len":"16"}"#;
    assert_eq!(classify_stage1(body).err(), Some(ProtocolError::MissingField));
}

#[test]
fn test_stage1_unknown_status_is_denied() {
    let body = br#"{"status":"err","message":"You're not allowed on this device!"}"#;
    assert!(matches!(classify_stage1(body).unwrap(), Stage1Action::Denied));
}

#[test]
fn test_stage1_garbage_is_a_json_error() {
    assert_eq!(classify_stage1(b"<html>502</html>").err(), Some(ProtocolError::Json));
}

fn init_fixture() -> std::string::String {
    let keys: std::vec::Vec<std::string::String> =
        (0..16).map(|i| format!("{:012x}", 0x0a0b0c0d0e00u64 + i)).collect();
    let keya = keys.iter().map(|k| format!("\"{}\"", k)).collect::<std::vec::Vec<_>>().join(",");
    let filler = (0..60)
        .map(|i| format!("\"{:016x}\"", i))
        .collect::<std::vec::Vec<_>>()
        .join(",");
    format!(
        r#"{{"status":"init","setantiblk":"9","key":"aabbccddeeff","txt":"deadbeefcafe0123","keya":[{keya}],"keyb":[{keya}],"filler":[{filler}]}}"#
    )
}

#[test]
fn test_stage1_provision_plan() {
    let body = init_fixture();
    match classify_stage1(body.as_bytes()).unwrap() {
        Stage1Action::Provision(plan) => {
            assert_eq!(plan.target_block, 9);
            assert_eq!(plan.text, "deadbeefcafe0123");
            assert_eq!(plan.key_a(0).unwrap(), [0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x00]);
            assert_eq!(plan.key_b(15).unwrap(), [0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]);
            // Sector s, offset x maps to filler[(s-1)*4 + x]
            assert_eq!(plan.filler(1, 0), "0000000000000000");
            assert_eq!(plan.filler(2, 1), "0000000000000005");
            // Last provisioned sector reads from the tail of the table
            assert_eq!(plan.filler(15, 3), "000000000000003b");
        }
        _ => panic!("expected provision plan"),
    };
}

#[test]
fn test_stage1_wipe_plan() {
    let body = br#"{"status":"reset","keya":["aabbccddeeff"],"keyb":["112233445566","aabbccddeeff"]}"#;
    match classify_stage1(body).unwrap() {
        Stage1Action::Wipe(plan) => {
            assert!(!plan.is_empty());
            assert_eq!(plan.key_b(1).unwrap(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
            assert_eq!(plan.key_b(2).err(), Some(ProtocolError::MissingField));
        }
        _ => panic!("expected wipe plan"),
    }
}

#[test]
fn test_stage1_wipe_without_keys_is_empty() {
    let body = br#"{"status":"reset"}"#;
    match classify_stage1(body).unwrap() {
        Stage1Action::Wipe(plan) => assert!(plan.is_empty()),
        _ => panic!("expected wipe plan"),
    }
}

#[test]
fn test_stage2_write_challenge() {
    let body = br#"{"status":"kk","setantiblk":"8","key":"aabbccddeeff","txt":"NEWDATA"}"#;
    match classify_stage2(body).unwrap() {
        Stage2Outcome::Continue(challenge) => {
            assert_eq!(challenge.block, 8);
            assert_eq!(challenge.key_b, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
            assert_eq!(challenge.text, "NEWDATA");
        }
        _ => panic!("expected write challenge"),
    }
}

#[test]
fn test_stage2_wrong_key_is_denied() {
    let body = br#"{"status":"err"}"#;
    assert!(matches!(classify_stage2(body).unwrap(), Stage2Outcome::Denied));
}

#[test]
fn test_stage3_getcode_carries_digit_count() {
    let body = br#"{"status":"getcode","num":6}"#;
    assert_eq!(classify_stage3(body).unwrap(), Stage3Outcome::CodeRequired(6));

    let body = br#"{"status":"getcode","num":10}"#;
    assert_eq!(classify_stage3(body).unwrap(), Stage3Outcome::CodeRequired(10));
}

#[test]
fn test_stage3_done_and_unknown_statuses_complete() {
    assert_eq!(classify_stage3(br#"{"status":"done"}"#).unwrap(), Stage3Outcome::Done);
    assert_eq!(classify_stage3(br#"{"status":"whatever"}"#).unwrap(), Stage3Outcome::Done);
}

#[test]
fn test_stage4_and_keyauth_verdicts() {
    assert!(classify_stage4(br#"{"status":"done"}"#).unwrap());
    assert!(!classify_stage4(br#"{"status":"err"}"#).unwrap());
    assert!(classify_keyauth(br#"{"status":"kk"}"#).unwrap());
    assert!(!classify_keyauth(br#"{"status":"err"}"#).unwrap());
}

// ============================================================================
// Helpers
// ============================================================================

#[test]
fn test_parse_hex_key() {
    assert_eq!(parse_hex_key("aabbccddeeff").unwrap(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    assert_eq!(parse_hex_key("AABBCCDDEEFF").unwrap(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    assert_eq!(parse_hex_key("ffffffffffff").unwrap(), [0xFF; 6]);
    assert_eq!(parse_hex_key("aabbcc").err(), Some(ProtocolError::BadHex));
    assert_eq!(parse_hex_key("aabbccddeefg").err(), Some(ProtocolError::BadHex));
    assert_eq!(parse_hex_key("").err(), Some(ProtocolError::BadHex));
}

#[test]
fn test_block_text_decodes_bytes_one_to_one() {
    let block = *b"TESTDATA\x00\x00\x00\x00\x00\x00\x00\x00";
    // Stage-1 len truncates what is sent to the server
    assert_eq!(block_text(&block[..8]), "TESTDATA");
    assert_eq!(block_text(&block).len(), 16);
}

#[test]
fn test_bad_numbers_are_rejected() {
    let body = br#"{"status":"k","key":"ffffffffffff","antiblk":"eight","len":"16"}"#;
    assert_eq!(classify_stage1(body).err(), Some(ProtocolError::BadNumber));
}
