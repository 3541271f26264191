//! Compile-time device configuration.
//!
//! All settings are embedded at build time via environment variables (see
//! build.rs). GPIO pin assignments live in main.rs next to the peripherals
//! they wire up.

/// Door controller configuration, embedded at compile time.
#[derive(Clone)]
pub struct Config {
    pub ssid: &'static str,
    pub password: &'static str,
    pub server_host: &'static str,
    pub server_port: u16,
    pub server_path: &'static str,
    pub device_id: &'static str,
    /// Poll the card reader in the main loop.
    pub card_auth: bool,
    /// Accept keypad-only code authentication.
    pub code_auth: bool,
    pub debug: bool,
}

impl Config {
    /// Get the compile-time configuration.
    pub fn get() -> Self {
        Self {
            ssid: option_env!("DOOR_SSID").unwrap_or("unconfigured"),
            password: option_env!("DOOR_PASSWORD").unwrap_or(""),
            server_host: option_env!("DOOR_HOST").unwrap_or("192.168.1.1"),
            server_port: match option_env!("DOOR_PORT") {
                Some(s) => parse_port(s),
                None => 80,
            },
            server_path: option_env!("DOOR_PATH").unwrap_or("/rfid-auth/auth.php"),
            device_id: option_env!("DOOR_DEVICE_ID").unwrap_or("frontdoor"),
            card_auth: parse_flag(option_env!("DOOR_CARD_AUTH"), true),
            code_auth: parse_flag(option_env!("DOOR_CODE_AUTH"), true),
            debug: parse_flag(option_env!("DOOR_DEBUG"), false),
        }
    }
}

/// Parse port at compile time (const fn compatible).
const fn parse_port(s: &str) -> u16 {
    let bytes = s.as_bytes();
    let mut result: u16 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit >= b'0' && digit <= b'9' {
            result = result * 10 + (digit - b'0') as u16;
        }
        i += 1;
    }
    if result == 0 { 80 } else { result }
}

/// "0" disables a feature, anything else (or absence) keeps the default.
const fn parse_flag(v: Option<&str>, default: bool) -> bool {
    match v {
        Some(s) => {
            let b = s.as_bytes();
            !(b.len() == 1 && b[0] == b'0')
        }
        None => default,
    }
}
