//! Build script for compile-time configuration injection.
//!
//! Set environment variables before building to configure the firmware:
//!
//!   DOOR_SSID=MyWiFi \
//!   DOOR_PASSWORD=secret123 \
//!   DOOR_HOST=192.168.1.10 \
//!   DOOR_PORT=8080 \
//!   DOOR_PATH=/rfid-auth/auth.php \
//!   DOOR_DEVICE_ID=frontdoor \
//!   cargo build --release

fn main() {
    // Re-run build script if these environment variables change
    println!("cargo::rerun-if-env-changed=DOOR_SSID");
    println!("cargo::rerun-if-env-changed=DOOR_PASSWORD");
    println!("cargo::rerun-if-env-changed=DOOR_HOST");
    println!("cargo::rerun-if-env-changed=DOOR_PORT");
    println!("cargo::rerun-if-env-changed=DOOR_PATH");
    println!("cargo::rerun-if-env-changed=DOOR_DEVICE_ID");
    println!("cargo::rerun-if-env-changed=DOOR_CARD_AUTH");
    println!("cargo::rerun-if-env-changed=DOOR_CODE_AUTH");
    println!("cargo::rerun-if-env-changed=DOOR_DEBUG");
}
