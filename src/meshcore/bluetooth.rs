//! BlueZ helpers for Bluetooth companion targets.
//!
//! A Bluetooth companion is reached either through an RFCOMM serial bridge
//! (`rfcomm bind` or similar, named by a `/dev/...` device hint) or, in
//! builds with the `ble` feature, directly over the Nordic UART service.
//! Besides picking the advertised radio to use, the only direct BlueZ
//! interaction is asking the daemon to drop a device link on shutdown so the
//! radio will accept a new connection right away.

use log::{info, warn};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::CompanionTarget;

pub const DEFAULT_ADAPTER: &str = "hci0";

/// D-Bus object path of a device, e.g. `/org/bluez/hci0/dev_C0_FF_EE_00_11_22`.
pub fn bluez_device_path(address: &str, adapter: &str) -> String {
    format!(
        "/org/bluez/{}/dev_{}",
        adapter,
        address.trim().to_ascii_uppercase().replace(':', "_")
    )
}

/// Device hints that name a serial bridge node.
pub fn rfcomm_candidates(target: &CompanionTarget) -> Vec<String> {
    target
        .bluetooth_devices()
        .into_iter()
        .filter(|d| d.starts_with('/'))
        .collect()
}

/// Advertising prefix of MeshCore companion firmware.
pub const ADVERTISED_PREFIX: &str = "MeshCore";

/// Whether a scanned peripheral is the companion `target` asks for.
///
/// A MAC hint must match exactly (case-insensitive). Without one, a name hint
/// must match the advertised name; with no hints at all any radio advertising
/// as MeshCore is taken.
pub fn ble_candidate_matches(target: &CompanionTarget, address: &str, name: Option<&str>) -> bool {
    let addresses = target.bluetooth_addresses();
    if !addresses.is_empty() {
        return addresses.iter().any(|a| a.trim().eq_ignore_ascii_case(address.trim()));
    }
    let name = name.unwrap_or("").trim();
    let hints: Vec<String> = target
        .bluetooth_devices()
        .into_iter()
        .filter(|d| !d.starts_with('/'))
        .collect();
    if hints.is_empty() {
        return name.starts_with(ADVERTISED_PREFIX);
    }
    !name.is_empty() && hints.iter().any(|h| h.trim().eq_ignore_ascii_case(name))
}

/// Ask BlueZ to disconnect `address` via `busctl`. Returns whether it succeeded.
pub async fn disconnect_device(address: &str, adapter: &str, limit: Duration) -> bool {
    if address.trim().is_empty() {
        return false;
    }
    let path = bluez_device_path(address, adapter);
    let child = Command::new("busctl")
        .args([
            "--system",
            "call",
            "org.bluez",
            path.as_str(),
            "org.bluez.Device1",
            "Disconnect",
        ])
        .kill_on_drop(true)
        .output();

    match timeout(limit, child).await {
        Err(_) => {
            warn!("Bluetooth disconnect command timed out for {}", address);
            false
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("busctl not available; cannot disconnect bluetooth device");
            false
        }
        Ok(Err(e)) => {
            warn!("Failed to invoke busctl for bluetooth disconnect: {}", e);
            false
        }
        Ok(Ok(output)) if output.status.success() => {
            info!("Requested bluetooth disconnect for {} via BlueZ", address);
            true
        }
        Ok(Ok(output)) => {
            warn!(
                "Bluetooth disconnect for {} failed: {}",
                address,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
    }
}
