//! Device identity helpers.

use std::{fs, path::Path};

use log::{debug, warn};

const NET_CLASS_DIR: &str = "/sys/class/net";

/// Last three bytes of the device MAC as lowercase hex (e.g. `"a1b2c3"`).
///
/// An explicit `device_id` wins. Otherwise the first non-loopback interface
/// with a non-zero address is used; without one a random suffix is generated.
pub fn mac_suffix(device_id: Option<&str>) -> String {
    if let Some(id) = device_id {
        return id.to_lowercase();
    }
    match mac_from_sysfs(Path::new(NET_CLASS_DIR)) {
        Some(suffix) => suffix,
        None => {
            let suffix = format!("{:06x}", rand::random::<u32>() & 0x00FF_FFFF);
            warn!("No network interface MAC found, using random device id {suffix}");
            suffix
        }
    }
}

/// MQTT client identifier for this device.
pub fn client_id(suffix: &str) -> String {
    format!("neopixelcontroller-{suffix}")
}

fn mac_from_sysfs(dir: &Path) -> Option<String> {
    let mut interfaces: Vec<_> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != "lo")
        .map(|entry| entry.path())
        .collect();
    interfaces.sort();

    interfaces.iter().find_map(|iface| {
        let address = fs::read_to_string(iface.join("address")).ok()?;
        let suffix = suffix_from_address(address.trim())?;
        debug!("Using MAC of {} for device id", iface.display());
        Some(suffix)
    })
}

fn suffix_from_address(address: &str) -> Option<String> {
    let bytes: Vec<&str> = address.split(':').collect();
    if bytes.len() != 6 || bytes.iter().any(|b| b.len() != 2 || u8::from_str_radix(b, 16).is_err()) {
        return None;
    }
    if bytes.iter().all(|b| *b == "00") {
        return None;
    }
    Some(bytes[3..].concat().to_lowercase())
}
