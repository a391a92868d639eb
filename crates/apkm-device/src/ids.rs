/// Prefix of registry keys for devices addressed only by serial (USB).
pub const USB_KEY_PREFIX: &str = "usb:";

pub fn normalize_adb_addr(addr: &str) -> String {
    let addr = addr.trim();
    let lower = addr.to_ascii_lowercase();
    for prefix in ["localhost:", "127.0.0.1:", "0.0.0.0:", "[::1]:", "[::]:"] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return format!("localhost:{rest}");
        }
    }
    addr.to_string()
}

pub fn normalize_device_id(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.contains(':') {
        return normalize_adb_addr(trimmed);
    }
    trimmed.to_string()
}

pub fn normalize_device_id_for_compare(value: &str) -> String {
    normalize_device_id(value).to_ascii_lowercase()
}

/// Form adb itself lists loopback endpoints under.
pub fn canonicalize_adb_serial(addr: &str) -> String {
    let addr = addr.trim();
    for prefix in ["localhost:", "0.0.0.0:", "[::1]:", "[::]:"] {
        if let Some(rest) = addr.strip_prefix(prefix) {
            return format!("127.0.0.1:{rest}");
        }
    }
    addr.to_string()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Registry key: the normalised endpoint when one is given, otherwise a
/// `usb:`-prefixed serial. `None` when neither identifier is present.
pub fn session_key(serial: Option<&str>, endpoint: Option<&str>) -> Option<String> {
    if let Some(endpoint) = non_empty(endpoint) {
        return Some(normalize_device_id_for_compare(endpoint));
    }
    non_empty(serial).map(|serial| format!("{USB_KEY_PREFIX}{serial}"))
}
