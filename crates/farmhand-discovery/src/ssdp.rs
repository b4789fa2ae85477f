//! SSDP wire format for Bambu printer discovery.
//!
//! Bambu printers answer SSDP searches on a non-standard port with the
//! usual header block. Header names are matched case-insensitively and
//! anything that does not look like a Bambu device is ignored.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Multicast group discovery queries are sent to.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Discovery port used by Bambu printers (not the standard SSDP 1900).
pub const DISCOVERY_PORT: u16 = 2021;

/// Search target announced by Bambu printers.
pub const SEARCH_TARGET: &str = "urn:bambulab-com:device:3dprinter:1";

/// Vendor token used to filter unrelated SSDP traffic.
const VENDOR_TOKEN: &str = "bambulab";

/// URN prefix carried by the NT header; the device model follows it.
const DEVICE_URN_PREFIX: &str = "urn:bambulab-com:device:";

/// A printer seen during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPrinter {
    /// Printer serial number, unique per device.
    pub serial: String,
    /// Device name reported by the printer; the serial if unnamed.
    pub name: String,
    /// Address the response arrived from.
    pub ip_address: IpAddr,
    /// Model name (e.g., "X1C", "P1S", "A1"), if reported.
    pub model: Option<String>,
    /// When the printer was first seen in the current session.
    pub discovered_at: DateTime<Utc>,
}

/// Builds the M-SEARCH datagram for the given group and port.
pub fn build_msearch(group: Ipv4Addr, port: u16) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {group}:{port}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {SEARCH_TARGET}\r\n\
         \r\n"
    )
}

/// Decodes a datagram as UTF-8 text, dropping undecodable bytes.
/// Everything decodable around a bad sequence is kept.
pub fn decode_text(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    text
}

/// Parses an SSDP response or announcement into a printer record.
///
/// Returns `None` for traffic that is not from a Bambu printer or that
/// carries no usable serial.
pub fn parse_response(text: &str, source: IpAddr) -> Option<DiscoveredPrinter> {
    if !text.contains(SEARCH_TARGET) && !text.to_ascii_lowercase().contains(VENDOR_TOKEN) {
        return None;
    }

    let mut serial = None;
    let mut name = None;
    let mut model = None;
    let mut device_type = None;

    for line in text.lines() {
        if let Some(value) = header_value(line, "USN") {
            serial = parse_usn(value);
        } else if let Some(value) = header_value(line, "DevName.bambu.com") {
            if !value.is_empty() {
                name = Some(value.to_string());
            }
        } else if let Some(value) = header_value(line, "DevModel.bambu.com") {
            if !value.is_empty() {
                model = Some(value.to_string());
            }
        } else if let Some(value) = header_value(line, "NT") {
            device_type = parse_device_type(value);
        }
    }

    let serial = serial?;
    Some(DiscoveredPrinter {
        name: name.unwrap_or_else(|| serial.clone()),
        ip_address: source,
        model: model.or(device_type),
        discovered_at: Utc::now(),
        serial,
    })
}

/// Returns the trimmed value of `line` when its header name matches
/// `name` case-insensitively.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (header, value) = line.split_once(':')?;
    if header.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

/// Extracts the serial from a USN value.
///
/// Handles both bare serials and the `uuid:SERIAL::urn:...` form.
fn parse_usn(value: &str) -> Option<String> {
    let value = strip_prefix_ignore_case(value, "uuid:").unwrap_or(value);
    let serial = value.split("::").next()?;
    serial.split_whitespace().next().map(str::to_string)
}

/// Pulls the model segment out of an NT value such as
/// `urn:bambulab-com:device:X1C:1`.
fn parse_device_type(value: &str) -> Option<String> {
    let rest = strip_prefix_ignore_case(value, DEVICE_URN_PREFIX)?;
    let model = rest.split(':').next().unwrap_or(rest);
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Option<DiscoveredPrinter> {
        let ip: IpAddr = "192.168.1.100".parse().unwrap();
        parse_response(text, ip)
    }

    #[test]
    fn test_parse_full_response() {
        let response = r#"HTTP/1.1 200 OK
CACHE-CONTROL: max-age=1800
NT: urn:bambulab-com:device:3dprinter:1
USN: uuid:00M00A2B012345::urn:bambulab-com:device:3dprinter:1
DevModel.bambu.com: X1C
DevName.bambu.com: My Printer
DevVersion.bambu.com: 01.07.00.00
"#;
        let printer = parse(response).unwrap();

        assert_eq!(printer.serial, "00M00A2B012345");
        assert_eq!(printer.model.as_deref(), Some("X1C"));
        assert_eq!(printer.name, "My Printer");
        assert_eq!(printer.ip_address.to_string(), "192.168.1.100");
    }

    #[test]
    fn test_bare_serial_with_nt_model() {
        let response = r#"NOTIFY * HTTP/1.1
NT: urn:bambulab-com:device:X1C:1
USN: ABC123
"#;
        let printer = parse(response).unwrap();

        assert_eq!(printer.serial, "ABC123");
        assert_eq!(printer.name, "ABC123");
        assert_eq!(printer.model.as_deref(), Some("X1C"));
    }

    #[test]
    fn test_model_header_beats_nt_fallback() {
        let response = r#"NOTIFY * HTTP/1.1
NT: urn:bambulab-com:device:3dprinter:1
USN: XY900
DevModel.bambu.com: P1S
"#;
        let printer = parse(response).unwrap();
        assert_eq!(printer.model.as_deref(), Some("P1S"));
    }

    #[test]
    fn test_ignores_foreign_devices() {
        let response = r#"HTTP/1.1 200 OK
ST: urn:schemas-upnp-org:device:MediaRenderer:1
USN: uuid:abcd-1234::urn:schemas-upnp-org:device:MediaRenderer:1
"#;
        assert!(parse(response).is_none());
    }

    #[test]
    fn test_missing_serial_is_dropped() {
        let response = r#"HTTP/1.1 200 OK
ST: urn:bambulab-com:device:3dprinter:1
DevName.bambu.com: Orphan
"#;
        assert!(parse(response).is_none());
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let response = r#"HTTP/1.1 200 OK
st: urn:bambulab-com:device:3dprinter:1
usn: uuid:AC12309BH109
devname.bambu.com: Print Farm 3
"#;
        let printer = parse(response).unwrap();

        assert_eq!(printer.serial, "AC12309BH109");
        assert_eq!(printer.name, "Print Farm 3");
        assert!(printer.model.is_none());
    }

    #[test]
    fn test_msearch_format() {
        let query = build_msearch(MULTICAST_GROUP, DISCOVERY_PORT);

        assert!(query.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(query.contains("HOST: 239.255.255.250:2021\r\n"));
        assert!(query.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(query.contains("MX: 3\r\n"));
        assert!(query.contains("ST: urn:bambulab-com:device:3dprinter:1\r\n"));
        assert!(query.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_decode_drops_undecodable_bytes() {
        let mut raw = b"USN: AB".to_vec();
        raw.push(0xFF);
        raw.extend_from_slice(b"C123\r\n");

        // The bad byte vanishes instead of splitting the serial.
        assert_eq!(decode_text(&raw), "USN: ABC123\r\n");
        assert_eq!(decode_text("ST: priv\u{e9}e".as_bytes()), "ST: priv\u{e9}e");
    }
}
