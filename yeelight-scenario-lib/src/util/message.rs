use std::fmt::{Display, Formatter};
use std::num::ParseIntError;

use serde::Serialize;
use thiserror::Error;
use url::{Host, Url};

/// Header lines after which a datagram is treated as a bulb announcement.
///
/// `NOTIFY` is the periodic multicast advertisement, `200 OK` is the reply to
/// an `M-SEARCH` probe. Both carry the same set of headers.
pub const RECOGNIZED_HEADER_LINES: [&str; 2] = ["NOTIFY * HTTP/1.1", "HTTP/1.1 200 OK"];

/// Errors raised while decoding a discovery message that announced itself as
/// one of ours but carried a malformed value.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid integer for `{key}`: {source}")]
    InvalidInteger {
        key: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid Location `{value}`: {reason}")]
    InvalidLocation { value: String, reason: String },
    #[error("discovery message has no Location header")]
    MissingLocation,
}

/// One snapshot of the state a bulb advertised or reported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Host part of the `Location` header. Used as the join key to scenarios.
    pub identity: String,
    /// Color temperature in Kelvin.
    pub color_temperature: u32,
    /// Active color mode, passed through untouched.
    pub color_mode: u8,
    /// Brightness in percent.
    pub brightness: u8,
}

impl Display for DeviceRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Host: {}, Color temperature: {}K, Brightness: {}%, Color mode: {}",
            self.identity, self.color_temperature, self.brightness, self.color_mode
        )
    }
}

impl DeviceRecord {
    /**
    Decodes a raw discovery datagram.

    Lines up to and including the first recognized header line are skipped.
    Every following `Key: Value` line is inspected; unknown keys and lines
    without the `": "` separator are ignored.

    Returns `Ok(None)` when no recognized header line is present, which is the
    case for foreign SSDP traffic sharing the multicast group.
    */
    pub fn parse(data: &[u8]) -> Result<Option<DeviceRecord>, ParseError> {
        // Receive buffers are fixed size, so the tail may be NUL padding.
        let raw = String::from_utf8_lossy(data);
        let mut lines = raw.trim_end_matches('\0').lines();

        if !lines
            .by_ref()
            .any(|line| RECOGNIZED_HEADER_LINES.contains(&line.trim_end()))
        {
            return Ok(None);
        }

        let mut identity = None;
        let mut color_temperature = 0;
        let mut color_mode = 0;
        let mut brightness = 0;

        for line in lines {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            let value = value.trim();
            match key {
                "Location" => identity = Some(Self::parse_location(value)?),
                "ct" => color_temperature = Self::parse_integer("ct", value)?,
                "bright" => brightness = Self::parse_integer("bright", value)?,
                "color_mode" => color_mode = Self::parse_integer("color_mode", value)?,
                _ => {}
            }
        }

        let identity = identity.ok_or(ParseError::MissingLocation)?;
        Ok(Some(DeviceRecord {
            identity,
            color_temperature,
            color_mode,
            brightness,
        }))
    }

    fn parse_integer<T>(key: &'static str, value: &str) -> Result<T, ParseError>
    where
        T: std::str::FromStr<Err = ParseIntError>,
    {
        value
            .parse::<T>()
            .map_err(|source| ParseError::InvalidInteger { key, source })
    }

    // Keeps only the hostname, without port or IPv6 brackets.
    fn parse_location(value: &str) -> Result<String, ParseError> {
        let url = Url::parse(value).map_err(|e| ParseError::InvalidLocation {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => Ok(domain.to_string()),
            Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
            Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
            _ => Err(ParseError::InvalidLocation {
                value: value.to_string(),
                reason: "no host".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFY: &str = "NOTIFY * HTTP/1.1\r\n\
        Host: 239.255.255.250:1982\r\n\
        Cache-Control: max-age=3600\r\n\
        Location: yeelight://192.168.1.239:55443\r\n\
        NTS: ssdp:alive\r\n\
        Server: POSIX, UPnP/1.0 YGLC/1\r\n\
        id: 0x000000000015243f\r\n\
        model: color\r\n\
        fw_ver: 18\r\n\
        support: get_prop set_default set_power toggle set_bright\r\n\
        power: on\r\n\
        bright: 100\r\n\
        color_mode: 2\r\n\
        ct: 4000\r\n\
        rgb: 16711680\r\n\
        hue: 100\r\n\
        sat: 35\r\n\
        name: my_bulb\r\n";

    #[test]
    fn test_parse_notify_announcement() {
        let record = DeviceRecord::parse(NOTIFY.as_bytes()).unwrap().unwrap();
        assert_eq!(
            record,
            DeviceRecord {
                identity: "192.168.1.239".to_string(),
                color_temperature: 4000,
                color_mode: 2,
                brightness: 100,
            }
        );
    }

    #[test]
    fn test_parse_search_reply_with_lf_lines() {
        let message = "HTTP/1.1 200 OK\nLocation: yeelight://10.0.0.7:55443\nct: 2700\nbright: 20\ncolor_mode: 2\n";
        let record = DeviceRecord::parse(message.as_bytes()).unwrap().unwrap();
        assert_eq!(record.identity, "10.0.0.7");
        assert_eq!(record.color_temperature, 2700);
        assert_eq!(record.brightness, 20);
        assert_eq!(record.color_mode, 2);
    }

    #[test]
    fn test_parse_ignores_lines_before_header() {
        let message = "garbage\r\nct: nope\r\nHTTP/1.1 200 OK\r\nLocation: yeelight://10.0.0.8\r\nct: 3000\r\n";
        let record = DeviceRecord::parse(message.as_bytes()).unwrap().unwrap();
        assert_eq!(record.identity, "10.0.0.8");
        assert_eq!(record.color_temperature, 3000);
    }

    #[test]
    fn test_parse_trailing_nul_padding() {
        let mut buffer = [0u8; 1024];
        let message = b"HTTP/1.1 200 OK\r\nLocation: yeelight://10.0.0.9:55443\r\nbright: 5";
        buffer[..message.len()].copy_from_slice(message);
        let record = DeviceRecord::parse(&buffer).unwrap().unwrap();
        assert_eq!(record.brightness, 5);
    }

    #[test]
    fn test_parse_foreign_packet_is_not_applicable() {
        let message = "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1982\r\nST: wifi_bulb\r\n";
        assert!(DeviceRecord::parse(message.as_bytes()).unwrap().is_none());
        assert!(DeviceRecord::parse(b"").unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_non_numeric_ct() {
        let message = "NOTIFY * HTTP/1.1\r\nLocation: yeelight://192.168.1.239:55443\r\nct: warm\r\n";
        let err = DeviceRecord::parse(message.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidInteger { key: "ct", .. }));
    }

    #[test]
    fn test_parse_rejects_bad_location() {
        let message = "NOTIFY * HTTP/1.1\r\nLocation: not a url\r\n";
        let err = DeviceRecord::parse(message.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidLocation { .. }));
    }

    #[test]
    fn test_parse_requires_location() {
        let message = "NOTIFY * HTTP/1.1\r\nct: 3000\r\n";
        let err = DeviceRecord::parse(message.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::MissingLocation));
    }

    #[test]
    fn test_parse_splits_on_first_separator_only() {
        let message = "NOTIFY * HTTP/1.1\r\nLocation: yeelight://bulb.lan:55443\r\nname: a: b\r\nno separator\r\n";
        let record = DeviceRecord::parse(message.as_bytes()).unwrap().unwrap();
        assert_eq!(record.identity, "bulb.lan");
    }
}
