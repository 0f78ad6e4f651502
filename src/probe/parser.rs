//! Device-time extraction from status payloads
//!
//! Firmware families answer the status request in different shapes: CP Plus and
//! Dahua reply with `key=value` lines, Hikvision with an ISAPI XML document. Each
//! shape is a [`DeviceTimeParser`]; the [`ParserRegistry`] maps protocol types to
//! parsers and can be extended for new firmware without touching the prober.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::ProtocolType;

/// Why a well-formed response did not yield a device time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The field carrying the time is absent
    MissingField(String),

    /// The field is present but its value is not a recognizable time
    InvalidTime(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingField(field) => write!(f, "payload has no '{field}' field"),
            ParseError::InvalidTime(value) => write!(f, "unrecognized device time '{value}'"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Extracts the device clock from a status payload
///
/// `default_offset` applies when the payload carries a local time without offset.
pub trait DeviceTimeParser: Send + Sync {
    fn parse(
        &self,
        payload: &str,
        default_offset: FixedOffset,
    ) -> Result<DateTime<FixedOffset>, ParseError>;
}

/// `key=value` lines, e.g. `result=2025-08-27 14:30:00`
#[derive(Debug, Clone)]
pub struct KeyValueTimeParser {
    field: String,
}

impl KeyValueTimeParser {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl DeviceTimeParser for KeyValueTimeParser {
    fn parse(
        &self,
        payload: &str,
        default_offset: FixedOffset,
    ) -> Result<DateTime<FixedOffset>, ParseError> {
        let value = payload
            .lines()
            .filter_map(|line| line.split_once('='))
            .find(|(key, _)| key.trim() == self.field)
            .map(|(_, value)| value.trim())
            .ok_or_else(|| ParseError::MissingField(self.field.clone()))?;

        parse_device_time(value, default_offset)
            .ok_or_else(|| ParseError::InvalidTime(value.to_string()))
    }
}

/// Text content of a single XML element, e.g. `<localTime>...</localTime>`
#[derive(Debug, Clone)]
pub struct XmlElementTimeParser {
    element: String,
    pattern: Regex,
}

impl XmlElementTimeParser {
    pub fn new(element: &str) -> Self {
        let pattern = Regex::new(&format!(
            r"<{0}(?:\s[^>]*)?>\s*([^<]*?)\s*</{0}>",
            regex::escape(element)
        ))
        .unwrap_or_else(|_| unreachable!("escaped element name always forms a valid pattern"));

        Self {
            element: element.to_string(),
            pattern,
        }
    }
}

impl DeviceTimeParser for XmlElementTimeParser {
    fn parse(
        &self,
        payload: &str,
        default_offset: FixedOffset,
    ) -> Result<DateTime<FixedOffset>, ParseError> {
        let value = self
            .pattern
            .captures(payload)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| ParseError::MissingField(self.element.clone()))?;

        parse_device_time(value, default_offset)
            .ok_or_else(|| ParseError::InvalidTime(value.to_string()))
    }
}

/// Maps each protocol type to the parser for its status payload
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<ProtocolType, Arc<dyn DeviceTimeParser>>,
}

impl ParserRegistry {
    /// Registry without any parsers
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Replace the parser used for a protocol type
    pub fn register(&mut self, protocol: ProtocolType, parser: Arc<dyn DeviceTimeParser>) {
        self.parsers.insert(protocol, parser);
    }

    pub fn get(&self, protocol: ProtocolType) -> Option<&Arc<dyn DeviceTimeParser>> {
        self.parsers.get(&protocol)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();

        let key_value: Arc<dyn DeviceTimeParser> = Arc::new(KeyValueTimeParser::new("result"));
        registry.register(ProtocolType::CpPlus, key_value.clone());
        registry.register(ProtocolType::Dahua, key_value);
        registry.register(
            ProtocolType::Hikvision,
            Arc::new(XmlElementTimeParser::new("localTime")),
        );

        registry
    }
}

/// Local date-time layouts seen on DVR firmware, tried in order
const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d-%m-%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y %m %d %H:%M:%S",
    "%d %m %Y %H:%M:%S",
    "%Y-%m-%d %I:%M:%S %p",
    "%d-%m-%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M:%S %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%m/%d/%Y"];

/// Parse a device-reported time in any of the layouts DVR firmware uses
///
/// Accepts RFC 3339, Unix seconds and the local layouts above. Local times are
/// placed in `default_offset`. Years outside 1900..=2100 are rejected; they come
/// from devices with an unset clock.
pub fn parse_device_time(raw: &str, default_offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parsed = if raw.chars().all(|c| c.is_ascii_digit()) {
        raw.parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .map(|utc| utc.with_timezone(&default_offset))
    } else if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        Some(parsed)
    } else {
        parse_local(raw).and_then(|naive| default_offset.from_local_datetime(&naive).single())
    };

    parsed.filter(|time| (1900..=2100).contains(&time.year()))
}

fn parse_local(raw: &str) -> Option<NaiveDateTime> {
    DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}
