//! Decoding of renderer payloads: SOAP response fields, GENA event bodies and
//! the escaped `LastChange` documents they carry.
//!
//! Renderers send small, flat documents, so extraction is done with a few
//! patterns over the text rather than a full XML parser.

use crate::dlna::types::TransportState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;

static LEAF_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:[\w-]+:)?([A-Za-z_][\w.-]*)(?:\s[^>]*)?>([^<]*)</(?:[\w-]+:)?([A-Za-z_][\w.-]*)>")
        .unwrap()
});

static LAST_CHANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<LastChange>(.*?)</LastChange>").unwrap());

static VAL_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<([A-Za-z_][\w]*)\s[^>]*?\bval="([^"]*)""#).unwrap());

static DIDL_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<dc:title>(.*?)</dc:title>").unwrap());

/// Text content of every leaf element, keyed by local name. Later
/// occurrences win.
pub fn leaf_elements(body: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for caps in LEAF_ELEMENT.captures_iter(body) {
        if caps[1] != caps[3] {
            continue;
        }
        out.insert(caps[1].to_string(), xml_unescape(&caps[2]));
    }
    out
}

/// State carried by one inbound event. Absent fields were not reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventUpdate {
    pub transport_state: Option<TransportState>,
    /// Native device volume.
    pub volume: Option<u32>,
    pub mute: Option<bool>,
    pub uri: Option<String>,
    pub metadata: Option<String>,
    pub position: Option<Duration>,
    pub duration: Option<Duration>,
}

impl EventUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn from_values(values: &HashMap<String, String>) -> Self {
        let get = |key: &str| values.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        Self {
            transport_state: get("TransportState").and_then(|v| v.parse().ok()),
            volume: get("Volume").and_then(|v| v.parse().ok()),
            mute: get("Mute").and_then(parse_bool),
            uri: get("CurrentTrackURI")
                .or_else(|| get("AVTransportURI"))
                .map(str::to_string),
            metadata: get("CurrentTrackMetaData")
                .or_else(|| get("AVTransportURIMetaData"))
                .filter(|v| *v != "NOT_IMPLEMENTED")
                .map(str::to_string),
            position: get("RelativeTimePosition").and_then(parse_duration),
            duration: get("CurrentTrackDuration")
                .or_else(|| get("CurrentMediaDuration"))
                .and_then(parse_duration),
        }
    }
}

/// Decodes a NOTIFY body. Values inside an escaped `LastChange` document are
/// read from their `val` attributes; properties sent directly are read as
/// leaf elements.
pub fn parse_event(body: &str) -> EventUpdate {
    let mut values = leaf_elements(body);
    values.remove("LastChange");

    if let Some(caps) = LAST_CHANGE.captures(body) {
        let doc = xml_unescape(&caps[1]);
        for caps in VAL_ATTRIBUTE.captures_iter(&doc) {
            values.insert(caps[1].to_string(), xml_unescape(&caps[2]));
        }
    }
    EventUpdate::from_values(&values)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parses `H:MM:SS` with optional fractional seconds. Sentinels such as
/// `NOT_IMPLEMENTED` and `-:--:--` mean unknown, as does anything too
/// large to represent.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() || s == "NOT_IMPLEMENTED" || s == "-:--:--" {
        return None;
    }

    let parts: Vec<_> = s.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    let whole = hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?;
    let fraction = Duration::try_from_secs_f64(seconds).ok()?;
    Duration::from_secs(whole).checked_add(fraction)
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Title from DIDL-Lite metadata, which may arrive escaped once more.
pub fn didl_title(metadata: &str) -> Option<String> {
    let doc = if metadata.contains("&lt;") {
        xml_unescape(metadata)
    } else {
        metadata.to_string()
    };
    DIDL_TITLE
        .captures(&doc)
        .map(|caps| xml_unescape(caps[1].trim()))
        .filter(|t| !t.is_empty())
}

pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

pub fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
