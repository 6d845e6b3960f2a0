use serde::{Deserialize, Deserializer, Serialize};
use std::net::IpAddr;

/// Record version tag carried by every event written to the log
pub const EVENT_SCHEMA: &str = "bgp.v1";

pub const ANNOUNCE_COLOR: &str = "#3ddc97";
pub const WITHDRAW_COLOR: &str = "#ff4d6d";

/// Update kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Announce,
    Withdraw,
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Announce => "announce",
            EventKind::Withdraw => "withdraw",
        }
    }

    /// Display hint for the rendering client
    pub fn color(&self) -> &'static str {
        match self {
            EventKind::Announce => ANNOUNCE_COLOR,
            EventKind::Withdraw => WITHDRAW_COLOR,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point on the globe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Geographic resolution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    pub label: String,
    pub country: String,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64, label: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            lat,
            lng,
            label: label.into(),
            country: country.into(),
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

/// One routing change for one prefix.
///
/// Created by the normalizer, enriched once with `src`/`dst`, then appended
/// to the durable log and never touched again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub schema: String,
    pub ts: f64,
    pub kind: EventKind,
    pub prefix: String,
    pub origin_id: Option<u32>,
    pub peer_id: u32,
    pub path: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<Coordinates>,
    pub color: String,
}

impl Event {
    /// Announcement for `prefix`. An empty path falls back to `[peer, origin]`.
    pub fn announce(ts: f64, prefix: String, origin_id: u32, peer_id: u32, path: Vec<u32>) -> Self {
        let path = if path.is_empty() {
            vec![peer_id, origin_id]
        } else {
            path
        };

        Self {
            schema: EVENT_SCHEMA.to_string(),
            ts,
            kind: EventKind::Announce,
            prefix,
            origin_id: Some(origin_id),
            peer_id,
            path,
            src: None,
            dst: None,
            color: EventKind::Announce.color().to_string(),
        }
    }

    /// Withdrawal for `prefix`: no origin and no path.
    pub fn withdraw(ts: f64, prefix: String, peer_id: u32) -> Self {
        Self {
            schema: EVENT_SCHEMA.to_string(),
            ts,
            kind: EventKind::Withdraw,
            prefix,
            origin_id: None,
            peer_id,
            path: Vec::new(),
            src: None,
            dst: None,
            color: EventKind::Withdraw.color().to_string(),
        }
    }

    /// Exact ordered join of the path; any reorder or element change differs.
    pub fn path_fingerprint(&self) -> String {
        self.path
            .iter()
            .map(|asn| asn.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Network address of the prefix, used for address-based geolocation
    pub fn sample_address(&self) -> Option<IpAddr> {
        self.prefix.split('/').next()?.trim().parse().ok()
    }

    pub fn is_enriched(&self) -> bool {
        self.src.is_some() && self.dst.is_some()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

// =============================================================================
// FEED PAYLOAD
// =============================================================================

/// One element of an AS path: a plain hop or an aggregated set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Asn(u32),
    Set(Vec<u32>),
}

impl PathSegment {
    /// Representative hop: the ASN itself, or the first member of a set
    pub fn primary(&self) -> Option<u32> {
        match self {
            PathSegment::Asn(asn) => Some(*asn),
            PathSegment::Set(members) => members.first().copied(),
        }
    }
}

/// Announcement group: prefixes sharing one next hop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(default)]
    pub next_hop: Option<String>,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Already-parsed UPDATE message as delivered by the feed
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawUpdateMessage {
    #[serde(default)]
    pub timestamp: Option<f64>,
    /// Peer address
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default, deserialize_with = "deserialize_asn")]
    pub peer_asn: Option<u32>,
    /// Collector the message came from
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Vec<PathSegment>,
    #[serde(default)]
    pub announcements: Vec<Announcement>,
    #[serde(default)]
    pub withdrawals: Vec<String>,
}

/// ASNs arrive either as numbers or as decimal strings
fn deserialize_asn<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAsn {
        Num(u32),
        Text(String),
    }

    Ok(match Option::<RawAsn>::deserialize(deserializer)? {
        Some(RawAsn::Num(asn)) => Some(asn),
        Some(RawAsn::Text(text)) => text.trim().parse().ok(),
        None => None,
    })
}

// =============================================================================
// SUBSCRIBER FRAMES
// =============================================================================

/// Server -> viewer frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Bgp { items: Vec<Event> },
    Ping,
}

// =============================================================================
// PARSE OUTCOMES
// =============================================================================

/// Why a frame, message or log entry was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Malformed(String),
    MissingPayload,
    MissingPeer,
    MissingTimestamp,
    MissingSource,
    NoPrefixes,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed: {}", e),
            Self::MissingPayload => write!(f, "missing_payload"),
            Self::MissingPeer => write!(f, "missing_peer"),
            Self::MissingTimestamp => write!(f, "missing_timestamp"),
            Self::MissingSource => write!(f, "missing_source"),
            Self::NoPrefixes => write!(f, "no_prefixes"),
        }
    }
}

/// Tagged parse result shared by every drop-and-continue boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    Rejected(RejectReason),
}

impl<T> ParseOutcome<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    pub fn parsed(self) -> Option<T> {
        match self {
            ParseOutcome::Parsed(value) => Some(value),
            ParseOutcome::Rejected(_) => None,
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> ParseOutcome<U>) -> ParseOutcome<U> {
        match self {
            ParseOutcome::Parsed(value) => f(value),
            ParseOutcome::Rejected(reason) => ParseOutcome::Rejected(reason),
        }
    }
}

impl<T> From<serde_json::Result<T>> for ParseOutcome<T> {
    fn from(result: serde_json::Result<T>) -> Self {
        match result {
            Ok(value) => ParseOutcome::Parsed(value),
            Err(e) => ParseOutcome::Rejected(RejectReason::Malformed(e.to_string())),
        }
    }
}
