//! ASN geolocation
//!
//! Fallback chain, first success wins:
//! 1. curated table of well-known ASNs (operational location of the network)
//! 2. optional MaxMind City lookup of the prefix's first address
//! 3. deterministic hub chosen by `asn % hubs`
//!
//! A result always exists.

use crate::config::GeoConfig;
use crate::metrics::PipelineMetrics;
use crate::models::{Event, EventKind, GeoPoint};
use anyhow::{Context, Result};
use maxminddb::geoip2;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

lazy_static::lazy_static! {
    static ref WELL_KNOWN: Vec<(u32, GeoPoint)> = vec![
        (174, GeoPoint::new(38.90, -77.04, "Cogent", "US")),
        (209, GeoPoint::new(39.74, -104.99, "Lumen", "US")),
        (701, GeoPoint::new(38.88, -77.17, "Verizon Business", "US")),
        (1239, GeoPoint::new(38.95, -94.67, "Sprint", "US")),
        (1299, GeoPoint::new(59.33, 18.07, "Arelion", "SE")),
        (2828, GeoPoint::new(38.95, -77.35, "XO Communications", "US")),
        (2914, GeoPoint::new(35.68, 139.69, "NTT", "JP")),
        (3257, GeoPoint::new(38.92, -77.23, "GTT", "US")),
        (3320, GeoPoint::new(50.73, 7.10, "Deutsche Telekom", "DE")),
        (3356, GeoPoint::new(39.93, -105.07, "Level3", "US")),
        (3491, GeoPoint::new(22.32, 114.17, "PCCW Global", "HK")),
        (5511, GeoPoint::new(48.86, 2.35, "Orange", "FR")),
        (6453, GeoPoint::new(19.08, 72.88, "Tata Communications", "IN")),
        (6461, GeoPoint::new(40.01, -105.27, "Zayo", "US")),
        (6762, GeoPoint::new(41.90, 12.50, "Telecom Italia Sparkle", "IT")),
        (6830, GeoPoint::new(52.37, 4.90, "Liberty Global", "NL")),
        (7018, GeoPoint::new(32.78, -96.80, "AT&T", "US")),
        (12956, GeoPoint::new(40.42, -3.70, "Telefonica", "ES")),
        (6939, GeoPoint::new(37.55, -121.99, "Hurricane Electric", "US")),
        (13335, GeoPoint::new(37.78, -122.39, "Cloudflare", "US")),
        (15169, GeoPoint::new(37.42, -122.08, "Google", "US")),
        (16509, GeoPoint::new(47.61, -122.33, "Amazon", "US")),
        (8075, GeoPoint::new(47.64, -122.13, "Microsoft", "US")),
        (32934, GeoPoint::new(37.48, -122.15, "Meta", "US")),
        (20940, GeoPoint::new(42.36, -71.06, "Akamai", "US")),
        (2906, GeoPoint::new(37.26, -121.96, "Netflix", "US")),
        (54113, GeoPoint::new(37.77, -122.42, "Fastly", "US")),
        (4134, GeoPoint::new(39.90, 116.40, "China Telecom", "CN")),
        (4837, GeoPoint::new(39.90, 116.40, "China Unicom", "CN")),
        (9808, GeoPoint::new(23.13, 113.26, "China Mobile", "CN")),
        (4766, GeoPoint::new(37.57, 126.98, "Korea Telecom", "KR")),
        (2516, GeoPoint::new(35.68, 139.69, "KDDI", "JP")),
        (7473, GeoPoint::new(1.29, 103.85, "Singtel", "SG")),
        (4637, GeoPoint::new(22.32, 114.17, "Telstra Global", "HK")),
        (1221, GeoPoint::new(-37.81, 144.96, "Telstra", "AU")),
        (7922, GeoPoint::new(39.95, -75.17, "Comcast", "US")),
        (7843, GeoPoint::new(39.74, -104.99, "Charter", "US")),
        (3303, GeoPoint::new(47.38, 8.54, "Swisscom", "CH")),
        (1273, GeoPoint::new(51.51, -0.13, "Vodafone", "GB")),
        (2856, GeoPoint::new(51.51, -0.13, "BT", "GB")),
        (3215, GeoPoint::new(48.86, 2.35, "Orange France", "FR")),
        (8220, GeoPoint::new(51.51, -0.13, "Colt", "GB")),
        (9002, GeoPoint::new(59.44, 24.75, "RETN", "EE")),
        (12389, GeoPoint::new(55.76, 37.62, "Rostelecom", "RU")),
        (20473, GeoPoint::new(40.86, -74.13, "Vultr", "US")),
        (14061, GeoPoint::new(40.71, -74.01, "DigitalOcean", "US")),
        (24940, GeoPoint::new(49.45, 11.08, "Hetzner", "DE")),
        (16276, GeoPoint::new(50.69, 3.17, "OVH", "FR")),
        (37100, GeoPoint::new(-33.92, 18.42, "SEACOM", "ZA")),
        (28573, GeoPoint::new(-23.55, -46.63, "Claro Brasil", "BR")),
        (3333, GeoPoint::new(52.37, 4.90, "RIPE NCC", "NL")),
    ];

    /// Deterministic fallback locations, indexed by `asn % len`
    static ref HUBS: Vec<GeoPoint> = vec![
        GeoPoint::new(50.11, 8.68, "Frankfurt", "DE"),
        GeoPoint::new(52.37, 4.90, "Amsterdam", "NL"),
        GeoPoint::new(51.51, -0.13, "London", "GB"),
        GeoPoint::new(39.04, -77.49, "Ashburn", "US"),
        GeoPoint::new(37.34, -121.89, "San Jose", "US"),
        GeoPoint::new(1.35, 103.82, "Singapore", "SG"),
        GeoPoint::new(35.68, 139.69, "Tokyo", "JP"),
        GeoPoint::new(-33.87, 151.21, "Sydney", "AU"),
        GeoPoint::new(-23.55, -46.63, "Sao Paulo", "BR"),
        GeoPoint::new(-26.20, 28.05, "Johannesburg", "ZA"),
    ];
}

/// One row of a table override file
#[derive(Debug, Clone, Deserialize)]
pub struct GeoTableEntry {
    pub asn: u32,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub country: String,
}

/// Which branch of the chain produced a point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoSource {
    Table,
    Database,
    Hub,
}

pub struct GeoResolver {
    table: HashMap<u32, GeoPoint>,
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    metrics: Arc<PipelineMetrics>,
}

impl GeoResolver {
    /// Built-in table, no address database
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            table: WELL_KNOWN.iter().cloned().collect(),
            reader: None,
            metrics,
        }
    }

    /// Apply the optional database and table override
    pub fn from_config(cfg: &GeoConfig, metrics: Arc<PipelineMetrics>) -> Result<Self> {
        let mut resolver = Self::new(metrics);
        if let Some(path) = &cfg.db_path {
            resolver.open_database(path)?;
        }
        if let Some(path) = &cfg.table_path {
            resolver.load_table_override(path)?;
        }
        Ok(resolver)
    }

    pub fn open_database(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let reader = maxminddb::Reader::open_readfile(path)
            .with_context(|| format!("failed to open geo database {}", path.display()))?;
        info!(path = %path.display(), "geo_database_loaded");
        self.reader = Some(reader);
        Ok(())
    }

    /// Merge a JSON table over the built-in one; file entries win.
    pub fn load_table_override(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read geo table {}", path.display()))?;
        let entries: Vec<GeoTableEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid geo table {}", path.display()))?;

        let count = entries.len();
        for entry in entries {
            let label = if entry.label.is_empty() {
                format!("AS{}", entry.asn)
            } else {
                entry.label
            };
            self.table.insert(
                entry.asn,
                GeoPoint::new(entry.lat, entry.lng, label, entry.country),
            );
        }

        info!(path = %path.display(), entries = count, total = self.table.len(), "geo_table_override_loaded");
        Ok(count)
    }

    pub fn has_database(&self) -> bool {
        self.reader.is_some()
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Resolve an ASN, optionally helped by an address from one of its prefixes.
    pub fn resolve(&self, asn: u32, sample: Option<IpAddr>) -> GeoPoint {
        self.resolve_with_source(asn, sample).0
    }

    pub fn resolve_with_source(&self, asn: u32, sample: Option<IpAddr>) -> (GeoPoint, GeoSource) {
        self.metrics.record_geo_lookup();

        if let Some(point) = self.table.get(&asn) {
            self.metrics.record_geo_table_hit();
            return (point.clone(), GeoSource::Table);
        }

        if let Some(point) = sample.and_then(|ip| self.lookup_address(ip)) {
            self.metrics.record_geo_db_hit();
            return (point, GeoSource::Database);
        }

        self.metrics.record_geo_fallback();
        (hub_for(asn), GeoSource::Hub)
    }

    fn lookup_address(&self, ip: IpAddr) -> Option<GeoPoint> {
        let reader = self.reader.as_ref()?;
        let city: geoip2::City = match reader.lookup(ip) {
            Ok(city) => city,
            Err(e) => {
                debug!(ip = %ip, error = %e, "geo_database_miss");
                return None;
            }
        };

        point_from_city(&city)
    }

    /// Fill `src` (peer) and `dst` (origin for announcements, peer for withdrawals).
    pub fn enrich(&self, event: &mut Event) {
        let sample = event.sample_address();
        let src = self.resolve(event.peer_id, None);
        let dst_asn = match event.kind {
            EventKind::Announce => event.origin_id.unwrap_or(event.peer_id),
            EventKind::Withdraw => event.peer_id,
        };
        let dst = self.resolve(dst_asn, sample);

        event.src = Some(src.coordinates());
        event.dst = Some(dst.coordinates());
    }
}

/// Database record → point. Both coordinates or nothing.
fn point_from_city(city: &geoip2::City) -> Option<GeoPoint> {
    let location = city.location.as_ref()?;
    let (lat, lng) = (location.latitude?, location.longitude?);

    let country = city
        .country
        .as_ref()
        .and_then(|c| c.iso_code)
        .unwrap_or("")
        .to_string();
    let label = city
        .city
        .as_ref()
        .and_then(|c| c.names.as_ref())
        .and_then(|names| names.get("en").copied())
        .map(|name| name.to_string())
        .unwrap_or_else(|| country.clone());

    Some(GeoPoint::new(lat, lng, label, country))
}

fn hub_for(asn: u32) -> GeoPoint {
    let idx = asn as usize % HUBS.len();
    HUBS[idx].clone()
}
