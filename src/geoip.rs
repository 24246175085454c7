//! Optional GeoIP enrichment of client addresses.
//!
//! The choice is made once at startup: [`GeoEnrichment::load`] yields
//! `Present` when the City database opens and `Absent` otherwise. A
//! database that was configured explicitly and cannot be opened is an
//! error; a missing default database only disables enrichment.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use maxminddb::geoip2;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::record::{Record, RecordTransform};

/// Document field holding the client address.
const ADDRESS_FIELD: &str = "remote_addr";

/// Document field the lookup result is stored under.
const GEOIP_FIELD: &str = "geoip";

/// Location data for one address.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeoInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,

    /// Indexed as a `geo_point`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Resolves an address to its location, `None` when unknown.
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Error opening a GeoIP database.
#[derive(Debug)]
pub struct GeoError {
    pub path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for GeoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Can't load GeoIP database {}: {}", self.path.display(), self.message)
    }
}

impl std::error::Error for GeoError {}

/// Lookups against a MaxMind City database held in memory.
pub struct MaxMindLookup {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindLookup {
    pub fn open(path: &Path) -> Result<Self, GeoError> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| GeoError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self { reader })
    }
}

impl GeoLookup for MaxMindLookup {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        let city: geoip2::City = match self.reader.lookup(ip) {
            Ok(city) => city,
            Err(e) => {
                debug!(ip = %ip, error = %e, "GeoIP lookup failed");
                return None;
            }
        };

        let country = city.country;
        Some(GeoInfo {
            country_code: country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(str::to_string),
            country_name: country.and_then(|c| english_name(c.names)),
            city: city.city.and_then(|c| english_name(c.names)),
            location: city.location.and_then(|l| {
                Some(GeoPoint {
                    lat: l.latitude?,
                    lon: l.longitude?,
                })
            }),
        })
    }
}

fn english_name(names: Option<BTreeMap<&str, &str>>) -> Option<String> {
    names.and_then(|names| names.get("en").map(|name| name.to_string()))
}

/// Enrichment step of the record transform chain.
pub enum GeoEnrichment {
    Present(Box<dyn GeoLookup>),
    Absent,
}

impl GeoEnrichment {
    /// Open the City database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `GeoError` only when `explicit` is set; otherwise a database
    /// that cannot be opened leaves enrichment disabled.
    pub fn load(path: &Path, explicit: bool) -> Result<Self, GeoError> {
        match MaxMindLookup::open(path) {
            Ok(lookup) => {
                info!(path = %path.display(), "GeoIP database loaded");
                Ok(GeoEnrichment::Present(Box::new(lookup)))
            }
            Err(e) if explicit => Err(e),
            Err(e) => {
                info!(error = %e, "GeoIP enrichment disabled");
                Ok(GeoEnrichment::Absent)
            }
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, GeoEnrichment::Present(_))
    }
}

impl RecordTransform for GeoEnrichment {
    fn transform(&self, mut record: Record) -> Record {
        let GeoEnrichment::Present(lookup) = self else {
            return record;
        };

        let ip = record
            .extra
            .get(ADDRESS_FIELD)
            .and_then(Value::as_str)
            .and_then(|addr| addr.parse::<IpAddr>().ok());

        if let Some(info) = ip.and_then(|ip| lookup.lookup(ip)) {
            match serde_json::to_value(&info) {
                Ok(value) => {
                    record.extra.insert(GEOIP_FIELD.to_string(), value);
                }
                Err(e) => debug!(error = %e, "Can't serialize GeoIP data"),
            }
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{JsonRecordSource, RecordSource};
    use std::io::Write;

    /// Knows a single address.
    struct FixedLookup;

    impl GeoLookup for FixedLookup {
        fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
            if ip.to_string() != "81.2.69.142" {
                return None;
            }
            Some(GeoInfo {
                country_code: Some("GB".to_string()),
                country_name: Some("United Kingdom".to_string()),
                city: Some("London".to_string()),
                location: Some(GeoPoint { lat: 51.5142, lon: -0.0931 }),
            })
        }
    }

    fn parse(enrichment: GeoEnrichment, remote_addr: &str) -> Record {
        let line = format!(
            r#"{{"@timestamp":"2024-03-01T12:00:05+00:00","status":200,"remote_addr":"{}"}}"#,
            remote_addr
        );
        JsonRecordSource::new()
            .with_transform(enrichment)
            .parse(&line)
            .unwrap()
    }

    #[test]
    fn test_present_adds_location() {
        let record = parse(GeoEnrichment::Present(Box::new(FixedLookup)), "81.2.69.142");
        let geoip = &record.extra["geoip"];
        assert_eq!(geoip["country_code"], "GB");
        assert_eq!(geoip["city"], "London");
        assert_eq!(geoip["location"]["lat"], 51.5142);
        assert_eq!(geoip["location"]["lon"], -0.0931);
    }

    #[test]
    fn test_present_skips_unknown_and_invalid_addresses() {
        let record = parse(GeoEnrichment::Present(Box::new(FixedLookup)), "10.0.0.1");
        assert!(!record.extra.contains_key("geoip"));

        let record = parse(GeoEnrichment::Present(Box::new(FixedLookup)), "unix:");
        assert!(!record.extra.contains_key("geoip"));
    }

    #[test]
    fn test_absent_is_a_no_op() {
        let record = parse(GeoEnrichment::Absent, "81.2.69.142");
        assert!(!record.extra.contains_key("geoip"));
        assert_eq!(record.extra["remote_addr"], "81.2.69.142");
    }

    #[test]
    fn test_missing_default_database_disables_enrichment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GeoLite2-City.mmdb");

        let enrichment = GeoEnrichment::load(&path, false).unwrap();
        assert!(!enrichment.is_present());
    }

    #[test]
    fn test_explicit_database_must_load() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.mmdb");
        let err = GeoEnrichment::load(&missing, true).err().expect("missing file is fatal");
        assert_eq!(err.path, missing);

        let corrupt = dir.path().join("corrupt.mmdb");
        std::fs::File::create(&corrupt)
            .unwrap()
            .write_all(b"not a maxmind database")
            .unwrap();
        assert!(GeoEnrichment::load(&corrupt, true).is_err());
        assert!(!GeoEnrichment::load(&corrupt, false).unwrap().is_present());
    }
}
