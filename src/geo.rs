//! Client geolocation
//!
//! The director only needs (country, continent, registered country) for a
//! client or ECS address. Any lookup failure is "unknown geo", which passes
//! the selector's geo filters and sends the NS list down the random tier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;

/// Resolved location of a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    /// ISO 3166 country code
    pub country: Option<String>,
    /// Two-letter continent code (EU, NA, AS, ...)
    pub continent: Option<String>,
    pub registered_country: Option<String>,
}

impl GeoInfo {
    pub fn new(country: &str, continent: &str) -> Self {
        Self {
            country: Some(country.to_string()),
            continent: Some(continent.to_string()),
            registered_country: Some(country.to_string()),
        }
    }
}

/// Geo lookup errors
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("GeoIP database not found: {0}")]
    DatabaseNotFound(String),

    #[error("GeoIP database error: {0}")]
    DatabaseError(String),
}

/// Address → location source
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Every address is unknown
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeo;

impl GeoLookup for NoGeo {
    fn lookup(&self, _ip: IpAddr) -> Option<GeoInfo> {
        None
    }
}

/// Exact-address table
#[derive(Debug, Default, Clone)]
pub struct StaticGeo {
    entries: HashMap<IpAddr, GeoInfo>,
}

impl StaticGeo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, info: GeoInfo) -> Self {
        self.entries.insert(ip, info);
        self
    }
}

impl GeoLookup for StaticGeo {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        self.entries.get(&ip).cloned()
    }
}

/// MaxMind country database
pub struct GeoIpDatabase {
    #[cfg(feature = "geoip")]
    reader: maxminddb::Reader<Vec<u8>>,
    #[cfg(not(feature = "geoip"))]
    _path: String,
}

impl GeoIpDatabase {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, GeoError> {
        let db_path = db_path.as_ref();
        if !db_path.exists() {
            return Err(GeoError::DatabaseNotFound(db_path.display().to_string()));
        }

        #[cfg(feature = "geoip")]
        {
            let reader = maxminddb::Reader::open_readfile(db_path)
                .map_err(|e| GeoError::DatabaseError(e.to_string()))?;
            Ok(Self { reader })
        }

        #[cfg(not(feature = "geoip"))]
        {
            tracing::warn!("GeoIP feature not enabled, every client resolves to unknown geo");
            Ok(Self {
                _path: db_path.display().to_string(),
            })
        }
    }
}

impl GeoLookup for GeoIpDatabase {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        #[cfg(feature = "geoip")]
        {
            use maxminddb::geoip2;

            let record: geoip2::Country = match self.reader.lookup(ip) {
                Ok(Some(record)) => record,
                Ok(None) => return None,
                Err(e) => {
                    debug!("GeoIP lookup failed for {}: {}", ip, e);
                    return None;
                }
            };
            Some(GeoInfo {
                country: record
                    .country
                    .and_then(|c| c.iso_code.map(|s| s.to_string())),
                continent: record
                    .continent
                    .and_then(|c| c.code.map(|s| s.to_string())),
                registered_country: record
                    .registered_country
                    .and_then(|c| c.iso_code.map(|s| s.to_string())),
            })
        }

        #[cfg(not(feature = "geoip"))]
        {
            debug!("GeoIP disabled, no location for {}", ip);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_geo() {
        let ip: IpAddr = "198.51.100.0".parse().unwrap();
        let geo = StaticGeo::new().with(ip, GeoInfo::new("FR", "EU"));
        let info = geo.lookup(ip).unwrap();
        assert_eq!(info.country.as_deref(), Some("FR"));
        assert_eq!(info.continent.as_deref(), Some("EU"));
        assert!(geo.lookup("203.0.113.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_no_geo() {
        assert!(NoGeo.lookup("192.0.2.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_missing_database() {
        assert!(matches!(
            GeoIpDatabase::open("/nonexistent/GeoLite2-Country.mmdb"),
            Err(GeoError::DatabaseNotFound(_))
        ));
    }
}
