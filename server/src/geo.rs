//! Country and autonomous-system lookups
//!
//! Lookups never fail from the caller's point of view: an address that cannot
//! be resolved, or a missing database, answers `None`.

use crate::error::GeoError;
use ipnet::IpNet;
use log::{debug, info, warn};
use maxminddb::{geoip2, MaxMindDBError, Reader};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub trait GeoLookup: Send + Sync {
    /// ISO country code of the address, if known.
    fn country(&self, address: IpAddr) -> Option<String>;

    /// Autonomous system of the address formatted as `AS<number>`, if known.
    fn asn(&self, address: IpAddr) -> Option<String>;
}

/// Lookup used when no geo data is configured.
#[derive(Debug, Default)]
pub struct NoGeoData {
    warned: AtomicBool,
}

impl NoGeoData {
    pub fn new() -> Self {
        Self::default()
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("Geo data is not configured, country and ASN checks will never match");
        }
    }
}

impl GeoLookup for NoGeoData {
    fn country(&self, _address: IpAddr) -> Option<String> {
        self.warn_once();
        None
    }

    fn asn(&self, _address: IpAddr) -> Option<String> {
        self.warn_once();
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoEntry {
    pub network: IpNet,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub asn: Option<u32>,
}

/// Static table of networks, answered by longest-prefix match.
///
/// Networks are indexed by prefix length, so a lookup costs one hash lookup
/// per distinct prefix length in the table rather than a scan of every entry.
#[derive(Debug, Default)]
pub struct StaticGeoTable {
    networks: HashMap<IpNet, GeoEntry>,
    v4_prefixes: Vec<u8>,
    v6_prefixes: Vec<u8>,
}

impl StaticGeoTable {
    pub fn new(entries: Vec<GeoEntry>) -> Self {
        let mut table = Self::default();
        for mut entry in entries {
            entry.network = entry.network.trunc();
            let prefixes = match entry.network {
                IpNet::V4(_) => &mut table.v4_prefixes,
                IpNet::V6(_) => &mut table.v6_prefixes,
            };
            prefixes.push(entry.network.prefix_len());
            table.networks.insert(entry.network, entry);
        }
        // Most specific first so the first hit is the longest prefix.
        for prefixes in [&mut table.v4_prefixes, &mut table.v6_prefixes] {
            prefixes.sort_unstable_by(|a, b| b.cmp(a));
            prefixes.dedup();
        }
        table
    }

    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let raw = std::fs::read_to_string(path).map_err(|source| GeoError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<GeoEntry> =
            serde_json::from_str(&raw).map_err(|source| GeoError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Loaded {} geo networks from {}", entries.len(), path.display());
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    fn find<T>(&self, address: IpAddr, field: impl Fn(&GeoEntry) -> Option<T>) -> Option<T> {
        let prefixes = match address {
            IpAddr::V4(_) => &self.v4_prefixes,
            IpAddr::V6(_) => &self.v6_prefixes,
        };
        prefixes.iter().find_map(|&len| {
            let network = IpNet::new(address, len).ok()?.trunc();
            self.networks.get(&network).and_then(&field)
        })
    }
}

impl GeoLookup for StaticGeoTable {
    fn country(&self, address: IpAddr) -> Option<String> {
        self.find(address, |entry| entry.country.clone())
    }

    fn asn(&self, address: IpAddr) -> Option<String> {
        self.find(address, |entry| entry.asn.map(|number| format!("AS{}", number)))
    }
}

/// Lookups against MaxMind GeoLite2/GeoIP2 country and ASN databases.
///
/// Either database may be absent; its lookups then answer `None`. Addresses
/// missing from a database and corrupt records answer `None` as well.
pub struct MaxMindGeo {
    country: Option<Reader<Vec<u8>>>,
    asn: Option<Reader<Vec<u8>>>,
}

impl MaxMindGeo {
    pub fn open(country: Option<&Path>, asn: Option<&Path>) -> Result<Self, GeoError> {
        Ok(Self {
            country: country.map(Self::open_reader).transpose()?,
            asn: asn.map(Self::open_reader).transpose()?,
        })
    }

    fn open_reader(path: &Path) -> Result<Reader<Vec<u8>>, GeoError> {
        let reader = Reader::open_readfile(path).map_err(|source| GeoError::MaxMind {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            "Loaded {} database from {}",
            reader.metadata.database_type,
            path.display()
        );
        Ok(reader)
    }
}

impl GeoLookup for MaxMindGeo {
    fn country(&self, address: IpAddr) -> Option<String> {
        let reader = self.country.as_ref()?;
        match reader.lookup::<geoip2::Country>(address) {
            Ok(record) => record
                .country
                .and_then(|country| country.iso_code)
                .map(str::to_string),
            Err(MaxMindDBError::AddressNotFoundError(_)) => None,
            Err(e) => {
                debug!("Country lookup for {} failed: {}", address, e);
                None
            }
        }
    }

    fn asn(&self, address: IpAddr) -> Option<String> {
        let reader = self.asn.as_ref()?;
        match reader.lookup::<geoip2::Asn>(address) {
            Ok(record) => record
                .autonomous_system_number
                .map(|number| format!("AS{}", number)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => None,
            Err(e) => {
                debug!("ASN lookup for {} failed: {}", address, e);
                None
            }
        }
    }
}
