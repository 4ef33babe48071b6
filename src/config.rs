//! Director Configuration
//!
//! The configuration snapshot consumed by the state model, the selector and the
//! DNS listeners: the managed domain, the box fleet, the application aliases
//! and the cluster secret used to sign gossip.
//!
//! Files may be TOML, YAML or JSON (selected by extension). Derived defaults
//! (bandwidth floor/ceiling, NS penalty) are filled in by [`DirectorConfig::apply_defaults`].

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use crate::box_state::HealthStatus;
use crate::dns::DnsError;

/// Main director configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorConfig {
    /// DNS listener and zone settings
    pub dnsserver: DnsServerConfig,

    /// Shared HMAC key for the gossip channel
    pub clustersecret: String,

    /// Penalty bucket tuning
    #[serde(default)]
    pub states: StatesConfig,

    /// The box fleet, in configuration order
    pub cdnboxes: Vec<BoxConfig>,

    /// Application alias → ordered candidate list
    #[serde(default)]
    pub applis: BTreeMap<String, Vec<AppCandidate>>,

    /// Force the local box instead of detecting it from interface addresses
    #[serde(default)]
    pub local_box: Option<String>,
}

/// DNS zone and listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsServerConfig {
    /// Managed zone apex, e.g. `cdn.example.com`
    pub domain: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// Maximum NS records per answer
    #[serde(default = "default_nsnum")]
    pub nsnum: usize,

    #[serde(default = "default_nsttl")]
    pub nsttl: u32,

    #[serde(default = "default_attl")]
    pub attl: u32,

    #[serde(default = "default_dnscountdownratio")]
    pub dnscountdownratio: f64,

    #[serde(default = "default_dnscountavgmin")]
    pub dnscountavgmin: f64,

    #[serde(default = "default_globalthrottlebwratio")]
    pub globalthrottlebwratio: f64,

    #[serde(default = "default_globalthrottlelimit")]
    pub globalthrottlelimit: f64,

    /// Concurrent TCP connections accepted by the listener
    #[serde(default = "default_tcp_max_connections")]
    pub tcp_max_connections: usize,

    #[serde(default)]
    pub soa: SoaConfig,
}

fn default_port() -> u16 {
    53
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_nsnum() -> usize {
    2
}

fn default_nsttl() -> u32 {
    3600
}

fn default_attl() -> u32 {
    20
}

fn default_dnscountdownratio() -> f64 {
    1.2
}

fn default_dnscountavgmin() -> f64 {
    1.5
}

fn default_globalthrottlebwratio() -> f64 {
    0.4
}

fn default_globalthrottlelimit() -> f64 {
    2.0
}

fn default_tcp_max_connections() -> usize {
    256
}

/// Fixed SOA tuple served for the zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Admin mailbox in DNS form; `hostmaster.<domain>` when unset
    #[serde(default)]
    pub rname: Option<String>,
    #[serde(default = "default_serial")]
    pub serial: u32,
    #[serde(default = "default_refresh")]
    pub refresh: u32,
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_expire")]
    pub expire: u32,
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            rname: None,
            serial: default_serial(),
            refresh: default_refresh(),
            retry: default_retry(),
            expire: default_expire(),
            minimum: default_minimum(),
        }
    }
}

fn default_serial() -> u32 {
    2017113022
}

fn default_refresh() -> u32 {
    43200
}

fn default_retry() -> u32 {
    3600
}

fn default_expire() -> u32 {
    1209600
}

fn default_minimum() -> u32 {
    600
}

/// Penalty bucket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatesConfig {
    /// Seconds for one penalty unit to leak out of the bucket
    #[serde(default = "default_penalgdown")]
    pub penalgdown: f64,
}

impl Default for StatesConfig {
    fn default() -> Self {
        Self {
            penalgdown: default_penalgdown(),
        }
    }
}

fn default_penalgdown() -> f64 {
    120.0
}

/// A configured CDN box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxConfig {
    pub name: String,

    /// URL scheme with trailing colon (`https:` / `http:`)
    #[serde(default = "default_proto")]
    pub proto: String,

    pub hostname: String,

    /// Serves DNS for the zone
    #[serde(default)]
    pub isns: bool,

    /// Serves HTTP traffic (eligible for selection)
    #[serde(default = "default_true")]
    pub ishttp: bool,

    /// Answer with a CNAME to `hostname` instead of addresses
    #[serde(default)]
    pub cname: bool,

    /// Static addresses; skip hostname resolution when set
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,

    /// Bandwidth target in Mbps; boxes without one are not bandwidth-managed
    #[serde(default)]
    pub targetbw: Option<f64>,
    #[serde(default)]
    pub floorbw: Option<f64>,
    #[serde(default)]
    pub ceilbw: Option<f64>,

    #[serde(default)]
    pub addscore: f64,
    #[serde(default)]
    pub fixscore: Option<f64>,

    #[serde(default = "default_dnsthrottlebwratio")]
    pub dnsthrottlebwratio: f64,
    #[serde(default = "default_dnsthrottlehighratio")]
    pub dnsthrottlehighratio: f64,
    #[serde(default = "default_dnsthrottlelowratio")]
    pub dnsthrottlelowratio: f64,

    /// Country allow-list (ISO codes); `"ALL"` disables the check
    #[serde(default, deserialize_with = "string_or_list")]
    pub countries: Option<Vec<String>>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub continents: Option<Vec<String>>,

    /// Failure domain of the nameserver
    #[serde(default)]
    pub nsgroup: Option<String>,
    #[serde(default = "default_nspriorityratio")]
    pub nspriorityratio: f64,

    /// Base penalty reported in the bandwidth log
    #[serde(default)]
    pub penal: Option<f64>,

    /// Probe URL; `<proto>//<hostname>/cdn/image.gif` when unset
    #[serde(default, alias = "perfURL")]
    pub perf_url: Option<String>,

    #[serde(default)]
    pub localtests: Vec<LocalTestConfig>,

    /// Never subscribe to pushes from this box
    #[serde(default)]
    pub dontpushsubscribe: bool,

    /// Initial status (e.g. `off` to drain the box)
    #[serde(default)]
    pub status: Option<HealthStatus>,
}

fn default_proto() -> String {
    "https:".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dnsthrottlebwratio() -> f64 {
    0.4
}

fn default_dnsthrottlehighratio() -> f64 {
    1.2
}

fn default_dnsthrottlelowratio() -> f64 {
    2.0
}

fn default_nspriorityratio() -> f64 {
    1.0
}

impl BoxConfig {
    /// Minimal box with every optional field at its default
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proto: default_proto(),
            hostname: hostname.into(),
            isns: false,
            ishttp: true,
            cname: false,
            ipv4: None,
            ipv6: None,
            targetbw: None,
            floorbw: None,
            ceilbw: None,
            addscore: 0.0,
            fixscore: None,
            dnsthrottlebwratio: default_dnsthrottlebwratio(),
            dnsthrottlehighratio: default_dnsthrottlehighratio(),
            dnsthrottlelowratio: default_dnsthrottlelowratio(),
            countries: None,
            continents: None,
            nsgroup: None,
            nspriorityratio: default_nspriorityratio(),
            penal: None,
            perf_url: None,
            localtests: Vec::new(),
            dontpushsubscribe: false,
            status: None,
        }
    }

    /// URL probed by the health worker
    pub fn perf_url(&self) -> String {
        match &self.perf_url {
            Some(url) => url.clone(),
            None => format!("{}//{}/cdn/image.gif", self.proto, self.hostname),
        }
    }

    /// Box has a bandwidth target and is subject to shedding/throttling
    pub fn is_bandwidth_managed(&self) -> bool {
        self.targetbw.is_some()
    }
}

/// Health check run by the local box; the result travels in the state vector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalTestConfig {
    pub name: String,
    pub url: String,
}

/// One candidate of an application alias
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCandidate {
    pub cdnbox: String,
    #[serde(default)]
    pub fixscore: Option<f64>,
    #[serde(default)]
    pub addscore: Option<f64>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub countries: Option<Vec<String>>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub continents: Option<Vec<String>>,
    /// Local test names that must all be passing on the candidate
    #[serde(default)]
    pub localtests: Option<Vec<String>>,
}

impl AppCandidate {
    pub fn new(cdnbox: impl Into<String>) -> Self {
        Self {
            cdnbox: cdnbox.into(),
            fixscore: None,
            addscore: None,
            countries: None,
            continents: None,
            localtests: None,
        }
    }
}

/// Geo lists are written either as a single string (`"ALL"`) or as a list.
fn string_or_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(
        Option::<StringOrList>::deserialize(deserializer)?.map(|value| match value {
            StringOrList::One(s) => vec![s],
            StringOrList::Many(list) => list,
        }),
    )
}

impl DirectorConfig {
    /// Load, default and validate a configuration file.
    ///
    /// The format follows the extension: `.toml`, `.yaml`/`.yml`, anything
    /// else is parsed as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DnsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DnsError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            Some("yaml") | Some("yml") => Self::from_yaml(&content)?,
            _ => Self::from_json(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML and apply defaults
    pub fn from_toml(content: &str) -> Result<Self, DnsError> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| DnsError::ConfigError(format!("TOML parse error: {}", e)))?;
        config.apply_defaults();
        Ok(config)
    }

    /// Parse YAML and apply defaults
    pub fn from_yaml(content: &str) -> Result<Self, DnsError> {
        let mut config: Self = serde_yaml::from_str(content)
            .map_err(|e| DnsError::ConfigError(format!("YAML parse error: {}", e)))?;
        config.apply_defaults();
        Ok(config)
    }

    /// Parse JSON and apply defaults
    pub fn from_json(content: &str) -> Result<Self, DnsError> {
        let mut config: Self = serde_json::from_str(content)
            .map_err(|e| DnsError::ConfigError(format!("JSON parse error: {}", e)))?;
        config.apply_defaults();
        Ok(config)
    }

    /// Fill in defaults that depend on other fields.
    pub fn apply_defaults(&mut self) {
        self.dnsserver.domain = self
            .dnsserver
            .domain
            .trim_end_matches('.')
            .to_ascii_lowercase();
        for cdnbox in &mut self.cdnboxes {
            if cdnbox.isns && cdnbox.penal.is_none() {
                cdnbox.penal = Some(100.0);
            }
            if let Some(target) = cdnbox.targetbw {
                if cdnbox.floorbw.is_none() {
                    cdnbox.floorbw = Some((0.9 * target).floor());
                }
                if cdnbox.ceilbw.is_none() {
                    cdnbox.ceilbw = Some((1.1 * target).ceil());
                }
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), DnsError> {
        if self.dnsserver.domain.is_empty() {
            return Err(DnsError::ConfigError(
                "dnsserver.domain must not be empty".to_string(),
            ));
        }

        if self.dnsserver.nsnum == 0 {
            return Err(DnsError::ConfigError(
                "dnsserver.nsnum must be > 0".to_string(),
            ));
        }

        if self.dnsserver.tcp_max_connections == 0 {
            return Err(DnsError::ConfigError(
                "dnsserver.tcp_max_connections must be > 0".to_string(),
            ));
        }

        if self.clustersecret.is_empty() {
            return Err(DnsError::ConfigError(
                "clustersecret must not be empty".to_string(),
            ));
        }

        if self.states.penalgdown <= 0.0 {
            return Err(DnsError::ConfigError(
                "states.penalgdown must be > 0".to_string(),
            ));
        }

        if self.cdnboxes.is_empty() {
            return Err(DnsError::ConfigError(
                "at least one cdnbox is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for cdnbox in &self.cdnboxes {
            if !names.insert(cdnbox.name.as_str()) {
                return Err(DnsError::ConfigError(format!(
                    "duplicate cdnbox name: {}",
                    cdnbox.name
                )));
            }
            if cdnbox.hostname.is_empty() {
                return Err(DnsError::ConfigError(format!(
                    "cdnbox {} has no hostname",
                    cdnbox.name
                )));
            }
            if let (Some(floor), Some(ceil)) = (cdnbox.floorbw, cdnbox.ceilbw) {
                if ceil <= floor {
                    return Err(DnsError::ConfigError(format!(
                        "cdnbox {}: ceilbw ({}) must be > floorbw ({})",
                        cdnbox.name, ceil, floor
                    )));
                }
            }
        }

        for (app, candidates) in &self.applis {
            if candidates.is_empty() {
                return Err(DnsError::ConfigError(format!(
                    "application {} has no candidates",
                    app
                )));
            }
            for candidate in candidates {
                if !names.contains(candidate.cdnbox.as_str()) {
                    return Err(DnsError::ConfigError(format!(
                        "application {} references unknown cdnbox {}",
                        app, candidate.cdnbox
                    )));
                }
            }
        }

        if let Some(local) = &self.local_box {
            if !names.contains(local.as_str()) {
                return Err(DnsError::ConfigError(format!(
                    "local_box {} is not a configured cdnbox",
                    local
                )));
            }
        }

        Ok(())
    }

    pub fn box_config(&self, name: &str) -> Option<&BoxConfig> {
        self.cdnboxes.iter().find(|b| b.name == name)
    }

    pub fn app(&self, app_key: &str) -> Option<&[AppCandidate]> {
        self.applis.get(app_key).map(|c| c.as_slice())
    }

    /// SOA admin mailbox
    pub fn soa_rname(&self) -> String {
        match &self.dnsserver.soa.rname {
            Some(rname) => rname.trim_end_matches('.').to_string(),
            None => format!("hostmaster.{}", self.dnsserver.domain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = r#"
clustersecret = "s3cret"

[dnsserver]
domain = "CDN.Example.com."
nsnum = 3

[[cdnboxes]]
name = "paris"
hostname = "paris.example.com"
isns = true
targetbw = 100.0
countries = ["FR", "BE"]
continents = "EU"

[[cdnboxes]]
name = "nyc"
hostname = "nyc.example.com"
targetbw = 200.0
floorbw = 150.0

[[applis.www]]
cdnbox = "paris"

[[applis.www]]
cdnbox = "nyc"
countries = "ALL"
"#;

    #[test]
    fn test_toml_defaults() {
        let config = DirectorConfig::from_toml(SAMPLE_TOML).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.dnsserver.domain, "cdn.example.com");
        assert_eq!(config.dnsserver.port, 53);
        assert_eq!(config.dnsserver.dnscountdownratio, 1.2);
        assert_eq!(config.dnsserver.dnscountavgmin, 1.5);
        assert_eq!(config.dnsserver.globalthrottlebwratio, 0.4);
        assert_eq!(config.dnsserver.globalthrottlelimit, 2.0);
        assert_eq!(config.states.penalgdown, 120.0);
        assert_eq!(config.dnsserver.soa.refresh, 43200);
        assert_eq!(config.dnsserver.soa.minimum, 600);

        let paris = config.box_config("paris").unwrap();
        assert_eq!(paris.proto, "https:");
        assert!(paris.ishttp);
        assert_eq!(paris.penal, Some(100.0));
        assert_eq!(paris.floorbw, Some(90.0));
        assert_eq!(paris.ceilbw, Some(111.0));
        assert_eq!(paris.continents.as_deref(), Some(&["EU".to_string()][..]));
        assert_eq!(paris.perf_url(), "https://paris.example.com/cdn/image.gif");

        let nyc = config.box_config("nyc").unwrap();
        assert_eq!(nyc.penal, None);
        assert_eq!(nyc.floorbw, Some(150.0));
        assert_eq!(nyc.ceilbw, Some(220.0));

        let www = config.app("www").unwrap();
        assert_eq!(www.len(), 2);
        assert_eq!(www[1].countries.as_deref(), Some(&["ALL".to_string()][..]));
        assert_eq!(config.soa_rname(), "hostmaster.cdn.example.com");
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{
            "dnsserver": { "domain": "cdn.example.com", "port": 5353, "nsnum": 2, "nsttl": 600, "attl": 10 },
            "clustersecret": "k",
            "cdnboxes": [
                { "name": "a", "hostname": "a.example.com", "perfURL": "http://a.example.com/ping", "status": "off" }
            ],
            "applis": { "img": [ { "cdnbox": "a", "fixscore": 10 } ] }
        }"#;
        let config = DirectorConfig::from_json(json).unwrap();
        assert!(config.validate().is_ok());
        let a = config.box_config("a").unwrap();
        assert_eq!(a.perf_url(), "http://a.example.com/ping");
        assert_eq!(a.status, Some(HealthStatus::Off));
        assert_eq!(config.app("img").unwrap()[0].fixscore, Some(10.0));
    }

    #[test]
    fn test_yaml_parse() {
        let yaml = r#"
dnsserver:
  domain: cdn.example.com
clustersecret: k
cdnboxes:
  - name: a
    hostname: a.example.com
"#;
        let config = DirectorConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.dnsserver.nsnum, 2);
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let base = DirectorConfig::from_toml(SAMPLE_TOML).unwrap();

        let mut config = base.clone();
        config.dnsserver.nsnum = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.clustersecret.clear();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.cdnboxes.push(BoxConfig::new("paris", "dup.example.com"));
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.applis.insert("bad".into(), vec![AppCandidate::new("nowhere")]);
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.applis.insert("empty".into(), vec![]);
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.cdnboxes[0].ceilbw = config.cdnboxes[0].floorbw;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.local_box = Some("ghost".into());
        assert!(config.validate().is_err());

        let mut config = base;
        config.states.penalgdown = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            DirectorConfig::from_toml("not = [valid"),
            Err(DnsError::ConfigError(_))
        ));
    }
}
