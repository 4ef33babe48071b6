// Configuration loading from disk
//
// The same fleet written as TOML, YAML and JSON must load to the same
// snapshot; broken files are rejected before a director starts.

use std::fs;
use std::path::PathBuf;

use cdnbox_director::config::DirectorConfig;
use cdnbox_director::dns::DnsError;
use tempfile::TempDir;

const TOML: &str = include_str!("common.toml");

const YAML: &str = r#"
clustersecret: cluster-secret
dnsserver:
  domain: cdn.example.com
  nsnum: 2
cdnboxes:
  - name: paris
    hostname: paris.example.com
    isns: true
    targetbw: 100.0
    ipv4: 192.0.2.1
    countries: [FR]
    continents: EU
  - name: nyc
    hostname: nyc.example.com
    isns: true
    targetbw: 100.0
    ipv4: 192.0.2.2
    countries: US
applis:
  www:
    - cdnbox: paris
    - cdnbox: nyc
      addscore: 10.0
"#;

const JSON: &str = r#"{
  "clustersecret": "cluster-secret",
  "dnsserver": { "domain": "cdn.example.com", "port": 5353, "soa": { "rname": "ops.example.com." } },
  "cdnboxes": [
    { "name": "paris", "hostname": "paris.example.com", "isns": true, "targetbw": 100.0,
      "perfURL": "http://paris.example.com/probe.gif" },
    { "name": "nyc", "hostname": "nyc.example.com", "status": "off" }
  ],
  "applis": { "www": [ { "cdnbox": "paris" }, { "cdnbox": "nyc", "fixscore": 1.0 } ] }
}"#;

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = DirectorConfig::from_file(write(&dir, "director.toml", TOML)).unwrap();

    assert_eq!(config.dnsserver.domain, "cdn.example.com");
    assert_eq!(config.cdnboxes.len(), 3);
    assert_eq!(config.app("solo").unwrap().len(), 1);
    let nyc = config.box_config("nyc").unwrap();
    assert_eq!(nyc.countries.as_deref(), Some(&["US".to_string()][..]));
    assert_eq!(nyc.perf_url(), "https://nyc.example.com/cdn/image.gif");
    // nameservers get the default NS penalty
    assert_eq!(nyc.penal, Some(100.0));
}

#[test]
fn test_load_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = DirectorConfig::from_file(write(&dir, "director.yml", YAML)).unwrap();

    assert_eq!(config.dnsserver.port, 53);
    let paris = config.box_config("paris").unwrap();
    assert_eq!(paris.continents.as_deref(), Some(&["EU".to_string()][..]));
    assert_eq!(paris.floorbw, Some(90.0));
    let www = config.app("www").unwrap();
    assert_eq!(www[1].addscore, Some(10.0));
}

#[test]
fn test_load_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = DirectorConfig::from_file(write(&dir, "config.json", JSON)).unwrap();

    assert_eq!(config.dnsserver.port, 5353);
    assert_eq!(config.soa_rname(), "ops.example.com");
    let paris = config.box_config("paris").unwrap();
    assert_eq!(paris.perf_url(), "http://paris.example.com/probe.gif");
    let nyc = config.box_config("nyc").unwrap();
    assert!(!nyc.is_bandwidth_managed());
    assert!(nyc.status.is_some());
}

#[test]
fn test_default_soa_rname() {
    let config = DirectorConfig::from_toml(TOML).unwrap();
    assert_eq!(config.soa_rname(), "hostmaster.cdn.example.com");
    assert_eq!(config.dnsserver.soa.serial, 2017113022);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = DirectorConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, DnsError::ConfigError(_)));
}

#[test]
fn test_extension_selects_parser() {
    let dir = tempfile::tempdir().unwrap();
    // TOML content behind a JSON name is a parse error
    let err = DirectorConfig::from_file(write(&dir, "director.conf", TOML)).unwrap_err();
    assert!(err.to_string().contains("JSON"));
}

#[test]
fn test_invalid_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let unknown_box = TOML.replace(r#"{ cdnbox = "tokyo" }]"#, r#"{ cdnbox = "sydney" }]"#);
    assert_ne!(unknown_box, TOML);
    let err = DirectorConfig::from_file(write(&dir, "a.toml", &unknown_box)).unwrap_err();
    assert!(err.to_string().contains("sydney"));

    let no_secret = TOML.replace(r#"clustersecret = "cluster-secret""#, r#"clustersecret = """#);
    let err = DirectorConfig::from_file(write(&dir, "b.toml", &no_secret)).unwrap_err();
    assert!(err.to_string().contains("clustersecret"));

    let inverted = YAML.replace("targetbw: 100.0\n    ipv4: 192.0.2.1", "targetbw: 100.0\n    floorbw: 120.0\n    ipv4: 192.0.2.1");
    assert_ne!(inverted, YAML);
    let err = DirectorConfig::from_file(write(&dir, "c.yaml", &inverted)).unwrap_err();
    assert!(err.to_string().contains("ceilbw"));
}
