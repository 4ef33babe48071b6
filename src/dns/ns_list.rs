//! Nameserver list builder
//!
//! Orders the zone's nameservers for one client location:
//!
//! ```text
//! [ country matches (weighted by nspriorityratio) | continent matches | everything else ]
//!   0 .. head                                       head .. headcont    headcont .. len
//! ```
//!
//! Positions inside each region are random so authority load spreads over the
//! fleet. When the head of the list is three boxes of the same `nsgroup`, the
//! third is dropped until the list fits `nsnum`.

use rand::Rng;

use crate::box_state::BoxStateModel;
use crate::geo::GeoInfo;

fn listed(list: &Option<Vec<String>>, code: Option<&str>) -> bool {
    match (list, code) {
        (Some(list), Some(code)) => list.iter().any(|c| c == code),
        _ => false,
    }
}

fn random_index<R: Rng + ?Sized>(rng: &mut R, span: f64) -> usize {
    (rng.gen::<f64>() * span).floor() as usize
}

/// Build the ordered NS hostname list for `geo`.
pub fn build<R: Rng + ?Sized>(
    model: &BoxStateModel,
    geo: Option<&GeoInfo>,
    rng: &mut R,
) -> Vec<String> {
    let config = model.config();
    let local = &model.local().config;
    let country = geo.and_then(|g| g.country.as_deref());
    let continent = geo.and_then(|g| g.continent.as_deref());

    let mut hosts: Vec<String> = Vec::new();
    let mut groups: Vec<Option<String>> = Vec::new();
    let (mut head, mut headcont) = (0usize, 0usize);

    for cdnbox in config
        .cdnboxes
        .iter()
        .filter(|b| b.isns && b.name != local.name)
    {
        let pos = if listed(&cdnbox.countries, country) {
            head += 1;
            headcont += 1;
            random_index(rng, head as f64 * cdnbox.nspriorityratio).min(head - 1)
        } else if listed(&cdnbox.continents, continent) {
            headcont += 1;
            head + random_index(rng, (headcont - head) as f64).min(headcont - head - 1)
        } else {
            headcont + random_index(rng, (hosts.len() - headcont + 1) as f64)
        };
        let pos = pos.min(hosts.len());
        hosts.insert(pos, cdnbox.hostname.clone());
        groups.insert(pos, cdnbox.nsgroup.clone());
    }

    let pos = if listed(&local.countries, country) {
        0
    } else if listed(&local.continents, continent) {
        head
    } else {
        headcont + random_index(rng, (hosts.len() - headcont + 1) as f64)
    };
    let pos = pos.min(hosts.len());
    hosts.insert(pos, local.hostname.clone());
    groups.insert(pos, local.nsgroup.clone());

    while hosts.len() > config.dnsserver.nsnum
        && groups.len() >= 3
        && groups[0].is_some()
        && groups[0] == groups[1]
        && groups[0] == groups[2]
    {
        hosts.remove(2);
        groups.remove(2);
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::box_state::tests::{test_config, test_model};
    use crate::config::BoxConfig;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    #[test]
    fn test_local_country_goes_first() {
        let model = test_model();
        let geo = GeoInfo::new("FR", "EU");
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let list = build(&model, Some(&geo), &mut rng);
            assert_eq!(list.len(), 3);
            assert_eq!(list[0], "paris.example.com");
        }
    }

    #[test]
    fn test_country_match_leads() {
        let model = test_model();
        let geo = GeoInfo::new("US", "NA");
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let list = build(&model, Some(&geo), &mut rng);
            assert_eq!(list[0], "nyc.example.com");
            assert!(list.contains(&"paris.example.com".to_string()));
        }
    }

    #[test]
    fn test_continent_region_follows_country_region() {
        let mut config = test_config();
        let mut lyon = BoxConfig::new("lyon", "lyon.example.com");
        lyon.isns = true;
        lyon.countries = Some(vec!["FR".into()]);
        let mut berlin = BoxConfig::new("berlin", "berlin.example.com");
        berlin.isns = true;
        berlin.continents = Some(vec!["EU".into()]);
        config.cdnboxes.push(lyon);
        config.cdnboxes.push(berlin);
        config.dnsserver.nsnum = 5;
        // local box is nyc, outside the client's country and continent
        let model = BoxStateModel::new(Arc::new(config), "nyc", 0).unwrap();

        let geo = GeoInfo::new("FR", "EU");
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let list = build(&model, Some(&geo), &mut rng);
            assert_eq!(list.len(), 5);
            // paris and lyon share the country head, berlin leads the rest
            let head: Vec<&str> = list[..2].iter().map(|s| s.as_str()).collect();
            assert!(head.contains(&"paris.example.com"));
            assert!(head.contains(&"lyon.example.com"));
            assert_eq!(list[2], "berlin.example.com");
        }
    }

    #[test]
    fn test_same_seed_same_list() {
        let model = test_model();
        let a = build(&model, None, &mut StdRng::seed_from_u64(7));
        let b = build(&model, None, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_group_is_trimmed() {
        let mut config = test_config();
        for b in &mut config.cdnboxes {
            b.nsgroup = Some("eu".into());
        }
        config.dnsserver.nsnum = 2;
        let model = BoxStateModel::new(Arc::new(config), "paris", 0).unwrap();
        let list = build(&model, None, &mut StdRng::seed_from_u64(1));
        assert_eq!(list.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_head_is_diverse(
            groups in proptest::collection::vec(0u8..3, 2..8),
            nsnum in 1usize..4,
            seed in any::<u64>(),
        ) {
            let mut config = test_config();
            config.cdnboxes.clear();
            for (i, group) in groups.iter().enumerate() {
                let mut b = BoxConfig::new(format!("box{}", i), format!("ns{}.example.com", i));
                b.isns = true;
                b.nsgroup = Some(format!("g{}", group));
                config.cdnboxes.push(b);
            }
            config.applis.clear();
            config.dnsserver.nsnum = nsnum;
            let model = BoxStateModel::new(Arc::new(config), "box0", 0).unwrap();

            let list = build(&model, None, &mut StdRng::seed_from_u64(seed));
            prop_assert!(!list.is_empty());
            if list.len() > nsnum {
                let group_of = |host: &str| {
                    model.iter().find(|b| b.config.hostname == host).and_then(|b| b.config.nsgroup.clone())
                };
                let g: Vec<_> = list.iter().take(3).map(|h| group_of(h)).collect();
                prop_assert!(!(g.len() == 3 && g[0] == g[1] && g[0] == g[2]));
            }
        }
    }
}
