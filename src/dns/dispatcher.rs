//! Query dispatcher
//!
//! Turns one decoded packet into an authoritative response. Control messages
//! are routed to the gossip handlers and never answered.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::ns_list;
use super::wire::{self, Packet, Query, Response};
use super::{RecordData, RecordType, ResourceRecord, ResponseCode, Soa};
use crate::box_state::{unix_millis, BoxStateModel};
use crate::geo::GeoLookup;
use crate::gossip::{self, ClusterKey};
use crate::lock_utils::lock_or_recover;
use crate::selector;

/// Shared per-query handler used by every listener
pub struct Dispatcher {
    model: Arc<Mutex<BoxStateModel>>,
    geo: Arc<dyn GeoLookup>,
    key: Mutex<Arc<ClusterKey>>,
    rng: Mutex<StdRng>,
}

impl Dispatcher {
    pub fn new(model: Arc<Mutex<BoxStateModel>>, geo: Arc<dyn GeoLookup>, key: ClusterKey) -> Self {
        Self {
            model,
            geo,
            key: Mutex::new(Arc::new(key)),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the random source (deterministic tests)
    pub fn with_rng(self, rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            ..self
        }
    }

    pub fn model(&self) -> &Arc<Mutex<BoxStateModel>> {
        &self.model
    }

    pub fn cluster_key(&self) -> Arc<ClusterKey> {
        Arc::clone(&lock_or_recover(&self.key, "cluster key"))
    }

    /// Swap the gossip key after a configuration reload
    pub fn set_cluster_key(&self, key: ClusterKey) {
        *lock_or_recover(&self.key, "cluster key") = Arc::new(key);
    }

    /// Handle one raw packet from `client`; `None` means no reply is sent.
    pub fn handle(&self, packet: &[u8], client: IpAddr, limit: usize) -> Option<Vec<u8>> {
        match wire::decode(packet) {
            Err(e) => {
                warn!(target: "dns", client = %client, error = %e, "dropping malformed packet");
                None
            }
            Ok(Packet::Control(message)) => {
                let key = self.cluster_key();
                let mut model = lock_or_recover(&self.model, "box state model");
                match gossip::handle_control(&mut model, &key, &message, unix_millis()) {
                    Ok(peer) => {
                        debug!(target: "gossip", peer = %peer, dataname = %message.dataname, client = %client, "control message accepted")
                    }
                    Err(e) => {
                        warn!(target: "gossip", client = %client, dataname = %message.dataname, error = %e, "control message rejected")
                    }
                }
                None
            }
            Ok(Packet::Query(query)) => {
                let response = self.answer(&query, client);
                match wire::encode_response(&query, &response, limit) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        warn!(target: "dns", client = %client, qname = %query.name, error = %e, "failed to encode response");
                        Some(wire::encode_error(&query, ResponseCode::FormErr))
                    }
                }
            }
        }
    }

    /// Build the response to a decoded query.
    pub fn answer(&self, query: &Query, client: IpAddr) -> Response {
        let qname = query.name.to_ascii_lowercase();
        let mut model = lock_or_recover(&self.model, "box state model");
        let config = Arc::clone(model.config());
        let dns = &config.dnsserver;
        let domain = dns.domain.as_str();

        let app_key = if qname == domain {
            Some("")
        } else {
            qname
                .strip_suffix(domain)
                .and_then(|prefix| prefix.strip_suffix('.'))
        };
        let Some(app_key) = app_key else {
            debug!(target: "dns", client = %client, qname = %qname, "query outside the zone refused");
            return Response::new(ResponseCode::Refused);
        };
        let apex = app_key.is_empty();
        model.totaldnscount.current += 1.0;

        let ednsadd = query.client_subnet().map(|s| s.subnet);
        let geo = self.geo.lookup(ednsadd.unwrap_or(client));

        let mut rng = lock_or_recover(&self.rng, "dispatcher rng");
        let chosen = if apex {
            None
        } else {
            selector::choose(&mut model, &qname, geo.as_ref(), app_key, &mut *rng)
        };
        let nslist = ns_list::build(&model, geo.as_ref(), &mut *rng);
        drop(rng);

        let ns_records = |owner: &str| -> Vec<ResourceRecord> {
            nslist
                .iter()
                .take(dns.nsnum)
                .map(|host| ResourceRecord::new(owner, dns.nsttl, RecordData::NS(host.clone())))
                .collect()
        };
        let soa = ResourceRecord::new(
            domain,
            dns.nsttl,
            RecordData::SOA(Soa {
                mname: nslist.first().cloned().unwrap_or_default(),
                rname: config.soa_rname(),
                serial: dns.soa.serial,
                refresh: dns.soa.refresh,
                retry: dns.soa.retry,
                expire: dns.soa.expire,
                minimum: dns.soa.minimum,
            }),
        );

        let qtype = query.qtype;
        let mut response = Response::new(ResponseCode::NoError);
        match qtype {
            RecordType::ANY if apex => {
                response.push_answer(soa.clone());
                ns_records(&query.name)
                    .into_iter()
                    .for_each(|rr| response.push_answer(rr));
            }
            RecordType::NS if apex => ns_records(&query.name)
                .into_iter()
                .for_each(|rr| response.push_answer(rr)),
            RecordType::A | RecordType::AAAA | RecordType::CNAME => ns_records(domain)
                .into_iter()
                .for_each(|rr| response.push_authority(rr)),
            RecordType::SOA | RecordType::ANY | RecordType::NS => response.push_answer(soa.clone()),
            _ => {}
        }

        match chosen.as_deref().and_then(|name| model.get(name)) {
            Some(state) => {
                let cname = state.config.cname;
                if qtype == RecordType::AAAA && state.ipv6.is_none() && !cname {
                    response.push_authority(soa.clone());
                }
                if let Some(ip) = state.ipv4 {
                    if matches!(qtype, RecordType::A | RecordType::ANY) {
                        response.push_answer(ResourceRecord::new(&query.name, dns.attl, RecordData::A(ip)));
                    }
                }
                if let Some(ip) = state.ipv6 {
                    if matches!(qtype, RecordType::AAAA | RecordType::ANY) {
                        response.push_answer(ResourceRecord::new(&query.name, dns.attl, RecordData::AAAA(ip)));
                    }
                }
                if cname {
                    response.push_answer(ResourceRecord::new(
                        &query.name,
                        dns.attl,
                        RecordData::CNAME(state.config.hostname.clone()),
                    ));
                }
            }
            None if !apex => {
                response = Response::new(ResponseCode::NXDomain);
                response.push_authority(soa);
            }
            None => {}
        }

        let adata = response
            .answers()
            .iter()
            .chain(response.authority())
            .map(|rr| rr.summary())
            .collect::<Vec<_>>()
            .join(" ");
        let counted = chosen
            .as_deref()
            .and_then(|name| model.get(name))
            .filter(|state| state.config.is_bandwidth_managed())
            .map(|state| state.dnscount);
        let field = |value: Option<&String>| value.cloned().unwrap_or_else(|| "none".to_string());
        info!(
            target: "dns",
            client = %client,
            ednsadd = %ednsadd.map(|a| a.to_string()).unwrap_or_else(|| "none".to_string()),
            country = %field(geo.as_ref().and_then(|g| g.country.as_ref())),
            rcountry = %field(geo.as_ref().and_then(|g| g.registered_country.as_ref())),
            continent = %field(geo.as_ref().and_then(|g| g.continent.as_ref())),
            cdnbox = chosen.as_deref().unwrap_or("none"),
            anum = response.anum(),
            qname = %qname,
            qtype = %qtype,
            adata = %adata,
            dcgcur = model.globaldnscount.current,
            dcgavg = model.globaldnscount.average,
            dcglim = model.globaldnscount.limit,
            dccur = counted.map(|c| c.current),
            dcavg = counted.map(|c| c.average),
            "query"
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::box_state::tests::test_model;
    use crate::dns::{ControlMessage, MAX_UDP_SIZE};
    use crate::geo::{GeoInfo, StaticGeo};
    use crate::gossip::{SubscribeMessage, SUBSCRIBE_DATANAME};
    use hickory_proto::op::{Message, ResponseCode as HickoryCode};
    use hickory_proto::rr::RData;
    use std::net::Ipv4Addr;

    fn client() -> IpAddr {
        "198.51.100.7".parse().unwrap()
    }

    fn dispatcher() -> Dispatcher {
        let model = Arc::new(Mutex::new(test_model()));
        let geo = StaticGeo::new().with(client(), GeoInfo::new("FR", "EU"));
        Dispatcher::new(model, Arc::new(geo), ClusterKey::new("cluster-secret"))
            .with_rng(StdRng::seed_from_u64(5))
    }

    fn query(name: &str, qtype: RecordType) -> Query {
        let bytes = wire::encode_query(7, name, qtype, None).unwrap();
        match wire::decode(&bytes).unwrap() {
            Packet::Query(q) => q,
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_zone_refused() {
        let d = dispatcher();
        let response = d.answer(&query("www.other.org", RecordType::A), client());
        assert_eq!(response.rcode, ResponseCode::Refused);
        assert_eq!(response.anum(), 0);
        assert_eq!(d.model().lock().unwrap().totaldnscount.current, 0.0);

        // suffix match must respect label boundaries
        let response = d.answer(&query("evilcdn.example.com", RecordType::A), client());
        assert_eq!(response.rcode, ResponseCode::Refused);
    }

    #[test]
    fn test_unknown_app_nxdomain() {
        let d = dispatcher();
        let response = d.answer(&query("img.cdn.example.com", RecordType::A), client());
        assert_eq!(response.rcode, ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
        assert!(matches!(response.authority()[0].data, RecordData::SOA(_)));
    }

    #[test]
    fn test_a_query_answers_chosen_box() {
        let d = dispatcher();
        let response = d.answer(&query("WWW.cdn.example.com", RecordType::A), client());
        assert_eq!(response.rcode, ResponseCode::NoError);
        assert_eq!(
            response.answers()[0].data,
            RecordData::A(Ipv4Addr::new(192, 0, 2, 1))
        );
        assert_eq!(response.answers()[0].ttl, 20);
        assert_eq!(response.authority().len(), 2);
        for rr in response.authority() {
            assert_eq!(rr.name, "cdn.example.com");
            assert!(matches!(rr.data, RecordData::NS(_)));
        }

        let model = d.model().lock().unwrap();
        assert_eq!(model.totaldnscount.current, 1.0);
        assert_eq!(model.app_stats["www"].boxes["paris"], 1);
    }

    #[test]
    fn test_aaaa_without_ipv6_adds_soa_authority() {
        let d = dispatcher();
        let response = d.answer(&query("www.cdn.example.com", RecordType::AAAA), client());
        assert!(response.answers().is_empty());
        let last = response.authority().last().unwrap();
        assert!(matches!(last.data, RecordData::SOA(_)));
    }

    #[test]
    fn test_apex_ns() {
        let d = dispatcher();
        let response = d.answer(&query("cdn.example.com", RecordType::NS), client());
        assert_eq!(response.answers().len(), 2);
        // french client: local paris box leads
        assert_eq!(
            response.answers()[0].data,
            RecordData::NS("paris.example.com".into())
        );
        assert!(response.authority().is_empty());
    }

    #[test]
    fn test_apex_any_soa_then_ns() {
        let d = dispatcher();
        let response = d.answer(&query("cdn.example.com", RecordType::ANY), client());
        let answers = response.answers();
        assert_eq!(answers.len(), 3);
        match &answers[0].data {
            RecordData::SOA(soa) => {
                assert_eq!(soa.mname, "paris.example.com");
                assert_eq!(soa.rname, "hostmaster.cdn.example.com");
                assert_eq!(soa.serial, 2017113022);
            }
            other => panic!("expected SOA, got {:?}", other),
        }
        assert!(answers[1..].iter().all(|rr| matches!(rr.data, RecordData::NS(_))));
    }

    #[test]
    fn test_soa_and_ns_below_apex() {
        let d = dispatcher();
        for qtype in [RecordType::SOA, RecordType::NS] {
            let response = d.answer(&query("www.cdn.example.com", qtype), client());
            assert_eq!(response.answers().len(), 1);
            assert_eq!(response.answers()[0].name, "cdn.example.com");
            assert!(matches!(response.answers()[0].data, RecordData::SOA(_)));
        }
    }

    #[test]
    fn test_cname_box() {
        let d = dispatcher();
        {
            let mut model = d.model().lock().unwrap();
            let paris = model.get_mut("paris").unwrap();
            paris.config.cname = true;
        }
        let response = d.answer(&query("www.cdn.example.com", RecordType::AAAA), client());
        assert_eq!(
            response.answers().last().unwrap().data,
            RecordData::CNAME("paris.example.com".into())
        );
        // a CNAME box never gets the negative SOA
        assert!(response
            .authority()
            .iter()
            .all(|rr| matches!(rr.data, RecordData::NS(_))));
    }

    #[test]
    fn test_handle_wire_round_trip() {
        let d = dispatcher();
        let bytes = wire::encode_query(99, "www.cdn.example.com", RecordType::A, None).unwrap();
        let reply = d.handle(&bytes, client(), MAX_UDP_SIZE).unwrap();
        let message = Message::from_vec(&reply).unwrap();
        assert_eq!(message.id(), 99);
        assert!(message.authoritative());
        assert_eq!(message.response_code(), HickoryCode::NoError);
        match message.answers()[0].data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::new(192, 0, 2, 1)),
            other => panic!("expected A, got {:?}", other),
        }
        assert_eq!(message.name_servers().len(), 2);
    }

    #[test]
    fn test_unencodable_question_gets_formerr() {
        let d = dispatcher();
        // one 63-byte label of non-UTF-8 bytes; it cannot be echoed as text
        let mut packet = vec![0x01, 0x02, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.push(63);
        packet.extend_from_slice(&[0xff; 63]);
        packet.extend_from_slice(&[0, 0, 1, 0, 1]);

        let reply = d.handle(&packet, client(), MAX_UDP_SIZE).unwrap();
        assert_eq!(reply.len(), 12);
        let message = Message::from_vec(&reply).unwrap();
        assert_eq!(message.id(), 0x0102);
        assert!(message.recursion_desired());
        assert_eq!(message.response_code(), HickoryCode::FormErr);
        assert!(message.queries().is_empty());
    }

    #[test]
    fn test_malformed_packet_dropped() {
        let d = dispatcher();
        assert!(d.handle(&[0x12, 0x34, 0x01], client(), MAX_UDP_SIZE).is_none());
    }

    #[test]
    fn test_control_message_not_answered() {
        let d = dispatcher();
        let key = ClusterKey::new("cluster-secret");
        let data = SubscribeMessage::new(&key, "nyc", 1_000).to_json().unwrap();
        let packet = ControlMessage::new(SUBSCRIBE_DATANAME, data).encode(1).unwrap();
        assert!(d.handle(&packet, client(), MAX_UDP_SIZE).is_none());
        let model = d.model().lock().unwrap();
        assert!(model.subscribers().any(|s| s == "nyc"));
    }

    #[test]
    fn test_forged_control_message_ignored() {
        let d = dispatcher();
        let key = ClusterKey::new("wrong-secret");
        let data = SubscribeMessage::new(&key, "nyc", 1_000).to_json().unwrap();
        let packet = ControlMessage::new(SUBSCRIBE_DATANAME, data).encode(1).unwrap();
        assert!(d.handle(&packet, client(), MAX_UDP_SIZE).is_none());
        assert!(d.model().lock().unwrap().subscribers().next().is_none());
    }

    #[test]
    fn test_rotated_cluster_key() {
        let d = dispatcher();
        d.set_cluster_key(ClusterKey::new("rotated"));
        let data = SubscribeMessage::new(&ClusterKey::new("rotated"), "nyc", 1_000)
            .to_json()
            .unwrap();
        let packet = ControlMessage::new(SUBSCRIBE_DATANAME, data).encode(1).unwrap();
        d.handle(&packet, client(), MAX_UDP_SIZE);
        assert!(d.model().lock().unwrap().subscribers().any(|s| s == "nyc"));
    }
}
