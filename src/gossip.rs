//! State gossip protocol
//!
//! Boxes exchange signed state vectors over the DNS port. A peer that wants
//! our bandwidth state sends a signed subscribe message; from then on the
//! local vector is pushed to it on every bandwidth tick. A subscriber that
//! stops receiving pushes re-subscribes, and after three silent windows the
//! peer is demoted to `fail`.
//!
//! ## Signatures
//!
//! ```text
//! vector:    base64(HMAC-SHA256(secret, name ‖ bw ‖ trendbw ‖ timestamp ‖ status ‖ json(localtests) ‖ penalbucket))
//! subscribe: base64(HMAC-SHA256(secret, name ‖ time))
//! ```
//!
//! Numbers are concatenated in their shortest decimal form (`41`, `12.5`, `-1`).

use base64::{engine::general_purpose::STANDARD, Engine};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

use crate::box_state::{BoxStateModel, HealthStatus};
use crate::dns::ControlMessage;

/// Control message carrying a state vector
pub const PUSH_DATANAME: &str = "pushbwdata";

/// Control message carrying a subscribe request
pub const SUBSCRIBE_DATANAME: &str = "subscribebwdata";

/// A push is expected at least this often from a subscribed peer
pub const PUSH_TIMEOUT_MS: u64 = 5_000;

/// Silent subscription windows before the peer is demoted
pub const MAX_MISSED_PUSHES: u32 = 3;

/// Resubscriptions right after start are not worth a log line
const START_GRACE_MS: u64 = 3_000;

/// Gossip errors
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("authentication failed from {0}")]
    AuthFailure(String),

    #[error("state vector too old on {name} ({timestamp} <= {last})")]
    StaleVector { name: String, timestamp: u64, last: u64 },

    #[error("unknown cdnbox {0}")]
    UnknownBox(String),

    #[error("state vector for the local cdnbox {0}")]
    LocalBox(String),

    #[error("undecodable control data: {0}")]
    Decode(String),

    #[error("unknown control message {0}")]
    UnknownDataname(String),
}

/// HMAC key derived from the cluster secret
#[derive(Clone)]
pub struct ClusterKey(hmac::Key);

impl ClusterKey {
    pub fn new(secret: &str) -> Self {
        Self(hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()))
    }

    pub fn sign(&self, payload: &str) -> String {
        STANDARD.encode(hmac::sign(&self.0, payload.as_bytes()).as_ref())
    }

    /// Constant-time check of a base64 signature
    pub fn verify(&self, payload: &str, signature: &str) -> bool {
        match STANDARD.decode(signature) {
            Ok(tag) => hmac::verify(&self.0, payload.as_bytes(), &tag).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClusterKey(..)")
    }
}

/// Bandwidth/health state of one box as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub name: String,
    /// Mbps, -1 when unknown
    pub bw: f64,
    #[serde(default = "unknown_bw")]
    pub bwrecv: f64,
    pub trendbw: f64,
    /// Sender clock, unix milliseconds
    pub timestamp: u64,
    pub status: HealthStatus,
    #[serde(default)]
    pub status6: Option<HealthStatus>,
    #[serde(default)]
    pub localtests: BTreeMap<String, bool>,
    pub penalbucket: f64,
    pub hmac: String,
}

fn unknown_bw() -> f64 {
    -1.0
}

impl StateVector {
    fn signing_payload(&self) -> String {
        let localtests = serde_json::to_string(&self.localtests).unwrap_or_else(|_| "{}".to_string());
        format!(
            "{}{}{}{}{}{}{}",
            self.name, self.bw, self.trendbw, self.timestamp, self.status, localtests, self.penalbucket
        )
    }

    pub fn to_json(&self) -> Result<String, GossipError> {
        serde_json::to_string(self).map_err(|e| GossipError::Decode(e.to_string()))
    }
}

/// Request to receive a peer's pushes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeMessage {
    pub name: String,
    pub time: u64,
    pub hmac: String,
}

impl SubscribeMessage {
    pub fn new(key: &ClusterKey, name: &str, time: u64) -> Self {
        Self {
            name: name.to_string(),
            time,
            hmac: key.sign(&format!("{}{}", name, time)),
        }
    }

    pub fn to_json(&self) -> Result<String, GossipError> {
        serde_json::to_string(self).map_err(|e| GossipError::Decode(e.to_string()))
    }
}

/// A control message addressed to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub peer: String,
    pub addr: Option<Ipv4Addr>,
    pub message: ControlMessage,
}

fn optional_bw(value: f64) -> Option<f64> {
    if value < 0.0 {
        None
    } else {
        Some(value)
    }
}

/// Build the signed vector of the local box.
///
/// Reading the penalty bucket drains it, updating the local score and sigma.
pub fn build_vector(model: &mut BoxStateModel, key: &ClusterKey, now_ms: u64) -> StateVector {
    let penalbucket = model.read_penal_bucket(now_ms);
    let local = model.local();
    let mut vector = StateVector {
        name: local.config.name.clone(),
        bw: local.bw.unwrap_or(-1.0),
        bwrecv: local.bwrecv.unwrap_or(-1.0),
        trendbw: local.trendbw.unwrap_or(-1.0),
        timestamp: now_ms,
        status: local.status,
        status6: Some(local.status6),
        localtests: local.localtests.clone(),
        penalbucket,
        hmac: String::new(),
    };
    vector.hmac = key.sign(&vector.signing_payload());
    vector
}

/// Validate and apply a received vector. Returns the sender name.
pub fn accept_vector(
    model: &mut BoxStateModel,
    key: &ClusterKey,
    data: &str,
    now_ms: u64,
) -> Result<String, GossipError> {
    let vector: StateVector =
        serde_json::from_str(data).map_err(|e| GossipError::Decode(e.to_string()))?;
    if !key.verify(&vector.signing_payload(), &vector.hmac) {
        return Err(GossipError::AuthFailure(vector.name));
    }
    if model.is_local(&vector.name) {
        return Err(GossipError::LocalBox(vector.name));
    }

    let state = model
        .get_mut(&vector.name)
        .ok_or_else(|| GossipError::UnknownBox(vector.name.clone()))?;
    if let Some(last) = state.vectortimestamp {
        if vector.timestamp <= last {
            return Err(GossipError::StaleVector {
                name: vector.name,
                timestamp: vector.timestamp,
                last,
            });
        }
    }
    state.vectortimestamp = Some(vector.timestamp);

    state.bw = optional_bw(vector.bw);
    state.trendbw = optional_bw(vector.trendbw);
    if vector.bwrecv >= 0.0 {
        state.bwrecv = Some(vector.bwrecv);
    }
    // gossip may promote a peer or switch it off, never override a local fail
    if vector.status == HealthStatus::Off || state.status != HealthStatus::Fail {
        state.status = vector.status;
    }
    if let Some(status6) = vector.status6 {
        if status6 == HealthStatus::Off || state.status6 != HealthStatus::Fail {
            state.status6 = status6;
        }
    }
    state.localtests = vector.localtests;
    state.pushupdate = Some(now_ms);
    state.missed_pushes = 0;

    let bucket_changed = state.bucket != vector.penalbucket;
    if bucket_changed {
        state.bucket = vector.penalbucket;
        state.calc_score();
        model.recalc_sigma();
    }
    Ok(vector.name)
}

/// Validate a subscribe request and register the peer. Returns its name.
pub fn accept_subscribe(
    model: &mut BoxStateModel,
    key: &ClusterKey,
    data: &str,
) -> Result<String, GossipError> {
    let message: SubscribeMessage =
        serde_json::from_str(data).map_err(|e| GossipError::Decode(e.to_string()))?;
    if !key.verify(&format!("{}{}", message.name, message.time), &message.hmac) {
        return Err(GossipError::AuthFailure(message.name));
    }
    if model.get(&message.name).is_none() {
        return Err(GossipError::UnknownBox(message.name));
    }
    if model.add_subscriber(&message.name) {
        debug!(target: "gossip", peer = %message.name, "new subscriber");
    }
    Ok(message.name)
}

/// Route a received control message.
pub fn handle_control(
    model: &mut BoxStateModel,
    key: &ClusterKey,
    message: &ControlMessage,
    now_ms: u64,
) -> Result<String, GossipError> {
    match message.dataname.as_str() {
        PUSH_DATANAME => accept_vector(model, key, &message.data, now_ms),
        SUBSCRIBE_DATANAME => accept_subscribe(model, key, &message.data),
        other => Err(GossipError::UnknownDataname(other.to_string())),
    }
}

/// Push the local vector to every activated subscriber.
pub fn build_pushes(
    model: &mut BoxStateModel,
    key: &ClusterKey,
    now_ms: u64,
) -> Result<Vec<Outgoing>, GossipError> {
    if model.subscribers().next().is_none() {
        return Ok(Vec::new());
    }
    let data = build_vector(model, key, now_ms).to_json()?;
    Ok(model
        .subscribers()
        .map(|peer| Outgoing {
            peer: peer.clone(),
            addr: model.get(peer).and_then(|s| s.ipv4),
            message: ControlMessage::new(PUSH_DATANAME, data.clone()),
        })
        .collect())
}

/// The 5 s subscription check.
///
/// Remote bandwidth-managed peers that have not pushed within the window get a
/// fresh subscribe request; three consecutive silent windows demote the peer.
pub fn check_subscriptions(
    model: &mut BoxStateModel,
    key: &ClusterKey,
    now_ms: u64,
) -> Result<Vec<Outgoing>, GossipError> {
    let local_name = model.local_name().to_string();
    let since_start = now_ms.saturating_sub(model.started_ms());
    let subscribe = SubscribeMessage::new(key, &local_name, now_ms).to_json()?;

    let peers: Vec<String> = model
        .iter()
        .filter(|s| s.config.name != local_name && s.config.is_bandwidth_managed())
        .filter(|s| !s.config.dontpushsubscribe)
        .map(|s| s.config.name.clone())
        .collect();

    let mut outgoing = Vec::new();
    for peer in peers {
        let Some(state) = model.get_mut(&peer) else {
            continue;
        };
        if let Some(pushed) = state.pushupdate {
            if now_ms.saturating_sub(pushed) < PUSH_TIMEOUT_MS {
                state.missed_pushes = 0;
                continue;
            }
        }

        if state.subscribed_at.is_some() {
            state.missed_pushes += 1;
            if state.missed_pushes >= MAX_MISSED_PUSHES && state.status == HealthStatus::On {
                state.status = HealthStatus::Fail;
                state.score = None;
                warn!(
                    target: "gossip",
                    peer = %peer,
                    missed = state.missed_pushes,
                    "no push received, peer marked fail"
                );
            }
        }
        if since_start > START_GRACE_MS {
            warn!(target: "gossip", peer = %peer, "Push timeout. resubscribe to push state");
        }
        state.subscribed_at = Some(now_ms);
        outgoing.push(Outgoing {
            peer: peer.clone(),
            addr: state.ipv4,
            message: ControlMessage::new(SUBSCRIBE_DATANAME, subscribe.clone()),
        });
    }
    Ok(outgoing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::box_state::tests::{test_config, test_model};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn key() -> ClusterKey {
        ClusterKey::new("cluster-secret")
    }

    /// The same fleet seen from nyc
    fn nyc_model() -> BoxStateModel {
        BoxStateModel::new(Arc::new(test_config()), "nyc", 1_000).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let key = key();
        let sig = key.sign("payload");
        assert!(key.verify("payload", &sig));
        assert!(!key.verify("payload2", &sig));
        assert!(!key.verify("payload", "not base64!"));
        assert!(!ClusterKey::new("other").verify("payload", &sig));
    }

    #[test]
    fn test_signing_payload_format() {
        let vector = StateVector {
            name: "paris".into(),
            bw: 41.0,
            bwrecv: 0.0,
            trendbw: 12.5,
            timestamp: 1700000000000,
            status: HealthStatus::On,
            status6: None,
            localtests: BTreeMap::from([("origin".to_string(), true)]),
            penalbucket: 0.0,
            hmac: String::new(),
        };
        assert_eq!(
            vector.signing_payload(),
            "paris4112.51700000000000on{\"origin\":true}0"
        );
    }

    #[test]
    fn test_vector_exchange() {
        let key = key();
        let mut paris = test_model();
        let mut nyc = nyc_model();

        let vector = build_vector(&mut paris, &key, 2_000);
        let json = vector.to_json().unwrap();
        let name = accept_vector(&mut nyc, &key, &json, 2_100).unwrap();
        assert_eq!(name, "paris");

        let seen = nyc.get("paris").unwrap();
        assert_eq!(seen.bw, Some(41.0));
        assert_eq!(seen.trendbw, Some(100.0));
        assert_eq!(seen.vectortimestamp, Some(2_000));
        assert_eq!(seen.pushupdate, Some(2_100));
    }

    #[test]
    fn test_tampered_vector_is_rejected() {
        let key = key();
        let mut paris = test_model();
        let mut nyc = nyc_model();

        let mut vector = build_vector(&mut paris, &key, 2_000);
        vector.bw = 1.0;
        let err = accept_vector(&mut nyc, &key, &vector.to_json().unwrap(), 2_100).unwrap_err();
        assert!(matches!(err, GossipError::AuthFailure(_)));
        assert!(nyc.get("paris").unwrap().bw.is_none());
        assert!(nyc.get("paris").unwrap().vectortimestamp.is_none());
    }

    #[test]
    fn test_replay_and_equal_timestamp_rejected() {
        let key = key();
        let mut paris = test_model();
        let mut nyc = nyc_model();

        let first = build_vector(&mut paris, &key, 2_000).to_json().unwrap();
        accept_vector(&mut nyc, &key, &first, 2_000).unwrap();
        let before = nyc.get("paris").unwrap().clone();

        let err = accept_vector(&mut nyc, &key, &first, 2_500).unwrap_err();
        assert!(matches!(err, GossipError::StaleVector { .. }));
        assert_eq!(nyc.get("paris").unwrap().pushupdate, before.pushupdate);

        paris.local_mut().bw = Some(99.0);
        let older = build_vector(&mut paris, &key, 1_500).to_json().unwrap();
        assert!(matches!(
            accept_vector(&mut nyc, &key, &older, 2_600),
            Err(GossipError::StaleVector { .. })
        ));
        assert_eq!(nyc.get("paris").unwrap().bw, Some(41.0));
    }

    #[test]
    fn test_gossip_cannot_override_local_fail() {
        let key = key();
        let mut paris = test_model();
        let mut nyc = nyc_model();
        nyc.get_mut("paris").unwrap().status = HealthStatus::Fail;

        let on = build_vector(&mut paris, &key, 2_000).to_json().unwrap();
        accept_vector(&mut nyc, &key, &on, 2_000).unwrap();
        assert_eq!(nyc.get("paris").unwrap().status, HealthStatus::Fail);

        paris.local_mut().status = HealthStatus::Off;
        let off = build_vector(&mut paris, &key, 3_000).to_json().unwrap();
        accept_vector(&mut nyc, &key, &off, 3_000).unwrap();
        assert_eq!(nyc.get("paris").unwrap().status, HealthStatus::Off);

        paris.local_mut().status = HealthStatus::On;
        let back = build_vector(&mut paris, &key, 4_000).to_json().unwrap();
        accept_vector(&mut nyc, &key, &back, 4_000).unwrap();
        assert_eq!(nyc.get("paris").unwrap().status, HealthStatus::On);
    }

    #[test]
    fn test_penal_bucket_updates_sigma() {
        let key = key();
        let mut paris = test_model();
        let mut nyc = nyc_model();

        for _ in 0..25 {
            paris.increase_penal(1_000);
        }
        let vector = build_vector(&mut paris, &key, 1_000);
        assert_eq!(vector.penalbucket, 2.0);
        accept_vector(&mut nyc, &key, &vector.to_json().unwrap(), 1_000).unwrap();

        assert_eq!(nyc.get("paris").unwrap().bucket, 2.0);
        let sum: f64 = nyc.iter().map(|b| b.bucket).sum();
        assert_eq!(nyc.penal.sigma(), sum);
    }

    #[test]
    fn test_unknown_and_local_sender() {
        let key = key();
        let mut paris = test_model();
        let mut other = test_model();

        let own = build_vector(&mut paris, &key, 2_000).to_json().unwrap();
        assert!(matches!(
            accept_vector(&mut other, &key, &own, 2_000),
            Err(GossipError::LocalBox(_))
        ));

        let mut ghost = build_vector(&mut paris, &key, 3_000);
        ghost.name = "ghost".into();
        ghost.hmac = key.sign(&ghost.signing_payload());
        assert!(matches!(
            accept_vector(&mut other, &key, &ghost.to_json().unwrap(), 3_000),
            Err(GossipError::UnknownBox(_))
        ));

        assert!(matches!(
            accept_vector(&mut other, &key, "{not json", 3_000),
            Err(GossipError::Decode(_))
        ));
    }

    #[test]
    fn test_subscribe_then_push() {
        let key = key();
        let mut paris = test_model();
        let mut nyc = nyc_model();

        // nyc subscribes to paris
        let requests = check_subscriptions(&mut nyc, &key, 1_000).unwrap();
        let to_paris = requests.iter().find(|o| o.peer == "paris").unwrap();
        assert_eq!(to_paris.message.dataname, SUBSCRIBE_DATANAME);
        assert_eq!(to_paris.addr, Some(Ipv4Addr::new(192, 0, 2, 1)));

        let name = handle_control(&mut paris, &key, &to_paris.message, 1_000).unwrap();
        assert_eq!(name, "nyc");
        assert_eq!(paris.subscribers().collect::<Vec<_>>(), vec!["nyc"]);

        let pushes = build_pushes(&mut paris, &key, 2_000).unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].addr, Some(Ipv4Addr::new(192, 0, 2, 2)));
        handle_control(&mut nyc, &key, &pushes[0].message, 2_000).unwrap();

        // a fresh push suppresses the next resubscription
        let requests = check_subscriptions(&mut nyc, &key, 5_000).unwrap();
        assert!(requests.iter().all(|o| o.peer != "paris"));
    }

    #[test]
    fn test_forged_subscribe_rejected() {
        let key = key();
        let mut paris = test_model();
        let forged = SubscribeMessage::new(&ClusterKey::new("wrong"), "nyc", 1).to_json().unwrap();
        let message = ControlMessage::new(SUBSCRIBE_DATANAME, forged);
        assert!(matches!(
            handle_control(&mut paris, &key, &message, 1),
            Err(GossipError::AuthFailure(_))
        ));
        assert_eq!(paris.subscribers().count(), 0);

        let unknown = ControlMessage::new("getbwdata", "{}");
        assert!(matches!(
            handle_control(&mut paris, &key, &unknown, 1),
            Err(GossipError::UnknownDataname(_))
        ));
    }

    #[test]
    fn test_three_silent_windows_demote_peer() {
        let key = key();
        let mut nyc = nyc_model();

        check_subscriptions(&mut nyc, &key, 1_000).unwrap();
        check_subscriptions(&mut nyc, &key, 6_000).unwrap();
        check_subscriptions(&mut nyc, &key, 11_000).unwrap();
        assert_eq!(nyc.get("paris").unwrap().status, HealthStatus::On);
        check_subscriptions(&mut nyc, &key, 16_000).unwrap();
        assert_eq!(nyc.get("paris").unwrap().status, HealthStatus::Fail);
        // tokyo has no bandwidth target and is never subscribed to
        assert!(nyc.get("tokyo").unwrap().subscribed_at.is_none());
    }

    #[test]
    fn test_dontpushsubscribe() {
        let key = key();
        let mut config = test_config();
        config.cdnboxes[0].dontpushsubscribe = true;
        let mut nyc = BoxStateModel::new(Arc::new(config), "nyc", 0).unwrap();
        assert!(check_subscriptions(&mut nyc, &key, 1_000).unwrap().is_empty());
    }

    #[test]
    fn test_fractional_bandwidths_verify() {
        let key = key();
        let mut paris = test_model();
        let mut nyc = nyc_model();

        // rates as the interface meter computes them
        for i in 1..=2_000u64 {
            let bytes = 1_000_003 * i + 7_919 * (i % 13);
            let elapsed_ms = 1_990 + i % 23;
            let bw = (bytes * 8) as f64 / elapsed_ms as f64 * 1000.0 / 1024.0 / 1024.0;
            let local = paris.local_mut();
            local.bw = Some(bw);
            local.bwrecv = Some(bw / 3.0);
            local.trendbw = Some(bw * 0.1 + 17.3);

            let now = 2_000 + i;
            let vector = build_vector(&mut paris, &key, now);
            let name = accept_vector(&mut nyc, &key, &vector.to_json().unwrap(), now).unwrap();
            assert_eq!(name, "paris");
            assert_eq!(nyc.get("paris").unwrap().bw, Some(bw));
        }
    }

    #[test]
    fn test_reported_vector_verifies() {
        let key = key();
        let mut paris = test_model();
        let mut nyc = nyc_model();
        let local = paris.local_mut();
        local.bw = Some(1934.2624121958586);
        local.bwrecv = Some(644.7541373986195);
        local.trendbw = Some(222.28416081305724);

        let json = build_vector(&mut paris, &key, 2_000).to_json().unwrap();
        accept_vector(&mut nyc, &key, &json, 2_000).unwrap();
        let seen = nyc.get("paris").unwrap();
        assert_eq!(seen.bw, Some(1934.2624121958586));
        assert_eq!(seen.trendbw, Some(222.28416081305724));
    }

    proptest! {
        #[test]
        fn prop_signed_vector_survives_json(
            bw in any::<f64>().prop_filter("finite", |v| v.is_finite()).prop_map(f64::abs),
            trendbw in any::<f64>().prop_filter("finite", |v| v.is_finite()).prop_map(f64::abs),
            bwrecv in any::<f64>().prop_filter("finite", |v| v.is_finite()).prop_map(f64::abs),
        ) {
            let key = key();
            let mut paris = test_model();
            let mut nyc = nyc_model();
            let local = paris.local_mut();
            local.bw = Some(bw);
            local.bwrecv = Some(bwrecv);
            local.trendbw = Some(trendbw);

            let vector = build_vector(&mut paris, &key, 2_000);
            let json = vector.to_json().unwrap();
            prop_assert!(accept_vector(&mut nyc, &key, &json, 2_000).is_ok());

            let seen = nyc.get("paris").unwrap();
            prop_assert_eq!(seen.bw, Some(bw));
            prop_assert_eq!(seen.trendbw, Some(trendbw));
            prop_assert_eq!(seen.bwrecv, Some(bwrecv));
        }
    }
}
