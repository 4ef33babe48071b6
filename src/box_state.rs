//! Box State Model
//!
//! Single owned store for the runtime state of every configured box plus the
//! process-wide aggregates: the global DNS admission counter, the total query
//! rate, the penalty bucket and the per-application statistics.
//!
//! Exactly one box is "local": its bandwidth and penalty are measured here and
//! it is the source of the state vector pushed to peers. Remote boxes get their
//! bandwidth from gossip and their latency from the probe worker.
//!
//! All time-dependent operations take an explicit `now_ms` (unix milliseconds).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::config::{BoxConfig, DirectorConfig};
use crate::penal_bucket::PenalBucket;
use crate::probe::{IpFamily, ProbeRequest, ProbeResult};

/// A probe result older than this demotes the box
pub const PROBE_STALE_MS: u64 = 20_000;

/// Interval requested from the probe worker
pub const PROBE_INTERVAL_MS: u64 = 10_000;

/// Current unix time in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reachability of one IP family of a box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    On,
    Fail,
    Off,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::On => "on",
            HealthStatus::Fail => "fail",
            HealthStatus::Off => "off",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State model errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Unknown cdnbox: {0}")]
    UnknownBox(String),

    #[error("Local cdnbox not detected: {0}")]
    UnknownLocalBox(String),
}

/// Per-box request rate estimator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateCounter {
    pub current: f64,
    pub average: f64,
    pub last: f64,
}

impl RateCounter {
    pub fn new(average: f64) -> Self {
        Self {
            current: 0.0,
            average,
            last: 0.0,
        }
    }

    /// One 1 s tick of the moving average, floored at `avgmin`
    fn tick(&mut self, avgmin: f64) {
        self.average = ((self.average * 9.0 + self.current) / 10.0).max(avgmin);
        self.last = self.current;
        self.current = 0.0;
    }
}

/// Global admission counter with a decaying deficit `limit`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GlobalCounter {
    pub current: f64,
    pub average: f64,
    pub limit: f64,
    pub last: f64,
}

/// Query counts per application and per chosen box
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppStats {
    pub count: u64,
    pub boxes: BTreeMap<String, u64>,
}

/// Runtime state of one box
#[derive(Debug, Clone)]
pub struct BoxState {
    pub config: BoxConfig,
    pub status: HealthStatus,
    pub status6: HealthStatus,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub bw: Option<f64>,
    pub trendbw: Option<f64>,
    pub bwrecv: Option<f64>,
    pub gettime: Option<f64>,
    pub gettime6: Option<f64>,
    /// Lower is better; `None` removes the box from selection
    pub score: Option<f64>,
    pub bucket: f64,
    pub dnscount: RateCounter,
    pub localtests: BTreeMap<String, bool>,
    /// Last accepted gossip timestamp
    pub vectortimestamp: Option<u64>,
    /// Last time a push was received
    pub pushupdate: Option<u64>,
    /// Last time we sent a subscribe request to this box
    pub subscribed_at: Option<u64>,
    /// Consecutive subscription windows without a push
    pub missed_pushes: u32,
    pub perf_update: Option<u64>,
    pub perf_update6: Option<u64>,
    /// Network interface carrying this box's traffic (co-located boxes only)
    pub netint: Option<String>,
}

impl BoxState {
    fn new(config: BoxConfig, avgmin: f64) -> Self {
        let status = config.status.unwrap_or_default();
        let score = config.fixscore;
        Self {
            ipv4: config.ipv4,
            ipv6: config.ipv6,
            status,
            status6: if config.ipv6.is_some() {
                HealthStatus::Fail
            } else {
                status
            },
            bw: None,
            trendbw: None,
            bwrecv: None,
            gettime: None,
            gettime6: None,
            score,
            bucket: 0.0,
            dnscount: RateCounter::new(avgmin),
            localtests: BTreeMap::new(),
            vectortimestamp: None,
            pushupdate: None,
            subscribed_at: None,
            missed_pushes: 0,
            perf_update: None,
            perf_update6: None,
            netint: None,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_on(&self) -> bool {
        self.status == HealthStatus::On
    }

    /// `score = gettime + addscore + bucket`, unless the score is fixed or the box is not on
    pub fn calc_score(&mut self) {
        if self.config.fixscore.is_none() && self.status == HealthStatus::On {
            self.score = self
                .gettime
                .map(|gettime| gettime + self.config.addscore + self.bucket);
        }
    }

    /// Per-box throttle: current request rate above `ratio × average`
    pub fn dns_req_throttle(&self, ratio: f64) -> bool {
        if self.dnscount.current > ratio * self.dnscount.average {
            info!(
                target: "limit",
                cause = "Throttle DNS cdnbox",
                ratio,
                cdnbox = %self.config.name,
                data = %format!("{}/{}", self.dnscount.current, self.dnscount.average),
                "throttled"
            );
            return true;
        }
        false
    }
}

/// Serialisable view of one box
#[derive(Debug, Clone, Serialize)]
pub struct BoxSnapshot {
    pub name: String,
    pub local: bool,
    pub status: HealthStatus,
    pub status6: HealthStatus,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub bw: Option<f64>,
    pub trendbw: Option<f64>,
    pub bwrecv: Option<f64>,
    pub gettime: Option<f64>,
    pub gettime6: Option<f64>,
    pub score: Option<f64>,
    pub bucket: f64,
    pub dnscount: RateCounter,
    pub localtests: BTreeMap<String, bool>,
}

/// Serialisable view of the whole model
#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub boxes: Vec<BoxSnapshot>,
    pub globaldnscount: GlobalCounter,
    pub totaldnscount: RateCounter,
    pub penalbucket: f64,
    pub sigma: f64,
    pub applistats: BTreeMap<String, AppStats>,
    pub subscribers: Vec<String>,
}

/// The shared state store
#[derive(Debug)]
pub struct BoxStateModel {
    config: Arc<DirectorConfig>,
    boxes: Vec<BoxState>,
    index: HashMap<String, usize>,
    local: usize,
    pub globaldnscount: GlobalCounter,
    pub totaldnscount: RateCounter,
    pub penal: PenalBucket,
    pub app_stats: BTreeMap<String, AppStats>,
    /// Peers that asked for our state vector
    subscribers: BTreeSet<String>,
    started_ms: u64,
}

impl BoxStateModel {
    /// Build one state per configured box. `local_name` must name one of them.
    pub fn new(
        config: Arc<DirectorConfig>,
        local_name: &str,
        now_ms: u64,
    ) -> Result<Self, StateError> {
        let avgmin = config.dnsserver.dnscountavgmin;
        let boxes: Vec<BoxState> = config
            .cdnboxes
            .iter()
            .map(|b| BoxState::new(b.clone(), avgmin))
            .collect();
        let index: HashMap<String, usize> = boxes
            .iter()
            .enumerate()
            .map(|(i, b)| (b.config.name.clone(), i))
            .collect();
        let local = *index
            .get(local_name)
            .ok_or_else(|| StateError::UnknownLocalBox(local_name.to_string()))?;

        let app_stats = config
            .applis
            .iter()
            .map(|(app, candidates)| {
                let boxes = candidates
                    .iter()
                    .map(|c| (c.cdnbox.clone(), 0))
                    .collect::<BTreeMap<_, _>>();
                (app.clone(), AppStats { count: 0, boxes })
            })
            .collect();

        let mut model = Self {
            globaldnscount: GlobalCounter {
                current: 0.0,
                average: avgmin * 15.0,
                limit: -avgmin,
                last: 0.0,
            },
            totaldnscount: RateCounter::default(),
            penal: PenalBucket::new(now_ms, config.states.penalgdown),
            app_stats,
            subscribers: BTreeSet::new(),
            started_ms: now_ms,
            boxes,
            index,
            local,
            config,
        };

        let local_box = &mut model.boxes[local];
        if let Some(target) = local_box.config.targetbw {
            local_box.bw = Some(local_box.config.dnsthrottlebwratio * target + 1.0);
            local_box.trendbw = Some(target);
            local_box.bwrecv = Some(0.0);
        }
        Ok(model)
    }

    /// Rebuild from a new configuration, carrying live counters over by box name.
    pub fn reload(
        &self,
        config: Arc<DirectorConfig>,
        local_name: &str,
        now_ms: u64,
    ) -> Result<Self, StateError> {
        let mut next = Self::new(config, local_name, now_ms)?;
        for state in &mut next.boxes {
            let Some(previous) = self.get(state.name()) else {
                continue;
            };
            state.dnscount = previous.dnscount;
            state.bucket = previous.bucket;
            if state.config.ipv4.is_none() {
                state.ipv4 = previous.ipv4;
            }
            if state.config.ipv6.is_none() {
                state.ipv6 = previous.ipv6;
            }
            state.netint = previous.netint.clone();
            if previous.bw.is_some() {
                state.bw = previous.bw;
                state.trendbw = previous.trendbw;
                state.bwrecv = previous.bwrecv;
            }
            state.gettime = previous.gettime;
            state.gettime6 = previous.gettime6;
            state.perf_update = previous.perf_update;
            state.perf_update6 = previous.perf_update6;
            state.vectortimestamp = previous.vectortimestamp;
            state.localtests = previous.localtests.clone();
            state.calc_score();
        }
        next.globaldnscount = self.globaldnscount;
        next.totaldnscount = self.totaldnscount;
        next.penal.restore(&self.penal);
        next.subscribers = self
            .subscribers
            .iter()
            .filter(|name| next.index.contains_key(*name))
            .cloned()
            .collect();
        next.started_ms = self.started_ms;
        next.recalc_sigma();
        Ok(next)
    }

    pub fn config(&self) -> &Arc<DirectorConfig> {
        &self.config
    }

    pub fn started_ms(&self) -> u64 {
        self.started_ms
    }

    pub fn get(&self, name: &str) -> Option<&BoxState> {
        self.index.get(name).map(|&i| &self.boxes[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut BoxState> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.boxes[i]),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoxState> {
        self.boxes.iter()
    }

    pub fn local(&self) -> &BoxState {
        &self.boxes[self.local]
    }

    pub fn local_mut(&mut self) -> &mut BoxState {
        &mut self.boxes[self.local]
    }

    pub fn local_name(&self) -> &str {
        self.boxes[self.local].name()
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.local_name() == name
    }

    /// Record resolved addresses (hostname lookup at startup)
    pub fn set_addresses(
        &mut self,
        name: &str,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    ) -> Result<(), StateError> {
        let state = self
            .get_mut(name)
            .ok_or_else(|| StateError::UnknownBox(name.to_string()))?;
        if ipv4.is_some() {
            state.ipv4 = ipv4;
        }
        if ipv6.is_some() && state.ipv6 != ipv6 {
            state.ipv6 = ipv6;
            state.status6 = HealthStatus::Fail;
        }
        Ok(())
    }

    pub fn set_netint(&mut self, name: &str, iface: impl Into<String>) -> Result<(), StateError> {
        let state = self
            .get_mut(name)
            .ok_or_else(|| StateError::UnknownBox(name.to_string()))?;
        state.netint = Some(iface.into());
        Ok(())
    }

    pub fn recalc_sigma(&mut self) {
        let sigma = self.boxes.iter().map(|b| b.bucket).sum();
        self.penal.set_sigma(sigma);
    }

    /// Drain the penalty bucket, copy it into the local box and return its floor.
    ///
    /// Side effects: the local score and `sigma` are recomputed.
    pub fn read_penal_bucket(&mut self, now_ms: u64) -> f64 {
        let count = self.penal.drain(now_ms);
        let local = self.local_mut();
        local.bucket = count;
        local.calc_score();
        self.recalc_sigma();
        count.floor()
    }

    /// Record one bandwidth overshoot
    pub fn increase_penal(&mut self, now_ms: u64) {
        self.read_penal_bucket(now_ms);
        self.penal.bump();
        self.recalc_sigma();
    }

    /// Global throttle: `limit + current > globalthrottlelimit × average`
    pub fn dns_global_req_throttle(&self, state: &BoxState) -> bool {
        let g = &self.globaldnscount;
        if g.limit + g.current > self.config.dnsserver.globalthrottlelimit * g.average {
            info!(
                target: "limit",
                cause = "Throttle DNS global",
                cdnbox = %state.config.name,
                data = %format!("{}/{}/{}", g.current, g.limit, g.average),
                "throttled"
            );
            return true;
        }
        false
    }

    /// The 1 s recompute of every request counter.
    pub fn tick(&mut self) {
        let avgmin = self.config.dnsserver.dnscountavgmin;
        for state in &mut self.boxes {
            state.dnscount.tick(avgmin);
        }

        let g = &mut self.globaldnscount;
        g.average = ((g.average * 9.0 + g.current) / 10.0).max(avgmin);
        g.limit += g.current - self.config.dnsserver.dnscountdownratio * g.average;
        if g.limit < 0.0 {
            g.limit = 0.0;
        }
        g.last = g.current;
        g.current = 0.0;

        let t = &mut self.totaldnscount;
        t.average = (t.average * 9.0 + t.current) / 10.0;
        t.last = t.current;
        t.current = 0.0;
    }

    /// Count a query the selector routed to `name` (box and global counters).
    pub fn count_request(&mut self, name: &str) {
        if let Some(state) = self.get_mut(name) {
            state.dnscount.current += 1.0;
            if state.config.is_bandwidth_managed() {
                self.globaldnscount.current += 1.0;
            }
        }
    }

    pub fn count_app(&mut self, app: &str, chosen: Option<&str>) {
        let stats = self.app_stats.entry(app.to_string()).or_default();
        stats.count += 1;
        if let Some(name) = chosen {
            *stats.boxes.entry(name.to_string()).or_default() += 1;
        }
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &String> {
        self.subscribers.iter()
    }

    pub(crate) fn add_subscriber(&mut self, name: &str) -> bool {
        self.subscribers.insert(name.to_string())
    }

    /// Apply one probe result.
    pub fn apply_probe(&mut self, result: &ProbeResult, now_ms: u64) -> Result<(), StateError> {
        let idx = *self
            .index
            .get(&result.name)
            .ok_or_else(|| StateError::UnknownBox(result.name.clone()))?;
        let is_local = idx == self.local;
        let state = &mut self.boxes[idx];

        match result.family {
            IpFamily::V4 => {
                state.perf_update = Some(now_ms);
                state.gettime = Some(result.perf_ms);
            }
            IpFamily::V6 => {
                state.perf_update6 = Some(now_ms);
                state.gettime6 = Some(result.perf_ms);
            }
        }

        if !is_local && state.netint.is_none() && !state.config.cname {
            track_address_change(state, result);
        }

        let ok = result.status == Some(200);
        match (result.family, ok) {
            (IpFamily::V4, true) => {
                if is_local {
                    state.gettime = state.gettime.map(|t| (t / 2.0).round());
                }
                if state.status == HealthStatus::Fail {
                    state.status = HealthStatus::On;
                    info!(target: "probe", cdnbox = %state.config.name, "IPv4 back on");
                }
                state.calc_score();
            }
            (IpFamily::V6, true) => {
                if state.status6 == HealthStatus::Fail {
                    state.status6 = HealthStatus::On;
                }
            }
            (IpFamily::V4, false) => {
                if state.config.fixscore.is_none() {
                    state.score = None;
                }
                if state.status == HealthStatus::On {
                    state.status = HealthStatus::Fail;
                    warn!(
                        target: "probe",
                        cdnbox = %state.config.name,
                        status = ?result.status,
                        "IPv4 probe failed"
                    );
                }
            }
            (IpFamily::V6, false) => {
                if state.status6 == HealthStatus::On {
                    state.status6 = HealthStatus::Fail;
                }
            }
        }
        Ok(())
    }

    /// Demote boxes without a recent probe result and return the probes to (re)start.
    pub fn probe_schedule(&mut self, now_ms: u64) -> Vec<ProbeRequest> {
        let local = self.local;
        let mut requests = Vec::new();
        for (idx, state) in self.boxes.iter_mut().enumerate() {
            if state.config.fixscore.is_some() {
                continue;
            }
            let co_located = idx == local || state.netint.is_some();

            if now_ms.saturating_sub(state.perf_update.unwrap_or(0)) > PROBE_STALE_MS {
                state.score = None;
                if state.status == HealthStatus::On {
                    state.status = HealthStatus::Fail;
                }
                if state.perf_update.is_some() {
                    warn!(target: "probe", cdnbox = %state.config.name, "IPv4 timeout");
                }
                requests.push(ProbeRequest::for_box(
                    &state.config,
                    IpFamily::V4,
                    co_located,
                    PROBE_INTERVAL_MS,
                ));
            }

            if state.ipv6.is_some()
                && now_ms.saturating_sub(state.perf_update6.unwrap_or(0)) > PROBE_STALE_MS
            {
                if state.status6 == HealthStatus::On {
                    state.status6 = HealthStatus::Fail;
                }
                if state.perf_update6.is_some() {
                    warn!(target: "probe", cdnbox = %state.config.name, "IPv6 timeout");
                }
                requests.push(ProbeRequest::for_box(
                    &state.config,
                    IpFamily::V6,
                    co_located,
                    PROBE_INTERVAL_MS,
                ));
            }
        }
        requests
    }

    /// Apply a bandwidth sample of the local box. Returns true on overshoot.
    pub fn apply_bandwidth(&mut self, bw: f64, bwrecv: f64, now_ms: u64) -> bool {
        let local = self.local_mut();
        let target = local.config.targetbw;
        let trend = local.trendbw.or(target).unwrap_or(bw);
        local.bw = Some(bw);
        local.trendbw = Some((bw + 14.0 * trend) / 15.0);
        local.bwrecv = Some(bwrecv);

        match target {
            Some(target) if bw > 1.1 * target => {
                self.increase_penal(now_ms);
                true
            }
            _ => false,
        }
    }

    pub fn set_local_test(&mut self, name: &str, passed: bool) {
        self.local_mut().localtests.insert(name.to_string(), passed);
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            boxes: self
                .boxes
                .iter()
                .enumerate()
                .map(|(i, b)| BoxSnapshot {
                    name: b.config.name.clone(),
                    local: i == self.local,
                    status: b.status,
                    status6: b.status6,
                    ipv4: b.ipv4,
                    ipv6: b.ipv6,
                    bw: b.bw,
                    trendbw: b.trendbw,
                    bwrecv: b.bwrecv,
                    gettime: b.gettime,
                    gettime6: b.gettime6,
                    score: b.score,
                    bucket: b.bucket,
                    dnscount: b.dnscount,
                    localtests: b.localtests.clone(),
                })
                .collect(),
            globaldnscount: self.globaldnscount,
            totaldnscount: self.totaldnscount,
            penalbucket: self.penal.count(),
            sigma: self.penal.sigma(),
            applistats: self.app_stats.clone(),
            subscribers: self.subscribers.iter().cloned().collect(),
        }
    }
}

fn track_address_change(state: &mut BoxState, result: &ProbeResult) {
    match result.family {
        IpFamily::V4 => {
            let ip = match result.ip {
                Some(IpAddr::V4(v4)) => Some(v4),
                _ => return,
            };
            if ip != state.ipv4 {
                state.ipv4 = ip;
                warn!(
                    target: "probe",
                    hostname = %state.config.hostname,
                    ipv4 = ?ip,
                    "IPv4 has changed. Updated."
                );
            }
        }
        IpFamily::V6 => {
            let ip = match result.ip {
                Some(IpAddr::V6(v6)) => Some(v6),
                _ => return,
            };
            if ip != state.ipv6 {
                state.ipv6 = ip;
                warn!(
                    target: "probe",
                    hostname = %state.config.hostname,
                    ipv6 = ?ip,
                    "IPv6 has changed. Updated."
                );
            }
        }
    }
}
