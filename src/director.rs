//! Director runtime
//!
//! Owns the shared [`BoxStateModel`] and drives it from four periodic timers:
//!
//! ```text
//!  1 s  counter tick          BoxStateModel::tick
//!  2 s  bandwidth tick        BandwidthMeter::sample → apply_bandwidth → push vectors
//!  5 s  subscription check    gossip::check_subscriptions → subscribe requests
//! 10 s  health tick           penal decay, probe scheduling, local tests
//! ```
//!
//! Probe results come back on a channel from the [`ProbeWorker`] and are
//! applied as they arrive. Gossip is sent through the DNS UDP socket.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthMeter;
use crate::box_state::{unix_millis, BoxStateModel, StateError};
use crate::config::DirectorConfig;
use crate::dns::{send_control, DnsError, Dispatcher};
use crate::geo::GeoLookup;
use crate::gossip::{self, ClusterKey, Outgoing};
use crate::identity::{InterfaceMap, LocalIdentity, ResolvedBox};
use crate::lock_utils::lock_or_recover;
use crate::probe::{self, ProbeMessage, ProbeRequest, ProbeWorker};

pub const COUNTER_TICK: Duration = Duration::from_secs(1);
pub const BANDWIDTH_TICK: Duration = Duration::from_secs(2);
pub const SUBSCRIPTION_TICK: Duration = Duration::from_secs(5);
pub const HEALTH_TICK: Duration = Duration::from_secs(10);

/// Startup and reload errors
#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error(transparent)]
    Config(#[from] DnsError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// The running director
pub struct Director {
    model: Arc<Mutex<BoxStateModel>>,
    dispatcher: Arc<Dispatcher>,
    http: reqwest::Client,
}

impl Director {
    /// Build the state model for `identity`.
    ///
    /// Every box whose resolved IPv4 address is on a local interface is marked
    /// co-located (its `netint` is recorded).
    pub fn new(
        config: DirectorConfig,
        identity: &LocalIdentity,
        resolved: &BTreeMap<String, ResolvedBox>,
        interfaces: &InterfaceMap,
        geo: Arc<dyn GeoLookup>,
        now_ms: u64,
    ) -> Result<Self, DirectorError> {
        config.validate()?;
        let key = ClusterKey::new(&config.clustersecret);
        let mut model = BoxStateModel::new(Arc::new(config), &identity.name, now_ms)?;

        for (name, addresses) in resolved {
            if model.get(name).is_none() {
                continue;
            }
            model.set_addresses(name, addresses.ipv4, addresses.ipv6)?;
            let iface = addresses
                .ipv4
                .and_then(|ip| interfaces.get(&std::net::IpAddr::V4(ip)));
            if let Some(iface) = iface {
                model.set_netint(name, iface.clone())?;
            }
        }
        if let Some(iface) = &identity.netint {
            model.set_netint(&identity.name, iface.clone())?;
        }

        let model = Arc::new(Mutex::new(model));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&model), geo, key));
        Ok(Self {
            model,
            dispatcher,
            http: reqwest::Client::new(),
        })
    }

    pub fn model(&self) -> &Arc<Mutex<BoxStateModel>> {
        &self.model
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Swap in a new configuration, carrying live state over by box name.
    pub fn reload(&self, config: DirectorConfig, now_ms: u64) -> Result<(), DirectorError> {
        config.validate()?;
        let key = ClusterKey::new(&config.clustersecret);
        {
            let mut model = lock_or_recover(&self.model, "box state model");
            let local = model.local_name().to_string();
            let next = model.reload(Arc::new(config), &local, now_ms)?;
            *model = next;
        }
        self.dispatcher.set_cluster_key(key);
        info!("configuration reloaded");
        Ok(())
    }

    pub fn tick_counters(&self) {
        lock_or_recover(&self.model, "box state model").tick();
    }

    /// Sample the local bandwidth and build the pushes for every subscriber.
    pub fn tick_bandwidth(&self, meter: &mut BandwidthMeter, now_ms: u64) -> Vec<Outgoing> {
        let sample = match meter.sample(now_ms) {
            Ok(Some(sample)) => sample,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(target: "error", iface = %meter.iface(), error = %e, "bandwidth sample failed");
                return Vec::new();
            }
        };

        let mut model = lock_or_recover(&self.model, "box state model");
        let overshoot = model.apply_bandwidth(sample.bw, sample.bwrecv, now_ms);
        let local = model.local();
        info!(
            target: "bw",
            cdnbox = %local.config.name,
            bw = sample.bw,
            bwrecv = sample.bwrecv,
            trendbw = local.trendbw.unwrap_or(0.0),
            bytes = sample.delta_bytes,
            overshoot,
            penal = local.config.penal.unwrap_or(0.0) + model.penal.sigma() / 4.0,
            "bandwidth"
        );

        let key = self.dispatcher.cluster_key();
        match gossip::build_pushes(&mut model, &key, now_ms) {
            Ok(pushes) => pushes,
            Err(e) => {
                warn!(target: "gossip", error = %e, "failed to build state vector");
                Vec::new()
            }
        }
    }

    pub fn tick_subscriptions(&self, now_ms: u64) -> Vec<Outgoing> {
        let key = self.dispatcher.cluster_key();
        let mut model = lock_or_recover(&self.model, "box state model");
        match gossip::check_subscriptions(&mut model, &key, now_ms) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                warn!(target: "gossip", error = %e, "failed to build subscribe request");
                Vec::new()
            }
        }
    }

    /// Penal decay and probe scheduling; returns the probes to (re)start.
    pub fn tick_health(&self, now_ms: u64) -> Vec<ProbeRequest> {
        let mut model = lock_or_recover(&self.model, "box state model");
        let penal = model.read_penal_bucket(now_ms);
        debug!(target: "bw", penalbucket = penal, sigma = model.penal.sigma(), "penal bucket");
        match serde_json::to_string(&model.snapshot()) {
            Ok(state) => debug!(target: "probe", %state, "box state"),
            Err(e) => warn!(target: "error", error = %e, "box state snapshot failed"),
        }
        model.probe_schedule(now_ms)
    }

    /// Run the local box's tests and record the results.
    pub async fn run_local_tests(&self) {
        let tests = lock_or_recover(&self.model, "box state model")
            .local()
            .config
            .localtests
            .clone();
        if tests.is_empty() {
            return;
        }
        let results = probe::run_local_tests(&self.http, &tests).await;
        let mut model = lock_or_recover(&self.model, "box state model");
        for (name, passed) in results {
            model.set_local_test(&name, passed);
        }
    }

    pub fn apply_probe_message(&self, message: ProbeMessage, now_ms: u64) {
        match message {
            ProbeMessage::Perf(result) => {
                let mut model = lock_or_recover(&self.model, "box state model");
                if let Err(e) = model.apply_probe(&result, now_ms) {
                    debug!(target: "probe", error = %e, "probe result for unknown box");
                }
            }
            ProbeMessage::Log(line) => info!(target: "probe", "{}", line),
            ProbeMessage::Err(line) => debug!(target: "probe", "{}", line),
        }
    }

    /// Spawn the probe worker and the periodic timers. Gossip goes out
    /// through `socket`. Abort the returned handles to stop.
    pub fn start(self: &Arc<Self>, socket: Arc<UdpSocket>, meter: Option<BandwidthMeter>) -> Vec<JoinHandle<()>> {
        let (results_tx, mut results_rx) = mpsc::channel(256);
        let probes = ProbeWorker::spawn(results_tx);
        let mut tasks = Vec::new();

        let director = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = results_rx.recv().await {
                director.apply_probe_message(message, unix_millis());
            }
        }));

        let director = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = ticker(COUNTER_TICK);
            loop {
                interval.tick().await;
                director.tick_counters();
            }
        }));

        if let Some(mut meter) = meter {
            let director = Arc::clone(self);
            let socket = Arc::clone(&socket);
            tasks.push(tokio::spawn(async move {
                let mut interval = ticker(BANDWIDTH_TICK);
                loop {
                    interval.tick().await;
                    let pushes = director.tick_bandwidth(&mut meter, unix_millis());
                    director.send(&socket, &pushes).await;
                }
            }));
        }

        let director = Arc::clone(self);
        let gossip_socket = Arc::clone(&socket);
        tasks.push(tokio::spawn(async move {
            let mut interval = ticker(SUBSCRIPTION_TICK);
            loop {
                interval.tick().await;
                let outgoing = director.tick_subscriptions(unix_millis());
                director.send(&gossip_socket, &outgoing).await;
            }
        }));

        let director = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = ticker(HEALTH_TICK);
            loop {
                interval.tick().await;
                for request in director.tick_health(unix_millis()) {
                    if probes.send(request).await.is_err() {
                        warn!(target: "error", "probe worker stopped");
                    }
                }
                director.run_local_tests().await;
            }
        }));

        info!("director timers started");
        tasks
    }

    async fn send(&self, socket: &UdpSocket, outgoing: &[Outgoing]) {
        if outgoing.is_empty() {
            return;
        }
        let port = lock_or_recover(&self.model, "box state model")
            .config()
            .dnsserver
            .port;
        let sent = send_control(socket, outgoing, port).await;
        debug!(target: "gossip", sent, total = outgoing.len(), "control messages sent");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Bandwidth meter for the local box, if it is bandwidth-managed and its
/// interface is known.
pub fn local_meter(model: &BoxStateModel) -> Option<BandwidthMeter> {
    let local = model.local();
    if !local.config.is_bandwidth_managed() {
        return None;
    }
    local.netint.as_ref().map(BandwidthMeter::new)
}
