//! Health probe worker
//!
//! Latency probing runs beside the DNS path as its own task: the state model
//! emits [`ProbeRequest`]s on a channel, the worker keeps one interval loop per
//! (box, IP family) and reports [`ProbeMessage`]s back. Every HTTP probe is
//! pinned to an address of the requested family and bounded by a timeout.

use reqwest::header::CONNECTION;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{BoxConfig, LocalTestConfig};

/// Timeout of one latency probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout of one local test
pub const LOCAL_TEST_TIMEOUT: Duration = Duration::from_millis(3500);

const USER_AGENT: &str = "CDNBoxBot 1.0";

/// Address family a probe runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn number(&self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }

    fn loopback(&self) -> &'static str {
        match self {
            IpFamily::V4 => "127.0.0.1",
            IpFamily::V6 => "::1",
        }
    }

    fn matches(&self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (IpFamily::V4, IpAddr::V4(_)) | (IpFamily::V6, IpAddr::V6(_))
        )
    }
}

/// Start (or restart) probing one box over one family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub name: String,
    pub family: IpFamily,
    /// URL requested; its host is sent as Host/SNI
    pub url: String,
    /// Host actually connected to (the box hostname, or loopback when co-located)
    pub connect_host: String,
    pub interval_ms: u64,
}

impl ProbeRequest {
    pub fn for_box(config: &BoxConfig, family: IpFamily, co_located: bool, interval_ms: u64) -> Self {
        let connect_host = if co_located {
            family.loopback().to_string()
        } else {
            config.hostname.clone()
        };
        Self {
            name: config.name.clone(),
            family,
            url: config.perf_url(),
            connect_host,
            interval_ms,
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub family: IpFamily,
    /// Address the probe connected to; `None` when the host did not resolve
    pub ip: Option<IpAddr>,
    /// HTTP status; `None` on timeout or connection error
    pub status: Option<u16>,
    pub perf_ms: f64,
}

/// Messages from the worker to the director
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeMessage {
    Perf(ProbeResult),
    Log(String),
    Err(String),
}

/// Probe errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timeout on {0}")]
    Timeout(String),

    #[error("connection failed on {0}: {1}")]
    Connect(String, String),

    #[error("no {1} address for {0}")]
    Resolve(String, String),

    #[error("http error on {0}: {1}")]
    Http(String, String),
}

fn classify(name: &str, e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(name.to_string())
    } else if e.is_connect() {
        ProbeError::Connect(name.to_string(), e.to_string())
    } else {
        ProbeError::Http(name.to_string(), e.to_string())
    }
}

/// Resolve `host` to the first address of `family`.
async fn resolve_family(host: &str, port: u16, family: IpFamily) -> Option<IpAddr> {
    let addrs = tokio::net::lookup_host((host, port)).await.ok()?;
    addrs.map(|a| a.ip()).find(|ip| family.matches(ip))
}

/// Run one probe. Returns the address used and the HTTP status.
pub async fn probe_once(req: &ProbeRequest) -> (Option<IpAddr>, Result<u16, ProbeError>) {
    let url = match reqwest::Url::parse(&req.url) {
        Ok(url) => url,
        Err(e) => return (None, Err(ProbeError::Http(req.name.clone(), e.to_string()))),
    };
    let Some(host) = url.host_str().map(|h| h.to_string()) else {
        return (
            None,
            Err(ProbeError::Http(req.name.clone(), "URL without host".to_string())),
        );
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let ip = match resolve_family(&req.connect_host, port, req.family).await {
        Some(ip) => ip,
        None => {
            return (
                None,
                Err(ProbeError::Resolve(
                    req.connect_host.clone(),
                    format!("IPv{}", req.family.number()),
                )),
            )
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .user_agent(USER_AGENT)
        .resolve(&host, SocketAddr::new(ip, port))
        .build()
    {
        Ok(client) => client,
        Err(e) => return (Some(ip), Err(classify(&req.name, e))),
    };

    let result = async {
        let mut response = client.get(url).header(CONNECTION, "close").send().await?;
        let status = response.status().as_u16();
        // timing includes the first body chunk
        response.chunk().await?;
        Ok::<u16, reqwest::Error>(status)
    }
    .await;

    (Some(ip), result.map_err(|e| classify(&req.name, e)))
}

/// The probe worker task
pub struct ProbeWorker {
    requests: mpsc::Receiver<ProbeRequest>,
    results: mpsc::Sender<ProbeMessage>,
    loops: HashMap<(String, IpFamily), JoinHandle<()>>,
    max_interval_ms: u64,
}

impl ProbeWorker {
    pub fn new(requests: mpsc::Receiver<ProbeRequest>, results: mpsc::Sender<ProbeMessage>) -> Self {
        Self {
            requests,
            results,
            loops: HashMap::new(),
            max_interval_ms: crate::box_state::PROBE_INTERVAL_MS,
        }
    }

    /// Spawn the worker; returns the request side of its channel.
    pub fn spawn(results: mpsc::Sender<ProbeMessage>) -> mpsc::Sender<ProbeRequest> {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(Self::new(rx, results).run());
        tx
    }

    pub async fn run(mut self) {
        while let Some(req) = self.requests.recv().await {
            self.max_interval_ms = self.max_interval_ms.max(req.interval_ms);
            let started = self
                .results
                .send(ProbeMessage::Log(format!(
                    "Starting probe for {} (IPv{}) every {} ms",
                    req.name,
                    req.family.number(),
                    req.interval_ms
                )))
                .await;
            if started.is_err() {
                break;
            }

            let key = (req.name.clone(), req.family);
            if let Some(previous) = self.loops.remove(&key) {
                previous.abort();
            }
            let handle = tokio::spawn(probe_loop(req, self.results.clone(), self.max_interval_ms));
            self.loops.insert(key, handle);
        }

        for (_, handle) in self.loops.drain() {
            handle.abort();
        }
        debug!("probe worker stopped");
    }
}

async fn probe_loop(req: ProbeRequest, results: mpsc::Sender<ProbeMessage>, max_interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(req.interval_ms.max(1)));
    loop {
        ticker.tick().await;
        let started = Instant::now();
        let (ip, outcome) = probe_once(&req).await;
        let perf_ms = started.elapsed().as_millis() as f64;

        let status = match &outcome {
            Ok(status) => Some(*status),
            Err(_) => None,
        };
        info!(
            target: "probe",
            cdnbox = %req.name,
            ipv = req.family.number(),
            time = perf_ms,
            status = status.unwrap_or(0),
            "probe"
        );
        if let Err(e) = &outcome {
            if results.send(ProbeMessage::Err(e.to_string())).await.is_err() {
                return;
            }
        }

        // late results are dropped
        if perf_ms >= max_interval_ms as f64 {
            continue;
        }
        let message = ProbeMessage::Perf(ProbeResult {
            name: req.name.clone(),
            family: req.family,
            ip,
            status,
            perf_ms,
        });
        if results.send(message).await.is_err() {
            return;
        }
    }
}

/// Run one local test: true only on HTTP 200 within the timeout.
pub async fn run_local_test(client: &reqwest::Client, test: &LocalTestConfig) -> bool {
    let response = client
        .get(&test.url)
        .timeout(LOCAL_TEST_TIMEOUT)
        .send()
        .await;
    match response {
        Ok(response) if response.status().as_u16() == 200 => true,
        Ok(response) => {
            warn!(target: "error", localtest = %test.name, status = response.status().as_u16(), "localtest failed");
            false
        }
        Err(e) => {
            warn!(target: "error", localtest = %test.name, error = %e, "localtest failed");
            false
        }
    }
}

/// Run all local tests concurrently.
pub async fn run_local_tests(client: &reqwest::Client, tests: &[LocalTestConfig]) -> Vec<(String, bool)> {
    let mut set = JoinSet::new();
    for test in tests {
        let client = client.clone();
        let test = test.clone();
        set.spawn(async move {
            let passed = run_local_test(&client, &test).await;
            (test.name, passed)
        });
    }

    let mut results = Vec::with_capacity(tests.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(target: "error", error = %e, "localtest task failed"),
        }
    }
    results
}
