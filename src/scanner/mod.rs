//! Discovery and verification pipeline.
//!
//! A producer shells out to the range scanner once per target range and
//! pushes every responding `host:port` onto a shared queue. A single
//! consumer loop pops targets, classifies each one (status query, then the
//! login engine unless fast mode is on), and hands the result to the
//! report sink. The consumer is deliberately the only writer to the sink,
//! which keeps classifications for the same host from racing each other.

pub mod targets;

use std::{
    collections::VecDeque,
    net::SocketAddrV4,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use eyre::{WrapErr, bail};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    process::Command,
    sync::{Semaphore, watch},
};
use tracing::{debug, error, info};

use crate::{
    protocol::{
        Endpoint,
        login::{
            self, JoinCredentials, JoinRequest, ServerClassification, SessionService,
        },
        status::{self, StatusError},
    },
    report::{ReportSink, ServerReport},
};

use targets::Ipv4Range;

/// How long the consumer sleeps when the queue is empty.
pub const CONSUMER_BACKOFF: Duration = Duration::from_secs(1);

/// The open ports waiting for verification. Producer tasks push from many
/// threads; the single consumer pops. Unbounded on purpose, the producer
/// can burst far ahead of verification.
#[derive(Default)]
pub struct ScanQueue {
    inner: Mutex<VecDeque<SocketAddrV4>>,
}

impl ScanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, target: SocketAddrV4) {
        self.inner.lock().push_back(target);
    }

    pub fn push_all(&self, targets: impl IntoIterator<Item = SocketAddrV4>) {
        self.inner.lock().extend(targets);
    }

    pub fn pop(&self) -> Option<SocketAddrV4> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[derive(Deserialize)]
struct DiscoveryRecord {
    ip: std::net::Ipv4Addr,
    #[serde(default)]
    ports: Vec<DiscoveredPort>,
}

#[derive(Deserialize)]
struct DiscoveredPort {
    port: u16,
    #[serde(default)]
    status: Option<String>,
}

/// The opaque range-scanner process. We only care that it takes a range, a
/// rate, and a port band, and prints `(ip, port, open)` records as JSON.
pub struct RangeScanner {
    pub binary: PathBuf,
    pub rate: u32,
    /// Port band argument, e.g. `25565` or `25560-25570`.
    pub ports: String,
}

impl RangeScanner {
    pub async fn scan(&self, range: &Ipv4Range) -> eyre::Result<Vec<SocketAddrV4>> {
        let output = Command::new(&self.binary)
            .arg(range.to_string())
            .args(["-p", &self.ports])
            .args(["--rate", &self.rate.to_string()])
            .args(["-oJ", "-"])
            .output()
            .await
            .wrap_err_with(|| format!("failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            bail!(
                "range scanner exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(parse_discoveries(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses the scanner's JSON output, one record per responding host. The
/// output is a JSON array but the closing bracket is missing when the
/// process is interrupted, so this parses line by line and skips anything
/// that doesn't look like a record.
pub fn parse_discoveries(output: &str) -> Vec<SocketAddrV4> {
    let mut found = Vec::new();

    for line in output.lines() {
        let line = line.trim().trim_end_matches(',');
        if line.is_empty() || line == "[" || line == "]" {
            continue;
        }
        let Ok(record) = serde_json::from_str::<DiscoveryRecord>(line) else {
            debug!(line, "skipping unparsable scanner output line");
            continue;
        };
        for port in &record.ports {
            if port.status.as_deref().is_none_or(|status| status == "open") {
                found.push(SocketAddrV4::new(record.ip, port.port));
            }
        }
    }

    found
}

/// Scans every range, up to `workers` ranges at a time, pushing each
/// discovery onto the queue. One range failing never stops the others.
pub async fn produce(
    scanner: Arc<RangeScanner>,
    ranges: Vec<Ipv4Range>,
    queue: Arc<ScanQueue>,
    workers: usize,
) {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(ranges.len());

    for range in ranges {
        let scanner = scanner.clone();
        let queue = queue.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            debug!(range = %range, "scanning range");
            match scanner.scan(&range).await {
                Ok(discoveries) => {
                    info!(range = %range, found = discoveries.len(), "range scanned");
                    queue.push_all(discoveries);
                }
                Err(err) => error!(range = %range, %err, "range scan failed"),
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}

/// How a popped target is turned into a report. Split out from the consumer
/// loop so the loop's delivery semantics can be tested without sockets.
pub trait Classify: Send + Sync {
    fn classify(
        &self,
        target: SocketAddrV4,
    ) -> impl std::future::Future<Output = ServerReport> + Send;
}

/// The real classifier: status query first, then the login engine unless
/// fast mode is on or the status query already failed.
pub struct Verifier<S> {
    pub protocol_version: i32,
    pub username: String,
    pub uuid: uuid::Uuid,
    pub timeout: Duration,
    /// Skip the login engine and classify from the status response alone.
    pub fast_mode: bool,
    pub credentials: Option<JoinCredentials>,
    pub services: S,
}

impl<S: SessionService + Send + Sync> Verifier<S> {
    async fn verify(&self, endpoint: Endpoint) -> ServerReport {
        let ping = match status::query(&endpoint, self.protocol_version, self.timeout).await {
            Ok(ping) => ping,
            Err(err) => {
                debug!(addr = %endpoint, %err, "status query failed");
                return ServerReport {
                    endpoint,
                    classification: classify_status_error(&err),
                    status: None,
                };
            }
        };

        if self.fast_mode {
            let classification = if ping.is_modded() {
                ServerClassification::Modded
            } else {
                ServerClassification::Unknown
            };
            return ServerReport {
                endpoint,
                classification,
                status: Some(ping.raw),
            };
        }

        // version-match the join so the server doesn't reject us for the
        // wrong protocol number
        let protocol_version = ping.protocol_version().unwrap_or(self.protocol_version);
        let request = JoinRequest {
            endpoint: endpoint.clone(),
            protocol_version,
            username: self.username.clone(),
            uuid: self.uuid,
            timeout: self.timeout,
        };
        let classification =
            match login::join(&request, self.credentials.as_ref(), &self.services).await {
                Ok(classification) => classification,
                Err(err) => {
                    debug!(addr = %endpoint, %err, "join failed");
                    login::classify_login_error(&err)
                }
            };

        ServerReport {
            endpoint,
            classification,
            status: Some(ping.raw),
        }
    }
}

impl<S: SessionService + Send + Sync> Classify for Verifier<S> {
    async fn classify(&self, target: SocketAddrV4) -> ServerReport {
        self.verify(Endpoint::new(target.ip().to_string(), target.port()))
            .await
    }
}

fn classify_status_error(err: &StatusError) -> ServerClassification {
    use crate::protocol::TransportError;
    match err {
        StatusError::Transport(
            TransportError::Timeout | TransportError::Refused | TransportError::Dns(_),
        ) => ServerClassification::Offline,
        _ => ServerClassification::Unknown,
    }
}

/// The consumer loop. Pops until the queue runs dry, sleeping `backoff`
/// between dry polls. Per-target failures are already folded into the
/// report by the classifier, so nothing here can kill the loop.
///
/// Shutdown is cooperative: once `shutdown` flips and the queue is empty
/// the loop returns, so an in-flight classification always reaches the
/// sink before the task ends.
pub async fn consume<C: Classify, R: ReportSink>(
    queue: Arc<ScanQueue>,
    classifier: C,
    sink: R,
    backoff: Duration,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(target) = queue.pop() else {
            if *shutdown.borrow() {
                return;
            }
            tokio::time::sleep(backoff).await;
            continue;
        };
        let report = classifier.classify(target).await;
        sink.submit(report);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::Ipv4Addr};

    use super::*;

    struct StubClassifier;

    impl Classify for StubClassifier {
        async fn classify(&self, target: SocketAddrV4) -> ServerReport {
            ServerReport {
                endpoint: Endpoint::new(target.ip().to_string(), target.port()),
                classification: ServerClassification::Unknown,
                status: None,
            }
        }
    }

    #[derive(Default)]
    struct CollectSink {
        reports: Mutex<Vec<ServerReport>>,
    }

    impl ReportSink for Arc<CollectSink> {
        fn submit(&self, report: ServerReport) {
            self.reports.lock().push(report);
        }
    }

    #[test]
    fn queue_is_fifo() {
        let queue = ScanQueue::new();
        let a = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 25565);
        let b = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 5), 25565);
        queue.push(a);
        queue.push(b);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), None);
    }

    #[tokio::test]
    async fn starved_consumer_processes_every_target_exactly_once() {
        let queue = Arc::new(ScanQueue::new());
        let sink = Arc::new(CollectSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // start the consumer against an empty queue so it hits the backoff
        // path before any work arrives
        let consumer = tokio::spawn(consume(
            queue.clone(),
            StubClassifier,
            sink.clone(),
            Duration::from_millis(5),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let targets: Vec<SocketAddrV4> = (0..1000u32)
            .map(|i| {
                SocketAddrV4::new(
                    Ipv4Addr::from(0x0a00_0000 + i),
                    25565 + (i % 4) as u16,
                )
            })
            .collect();
        queue.push_all(targets.iter().copied());

        // the consumer must drain the queue before honoring the shutdown
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), consumer)
            .await
            .unwrap()
            .unwrap();

        let reports = sink.reports.lock();
        assert_eq!(reports.len(), 1000);
        let unique: HashSet<(String, u16)> = reports
            .iter()
            .map(|report| (report.endpoint.host.clone(), report.endpoint.port))
            .collect();
        assert_eq!(unique.len(), 1000, "duplicate classification for a target");
        assert!(queue.is_empty());
    }

    struct SlowClassifier;

    impl Classify for SlowClassifier {
        async fn classify(&self, target: SocketAddrV4) -> ServerReport {
            tokio::time::sleep(Duration::from_millis(50)).await;
            StubClassifier.classify(target).await
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_classification() {
        let queue = Arc::new(ScanQueue::new());
        let sink = Arc::new(CollectSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        queue.push(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 25565));
        let consumer = tokio::spawn(consume(
            queue.clone(),
            SlowClassifier,
            sink.clone(),
            Duration::from_millis(5),
            shutdown_rx,
        ));

        // signal while the sole target is still being classified
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();

        // its report still made it to the sink
        assert_eq!(sink.reports.lock().len(), 1);
    }

    #[test]
    fn verifier_classification_can_run_on_any_worker() {
        fn requires_send(_: impl Send) {}

        let verifier = Verifier {
            protocol_version: 765,
            username: "Steve".to_string(),
            uuid: uuid::Uuid::nil(),
            timeout: Duration::from_secs(5),
            fast_mode: false,
            credentials: None,
            services: crate::auth::GameServices::new(),
        };
        requires_send(verifier.classify(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 25565)));
    }

    #[test]
    fn discovery_output_parsing() {
        let output = r#"[
{ "ip": "203.0.113.9", "timestamp": "1724800000", "ports": [ {"port": 25565, "proto": "tcp", "status": "open", "reason": "syn-ack", "ttl": 54} ] },
{ "ip": "203.0.113.10", "timestamp": "1724800001", "ports": [ {"port": 25566, "proto": "tcp", "status": "closed", "reason": "rst", "ttl": 54} ] },
{ "ip": "203.0.113.11", "timestamp": "1724800002", "ports": [ {"port": 25567, "proto": "tcp"} ] },
not json at all
"#;
        let found = parse_discoveries(output);
        assert_eq!(
            found,
            vec![
                SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 25565),
                SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 11), 25567),
            ]
        );
    }

    #[test]
    fn discovery_output_truncated_mid_run() {
        // interrupted scans leave the array unterminated
        let output = "[\n{ \"ip\": \"198.51.100.1\", \"ports\": [ {\"port\": 25565, \"status\": \"open\"} ] },\n";
        assert_eq!(parse_discoveries(output).len(), 1);
    }
}
