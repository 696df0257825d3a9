//! One DNS-probe round, end to end.
//!
//! The round owns all mutable state (counters, attach table, worker
//! registry, per-circuit records) in a single context object created per
//! round and dropped with it. Two tasks feed it concurrently: the control
//! event pump and the worker result drain. Completion is decided by the
//! tracker; whichever task flips the flag also tears down the stragglers.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::correlator::AttachTable;
use super::tracker::{CompletionTracker, RoundCounters};
use super::worker::{WorkerHandle, WorkerMessage, WorkerSet, WorkerSpec};
use super::{DomainTable, ProbeResult};
use crate::control::events::{CircuitEvent, CircuitStatus, ControlEvent, StreamEvent};
use crate::control::{CircuitId, ControlHandle, StreamId};

#[derive(Debug, Clone)]
pub struct RoundConfig {
    pub socks_addr: SocketAddr,
    /// Per-read deadline inside the workers.
    pub probe_timeout: Duration,
    /// Hard stop for the whole round; everything unreported by then fails
    /// closed.
    pub round_timeout: Duration,
    /// Delay between consecutive circuit-build requests.
    pub pacing: Duration,
}

/// What one round concluded.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    /// Verdicts from probes that ran (or were synthesized fail-closed).
    pub results: Vec<ProbeResult>,
    /// Exits whose circuit request the control channel rejected outright.
    pub rejected: Vec<String>,
    pub counters: RoundCounters,
}

impl RoundOutcome {
    /// Every fingerprint this round would report as DNS-failing, deduplicated.
    pub fn failing_fingerprints(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut failing = Vec::new();
        let rejected = self.rejected.iter().cloned();
        let dishonest = self
            .results
            .iter()
            .filter(|result| !result.honest)
            .map(|result| result.fingerprint.clone());
        for fingerprint in rejected.chain(dishonest) {
            if seen.insert(fingerprint.clone()) {
                failing.push(fingerprint);
            }
        }
        failing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Requested,
    Built,
    ProbeLaunched,
    ProbeReported,
    Failed,
}

struct CircuitRecord {
    fingerprint: String,
    state: CircuitState,
}

struct RoundContext {
    ctl: ControlHandle,
    socks_addr: SocketAddr,
    probe_timeout: Duration,
    domains: Arc<DomainTable>,
    targets: HashSet<String>,
    tracker: CompletionTracker,
    attach: AttachTable,
    workers: WorkerSet,
    circuits: Mutex<HashMap<CircuitId, CircuitRecord>>,
    results: Mutex<Vec<ProbeResult>>,
    rejected: Mutex<Vec<String>>,
    results_tx: mpsc::Sender<WorkerMessage>,
}

impl RoundContext {
    async fn handle_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::Circuit(circuit) => self.handle_circuit_event(circuit).await,
            ControlEvent::Stream(stream) => self.handle_stream_event(stream).await,
            ControlEvent::Other(_) => {}
        }
    }

    async fn handle_circuit_event(&self, event: CircuitEvent) {
        match event.status {
            CircuitStatus::Failed => {
                if !self.transition(&event, CircuitState::Failed) {
                    return;
                }
                if self.tracker.record_failed() {
                    self.finish();
                }
            }
            CircuitStatus::Built => {
                if !self.transition(&event, CircuitState::Built) {
                    return;
                }
                if self.tracker.record_built() {
                    // The predicate already holds; launching a probe into a
                    // finished round would only create an orphan.
                    self.finish();
                    return;
                }
                self.launch_probe(&event.id).await;
            }
            _ => {}
        }
    }

    /// Move a requested circuit to `next`. An event for a circuit id we have
    /// not mapped yet may still be ours: the build reply can lose the race
    /// against its own BUILT event, so unknown circuits are attributed by
    /// the exit hop named in the event path.
    fn transition(&self, event: &CircuitEvent, next: CircuitState) -> bool {
        let mut circuits = self.circuits.lock().unwrap();
        match circuits.get_mut(&event.id) {
            Some(record) => {
                if record.state != CircuitState::Requested {
                    return false;
                }
                record.state = next;
                true
            }
            None => {
                let Some(exit) = event.exit_fingerprint() else { return false };
                if !self.targets.contains(exit)
                    || circuits.values().any(|record| record.fingerprint == exit)
                {
                    return false;
                }
                circuits.insert(
                    event.id.clone(),
                    CircuitRecord { fingerprint: exit.to_string(), state: next },
                );
                true
            }
        }
    }

    /// Circuit built: verify we can still see the exit's descriptor, then
    /// hand the circuit to an isolated worker.
    async fn launch_probe(&self, circuit: &CircuitId) {
        let Some(fingerprint) = self.circuit_fingerprint(circuit) else { return };
        tracing::debug!("circuit for exit relay {fingerprint} is built, invoking probe");

        if let Err(err) = self.ctl.get_server_descriptor(&fingerprint).await {
            tracing::warn!(
                "descriptor for {fingerprint} unavailable ({err}), failing closed"
            );
            self.close_circuit(circuit).await;
            self.synthesize_verdict(circuit, &fingerprint).await;
            return;
        }

        let spec = WorkerSpec {
            circuit: circuit.clone(),
            fingerprint: fingerprint.clone(),
            socks_addr: self.socks_addr,
            timeout_secs: self.probe_timeout.as_secs(),
            domains: (*self.domains).clone(),
        };

        match WorkerHandle::spawn(&spec, self.results_tx.clone()) {
            Ok(handle) => {
                self.workers.register(handle);
                if let Some(record) = self.circuits.lock().unwrap().get_mut(circuit) {
                    record.state = CircuitState::ProbeLaunched;
                }
            }
            Err(err) => {
                tracing::error!("failed to spawn probe worker for {fingerprint}: {err}");
                self.close_circuit(circuit).await;
                self.synthesize_verdict(circuit, &fingerprint).await;
            }
        }
    }

    async fn handle_stream_event(&self, event: StreamEvent) {
        if !event.status.needs_attach() {
            return;
        }

        let Some(port) = event.source_port() else {
            tracing::warn!(
                "couldn't extract source port from stream event {} ({:?})",
                event.id,
                event.source_addr
            );
            return;
        };

        tracing::debug!("adding attacher for new stream {} to {}", event.id, event.target);
        if let Some((stream, circuit)) = self.attach.stream_side(port, event.id.clone()) {
            self.attach_stream(stream, circuit).await;
        }
    }

    async fn handle_worker_message(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::SourcePort { circuit, port } => {
                tracing::debug!("worker for circuit {circuit} published source port {port}");
                if let Some((stream, circuit)) = self.attach.circuit_side(port, circuit) {
                    self.attach_stream(stream, circuit).await;
                }
            }
            WorkerMessage::Verdict { circuit, fingerprint, honest } => {
                if !self.mark_reported(&circuit) {
                    return;
                }
                self.results.lock().unwrap().push(ProbeResult {
                    circuit: circuit.clone(),
                    fingerprint,
                    honest,
                });
                tracing::debug!("closing finished circuit {circuit}");
                self.close_circuit(&circuit).await;
                if self.tracker.record_stream_finished() {
                    self.finish();
                }
            }
        }
    }

    /// Attach failures are logged and swallowed: an unattached stream means
    /// the worker times out, which is fail-closed anyway.
    async fn attach_stream(&self, stream: StreamId, circuit: CircuitId) {
        tracing::debug!("attaching stream {stream} to circuit {circuit}");
        if let Err(err) = self.ctl.attach_stream(&stream, &circuit).await {
            tracing::warn!("failed to attach stream because: {err}");
        }
    }

    /// Record a fail-closed verdict on behalf of a worker that will never
    /// run. Counts as the circuit's finished stream so the round can end.
    async fn synthesize_verdict(&self, circuit: &CircuitId, fingerprint: &str) {
        if !self.mark_reported(circuit) {
            return;
        }
        self.results.lock().unwrap().push(ProbeResult {
            circuit: circuit.clone(),
            fingerprint: fingerprint.to_string(),
            honest: false,
        });
        if self.tracker.record_stream_finished() {
            self.finish();
        }
    }

    /// Flip a circuit to ProbeReported; false means a verdict was already
    /// recorded and this one is a duplicate.
    fn mark_reported(&self, circuit: &CircuitId) -> bool {
        let mut circuits = self.circuits.lock().unwrap();
        match circuits.get_mut(circuit) {
            Some(record) if record.state == CircuitState::ProbeReported => {
                tracing::warn!("duplicate verdict for circuit {circuit}, ignoring");
                false
            }
            Some(record) => {
                record.state = CircuitState::ProbeReported;
                true
            }
            None => {
                tracing::warn!("verdict for unknown circuit {circuit}, ignoring");
                false
            }
        }
    }

    fn circuit_fingerprint(&self, circuit: &CircuitId) -> Option<String> {
        self.circuits.lock().unwrap().get(circuit).map(|record| record.fingerprint.clone())
    }

    async fn close_circuit(&self, circuit: &CircuitId) {
        if let Err(err) = self.ctl.close_circuit(circuit).await {
            tracing::debug!("could not close circuit {circuit} because: {err}");
        }
    }

    /// Request one circuit per target, a random first hop ahead of each
    /// exit, paced so the control channel isn't flooded.
    async fn request_circuits(
        self: Arc<Self>,
        targets: Vec<String>,
        first_hops: Vec<String>,
        pacing: Duration,
    ) {
        for fingerprint in targets {
            let first = {
                let candidates: Vec<&String> =
                    first_hops.iter().filter(|hop| **hop != fingerprint).collect();
                candidates.choose(&mut rand::thread_rng()).map(|hop| (*hop).clone())
            };

            let Some(first) = first else {
                tracing::warn!("no first-hop candidate available for {fingerprint}");
                self.reject(fingerprint);
                continue;
            };

            tracing::debug!("using random first hop {first} for circuit to {fingerprint}");
            match self.ctl.new_circuit(&[first, fingerprint.clone()]).await {
                Ok(id) => {
                    // The BUILT event may have raced us here and registered
                    // the circuit already; never clobber its state.
                    self.circuits
                        .lock()
                        .unwrap()
                        .entry(id)
                        .or_insert(CircuitRecord { fingerprint, state: CircuitState::Requested });
                }
                Err(err) => {
                    tracing::warn!("circuit request for {fingerprint} rejected: {err}");
                    self.reject(fingerprint);
                }
            }

            tokio::time::sleep(pacing).await;
        }
    }

    /// A circuit that could not even be requested counts as failed and the
    /// exit is reported, matching how a rejected build request has always
    /// been treated.
    fn reject(&self, fingerprint: String) {
        self.rejected.lock().unwrap().push(fingerprint);
        if self.tracker.record_failed() {
            self.finish();
        }
    }

    /// Runs exactly once, by whichever update completed the round.
    fn finish(&self) {
        let counters = self.tracker.counters();
        tracing::info!(
            "probe round complete (total={}, built={}, failed={}, finished_streams={})",
            counters.total,
            counters.built,
            counters.failed,
            counters.finished_streams
        );
        self.workers.terminate_all();
    }
}

pub struct ProbeRound<'a> {
    pub ctl: &'a ControlHandle,
    pub config: &'a RoundConfig,
    pub domains: &'a DomainTable,
}

impl ProbeRound<'_> {
    /// Probe every target exit once and collect the verdicts.
    ///
    /// `first_hops` are candidate entry relays; `events` is the control
    /// connection's event feed (the round subscribes and unsubscribes
    /// itself).
    pub async fn run(
        &self,
        targets: &[String],
        first_hops: &[String],
        events: &mut mpsc::Receiver<ControlEvent>,
    ) -> anyhow::Result<RoundOutcome> {
        if targets.is_empty() {
            return Ok(RoundOutcome::default());
        }

        let round_id = Uuid::new_v4();
        tracing::info!(%round_id, "starting DNS probe round over {} exits", targets.len());

        let (results_tx, results_rx) = mpsc::channel(64);
        let (tracker, mut done_rx) = CompletionTracker::new(targets.len() as u32);

        let context = Arc::new(RoundContext {
            ctl: self.ctl.clone(),
            socks_addr: self.config.socks_addr,
            probe_timeout: self.config.probe_timeout,
            domains: Arc::new(self.domains.clone()),
            targets: targets.iter().cloned().collect(),
            tracker,
            attach: AttachTable::default(),
            workers: WorkerSet::default(),
            circuits: Mutex::new(HashMap::new()),
            results: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            results_tx,
        });

        self.ctl.set_events(&["CIRC", "STREAM"]).await?;

        let drain = tokio::spawn(drain_results(context.clone(), results_rx, done_rx.clone()));

        let requester = tokio::spawn(context.clone().request_circuits(
            targets.to_vec(),
            first_hops.to_vec(),
            self.config.pacing,
        ));

        let deadline = tokio::time::sleep(self.config.round_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = done_rx.changed() => break,
                _ = &mut deadline => {
                    tracing::warn!(%round_id, "probe round deadline reached, forcing completion");
                    if context.tracker.force_finish() {
                        context.finish();
                    }
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => context.handle_event(event).await,
                    None => {
                        tracing::warn!(%round_id, "control event feed closed mid-round");
                        if context.tracker.force_finish() {
                            context.finish();
                        }
                        break;
                    }
                }
            }
        }

        requester.abort();
        if let Err(err) = self.ctl.set_events(&[]).await {
            tracing::debug!("could not clear event subscription: {err}");
        }
        context.workers.terminate_all();
        let _ = drain.await;

        // Fail-closed sweep: every circuit whose probe never reported gets a
        // false verdict, and whatever is still open gets closed.
        let unreported: Vec<(CircuitId, String)> = {
            let circuits = context.circuits.lock().unwrap();
            circuits
                .iter()
                .filter(|(_, record)| {
                    matches!(
                        record.state,
                        CircuitState::Built | CircuitState::ProbeLaunched
                    )
                })
                .map(|(id, record)| (id.clone(), record.fingerprint.clone()))
                .collect()
        };
        let open: Vec<CircuitId> = {
            let circuits = context.circuits.lock().unwrap();
            circuits
                .iter()
                .filter(|(_, record)| {
                    matches!(
                        record.state,
                        CircuitState::Requested
                            | CircuitState::Built
                            | CircuitState::ProbeLaunched
                    )
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut results = std::mem::take(&mut *context.results.lock().unwrap());
        for (circuit, fingerprint) in unreported {
            tracing::info!(
                "no verdict from probe of {fingerprint} (circuit {circuit}), failing closed"
            );
            results.push(ProbeResult { circuit, fingerprint, honest: false });
        }
        for circuit in open {
            context.close_circuit(&circuit).await;
        }

        let outcome = RoundOutcome {
            results,
            rejected: std::mem::take(&mut *context.rejected.lock().unwrap()),
            counters: context.tracker.counters(),
        };
        tracing::info!(
            %round_id,
            "round finished: {} verdicts, {} rejected, {} failing",
            outcome.results.len(),
            outcome.rejected.len(),
            outcome.failing_fingerprints().len()
        );
        Ok(outcome)
    }
}

/// Drains the worker result queue independently of the event pump, so a
/// burst of verdicts can't back up behind slow attach commands and vice
/// versa.
async fn drain_results(
    context: Arc<RoundContext>,
    mut results_rx: mpsc::Receiver<WorkerMessage>,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = results_rx.recv() => match message {
                Some(message) => context.handle_worker_message(message).await,
                None => return,
            },
            _ = done_rx.changed() => break,
        }
    }
    // The round is over but verdicts already in the queue are still real;
    // drain them so a finished probe isn't misreported as silent.
    while let Ok(message) = results_rx.try_recv() {
        context.handle_worker_message(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Auth, ControlConnection};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config() -> RoundConfig {
        RoundConfig {
            socks_addr: "127.0.0.1:9052".parse().unwrap(),
            probe_timeout: Duration::from_secs(1),
            round_timeout: Duration::from_secs(5),
            pacing: Duration::from_millis(1),
        }
    }

    fn domains() -> DomainTable {
        DomainTable::from([("example.com".to_string(), vec!["93.184.216.34".to_string()])])
    }

    /// Control server that rejects every circuit request.
    async fn rejecting_control_server() -> SocketAddr {
        scripted_control_server(|line, _next_circuit| {
            if line.starts_with("EXTENDCIRC") {
                "552 No such router\r\n".to_string()
            } else {
                "250 OK\r\n".to_string()
            }
        })
        .await
    }

    /// Control server that builds every circuit but has no descriptors, so
    /// every built circuit fails closed without a worker.
    async fn descriptorless_control_server() -> SocketAddr {
        scripted_control_server(|line, next_circuit| {
            if let Some(hops) = line.strip_prefix("EXTENDCIRC 0 ") {
                let id = next_circuit;
                let path = hops
                    .split(',')
                    .map(|hop| format!("${hop}~relay"))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("250 EXTENDED {id}\r\n650 CIRC {id} BUILT {path}\r\n")
            } else if line.starts_with("GETINFO desc/id/") {
                "552 Unrecognized key\r\n".to_string()
            } else {
                "250 OK\r\n".to_string()
            }
        })
        .await
    }

    async fn scripted_control_server(
        respond: impl Fn(&str, u32) -> String + Send + 'static,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = String::new();
            let mut circuits = 0u32;
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                received.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(idx) = received.find("\r\n") {
                    let line: String = received.drain(..idx + 2).take(idx).collect();
                    if line.starts_with("EXTENDCIRC") {
                        circuits += 1;
                    }
                    let response = respond(&line, circuits);
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn empty_target_list_is_a_noop() {
        let addr = rejecting_control_server().await;
        let (ctl, mut events) = ControlConnection::connect(addr, &Auth::None, 16).await.unwrap();
        let cfg = config();
        let table = domains();
        let round = ProbeRound { ctl: &ctl, config: &cfg, domains: &table };

        let outcome = round.run(&[], &[], &mut events).await.unwrap();
        assert!(outcome.results.is_empty());
        assert!(outcome.rejected.is_empty());
    }

    #[tokio::test]
    async fn rejected_requests_complete_the_round_and_fail_closed() {
        let addr = rejecting_control_server().await;
        let (ctl, mut events) = ControlConnection::connect(addr, &Auth::None, 16).await.unwrap();
        let cfg = config();
        let table = domains();
        let round = ProbeRound { ctl: &ctl, config: &cfg, domains: &table };

        let targets = vec!["C".repeat(40), "D".repeat(40)];
        let hops = vec!["E".repeat(40)];
        let outcome = round.run(&targets, &hops, &mut events).await.unwrap();

        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(outcome.counters.failed, 2);
        assert_eq!(outcome.counters.total, 2);
        let failing = outcome.failing_fingerprints();
        assert!(failing.contains(&targets[0]));
        assert!(failing.contains(&targets[1]));
    }

    #[tokio::test]
    async fn missing_descriptor_synthesizes_failed_verdict() {
        let addr = descriptorless_control_server().await;
        let (ctl, mut events) = ControlConnection::connect(addr, &Auth::None, 16).await.unwrap();
        let cfg = config();
        let table = domains();
        let round = ProbeRound { ctl: &ctl, config: &cfg, domains: &table };

        let targets = vec!["C".repeat(40)];
        let hops = vec!["E".repeat(40)];
        let outcome = round.run(&targets, &hops, &mut events).await.unwrap();

        assert_eq!(outcome.counters.built, 1);
        assert_eq!(outcome.counters.finished_streams, 1);
        assert_eq!(outcome.results.len(), 1);
        assert!(!outcome.results[0].honest);
        assert_eq!(outcome.failing_fingerprints(), targets);
    }

    #[test]
    fn failing_fingerprints_deduplicate_and_keep_order() {
        let outcome = RoundOutcome {
            results: vec![
                ProbeResult {
                    circuit: CircuitId("1".into()),
                    fingerprint: "BBB".into(),
                    honest: false,
                },
                ProbeResult {
                    circuit: CircuitId("2".into()),
                    fingerprint: "CCC".into(),
                    honest: true,
                },
                ProbeResult {
                    circuit: CircuitId("3".into()),
                    fingerprint: "BBB".into(),
                    honest: false,
                },
            ],
            rejected: vec!["AAA".into(), "BBB".into()],
            counters: RoundCounters::default(),
        };

        assert_eq!(outcome.failing_fingerprints(), vec!["AAA".to_string(), "BBB".to_string()]);
    }
}
