//! Probe workers: one OS process per circuit.
//!
//! A hung SOCKS negotiation over a hostile exit must never stall the event
//! loop or the other probes, so each probe runs in a child process that can
//! be killed at any point. The child reads its job spec as JSON on stdin
//! and speaks newline-delimited JSON on stdout: source-port publications
//! while it opens connections, then exactly one verdict. It never touches
//! the coordinator's shared state directly.

use std::io::Write;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::socks::{DEFAULT_TIMEOUT, ProbeSocket};
use super::{DomainTable, ProbeError};
use crate::control::CircuitId;

/// Everything a worker process needs to run one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub circuit: CircuitId,
    pub fingerprint: String,
    pub socks_addr: SocketAddr,
    pub timeout_secs: u64,
    pub domains: DomainTable,
}

/// Messages a worker sends up to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Published after every TCP connect, before any SOCKS bytes: the only
    /// signal that lets the correlator pair a stream event with a circuit.
    SourcePort { circuit: CircuitId, port: u16 },
    /// The single verdict, always the worker's last word.
    Verdict { circuit: CircuitId, fingerprint: String, honest: bool },
}

fn emit(message: &WorkerMessage) {
    if let Ok(encoded) = serde_json::to_string(message) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{encoded}");
        let _ = stdout.flush();
    }
}

/// Entry point of the `probe-worker` subcommand, inside the child process.
///
/// Whatever happens during probing, a verdict goes out before the process
/// exits; every error path collapses to `honest = false`.
pub async fn worker_main() -> anyhow::Result<()> {
    let mut raw = String::new();
    tokio::io::stdin().read_to_string(&mut raw).await?;
    let spec: WorkerSpec = serde_json::from_str(raw.trim())?;

    let honest = match probe_circuit(&spec).await {
        Ok(honest) => honest,
        Err(err) => {
            tracing::info!(circuit = %spec.circuit, "probe failed: {err}");
            false
        }
    };

    emit(&WorkerMessage::Verdict {
        circuit: spec.circuit.clone(),
        fingerprint: spec.fingerprint.clone(),
        honest,
    });
    Ok(())
}

/// Resolve every reference domain through the circuit, one connection per
/// domain. The first deviation ends the probe; there is nothing a later
/// domain could add to a `false` verdict.
async fn probe_circuit(spec: &WorkerSpec) -> Result<bool, ProbeError> {
    let deadline = match spec.timeout_secs {
        0 => DEFAULT_TIMEOUT,
        secs => Duration::from_secs(secs),
    };

    for (domain, expected) in &spec.domains {
        let mut socket = ProbeSocket::connect(spec.socks_addr, deadline).await?;
        emit(&WorkerMessage::SourcePort {
            circuit: spec.circuit.clone(),
            port: socket.local_port()?,
        });
        socket.negotiate().await?;

        let resolved = socket.resolve(domain).await?;

        if !expected.contains(&resolved) {
            tracing::info!(
                circuit = %spec.circuit,
                "exit returned unexpected address {resolved} for {domain}"
            );
            return Ok(false);
        }
        tracing::debug!(circuit = %spec.circuit, "address of {domain} as expected");
    }

    Ok(true)
}

/// Parent-side handle to a running worker process.
pub struct WorkerHandle {
    pub circuit: CircuitId,
    child: Child,
}

impl WorkerHandle {
    /// Spawn the worker as a child of the current executable and wire its
    /// stdout into the shared result queue.
    pub fn spawn(
        spec: &WorkerSpec,
        results: mpsc::Sender<WorkerMessage>,
    ) -> anyhow::Result<Self> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg("probe-worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let payload = serde_json::to_string(spec)?;
        let mut stdin =
            child.stdin.take().ok_or_else(|| anyhow::anyhow!("worker stdin not piped"))?;
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                tracing::warn!("failed to hand spec to probe worker: {err}");
            }
            // Dropping stdin closes it; the worker reads to EOF.
        });

        let stdout =
            child.stdout.take().ok_or_else(|| anyhow::anyhow!("worker stdout not piped"))?;
        let circuit = spec.circuit.clone();
        let reader_circuit = circuit.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(message) => {
                            if results.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                circuit = %reader_circuit,
                                "unparsable worker output {line:?}: {err}"
                            );
                        }
                    },
                    Ok(None) | Err(_) => break,
                }
            }
        });

        Ok(Self { circuit, child })
    }

    /// Ask the OS to kill the process; no cooperation required.
    pub fn terminate(&mut self) {
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(circuit = %self.circuit, "could not terminate worker: {err}");
        }
    }
}

/// Registry of the round's live workers, so completion can tear down
/// stragglers.
#[derive(Default)]
pub struct WorkerSet {
    workers: std::sync::Mutex<Vec<WorkerHandle>>,
}

impl WorkerSet {
    pub fn register(&self, handle: WorkerHandle) {
        self.workers.lock().unwrap().push(handle);
    }

    pub fn terminate_all(&self) {
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.iter_mut() {
            tracing::debug!(circuit = %worker.circuit, "terminating remaining probe worker");
            worker.terminate();
        }
        workers.clear();
    }

    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    fn spec() -> WorkerSpec {
        WorkerSpec {
            circuit: CircuitId("12".into()),
            fingerprint: "A".repeat(40),
            socks_addr: "127.0.0.1:9052".parse().unwrap(),
            timeout_secs: 10,
            domains: DomainTable::from([(
                "example.com".to_string(),
                vec!["93.184.216.34".to_string()],
            )]),
        }
    }

    #[test]
    fn worker_messages_roundtrip_as_json_lines() {
        let port = WorkerMessage::SourcePort { circuit: CircuitId("12".into()), port: 51000 };
        let encoded = serde_json::to_string(&port).unwrap();
        assert!(encoded.contains("\"source_port\""));
        let decoded: WorkerMessage = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, WorkerMessage::SourcePort { port: 51000, .. }));

        let verdict = WorkerMessage::Verdict {
            circuit: CircuitId("12".into()),
            fingerprint: "A".repeat(40),
            honest: false,
        };
        let encoded = serde_json::to_string(&verdict).unwrap();
        let decoded: WorkerMessage = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, WorkerMessage::Verdict { honest: false, .. }));
    }

    #[test]
    fn worker_spec_roundtrips() {
        let spec = spec();
        let encoded = serde_json::to_string(&spec).unwrap();
        let decoded: WorkerSpec = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.circuit, spec.circuit);
        assert_eq!(decoded.domains, spec.domains);
    }

    fn ipv4_reply(octets: [u8; 4]) -> Vec<u8> {
        let mut reply = vec![0x05, 0x00, 0x00, 0x01];
        reply.extend_from_slice(&octets);
        reply.extend_from_slice(&0u16.to_be_bytes());
        reply
    }

    /// Serves one greeting + resolve exchange per queued reply, one
    /// connection each, in order.
    async fn mock_resolving_proxy(replies: Vec<Vec<u8>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();

                let mut greeting = [0u8; 3];
                stream.read_exact(&mut greeting).await.unwrap();
                stream.write_all(&[0x05, 0x00]).await.unwrap();

                let mut head = [0u8; 5];
                stream.read_exact(&mut head).await.unwrap();
                let mut rest = vec![0u8; head[4] as usize + 2];
                stream.read_exact(&mut rest).await.unwrap();

                stream.write_all(&reply).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_passes_when_every_domain_matches() {
        let addr = mock_resolving_proxy(vec![ipv4_reply([93, 184, 216, 34])]).await;
        let mut matching = spec();
        matching.socks_addr = addr;

        assert!(probe_circuit(&matching).await.unwrap());
    }

    #[tokio::test]
    async fn unexpected_address_fails_the_probe_early() {
        // Only one reply is queued: a second connection would hang the
        // probe, so Ok(false) also proves the remaining domains are skipped.
        let addr = mock_resolving_proxy(vec![ipv4_reply([10, 0, 0, 1])]).await;
        let mut poisoned = spec();
        poisoned.socks_addr = addr;
        poisoned.timeout_secs = 1;
        poisoned
            .domains
            .insert("second.example".to_string(), vec!["198.51.100.7".to_string()]);

        assert!(!probe_circuit(&poisoned).await.unwrap());
    }

    #[tokio::test]
    async fn socks_failure_code_aborts_the_probe() {
        let mut refused = vec![0x05, 0x05, 0x00, 0x01];
        refused.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        let addr = mock_resolving_proxy(vec![refused]).await;
        let mut unresolvable = spec();
        unresolvable.socks_addr = addr;

        let err = probe_circuit(&unresolvable).await.unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Socks(crate::probe::socks::SocksReply::ConnectionRefused)
        ));
    }

    #[tokio::test]
    async fn probe_fails_closed_when_proxy_is_unreachable() {
        // Nothing listens on this port; connect either refuses or times out,
        // and both must fold into an error (verdict false upstream).
        let mut unreachable = spec();
        unreachable.socks_addr = "127.0.0.1:1".parse().unwrap();
        unreachable.timeout_secs = 1;

        let result = probe_circuit(&unreachable).await;
        assert!(result.is_err());
    }
}
