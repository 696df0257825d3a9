use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};

use super::events::{self, ControlEvent};
use super::{CircuitId, ControlError, StreamId};

/// How the control port wants us to authenticate.
#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Password(String),
    CookieFile(PathBuf),
}

impl Auth {
    fn command(&self) -> Result<String, ControlError> {
        match self {
            Auth::None => Ok("AUTHENTICATE".to_string()),
            Auth::Password(password) => {
                let escaped = password.replace('\\', "\\\\").replace('"', "\\\"");
                Ok(format!("AUTHENTICATE \"{escaped}\""))
            }
            Auth::CookieFile(path) => {
                let cookie = std::fs::read(path)?;
                Ok(format!("AUTHENTICATE {}", hex::encode(cookie)))
            }
        }
    }
}

/// A complete command reply: final status plus every content line seen,
/// including the payloads of data blocks.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub lines: Vec<String>,
}

struct PendingCommand {
    line: String,
    reply: oneshot::Sender<Result<Reply, ControlError>>,
}

/// Cloneable handle for issuing control commands from any task.
#[derive(Clone)]
pub struct ControlHandle {
    cmd_tx: mpsc::Sender<PendingCommand>,
}

pub struct ControlConnection;

impl ControlConnection {
    /// Connect, authenticate and start the demultiplexing task.
    ///
    /// Returns a command handle plus the receiving end of the bounded event
    /// channel. Events arriving while the channel is full are dropped with a
    /// warning rather than stalling the reader.
    pub async fn connect(
        addr: SocketAddr,
        auth: &Auth,
        event_capacity: usize,
    ) -> Result<(ControlHandle, mpsc::Receiver<ControlEvent>), ControlError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(event_capacity);

        tokio::spawn(run_io(read_half, write_half, cmd_rx, event_tx));

        let handle = ControlHandle { cmd_tx };
        match handle.raw_command(auth.command()?).await {
            Ok(_) => {}
            Err(ControlError::CommandFailed { message, .. }) => {
                return Err(ControlError::AuthRejected(message));
            }
            Err(other) => return Err(other),
        }

        Ok((handle, event_rx))
    }
}

impl ControlHandle {
    async fn raw_command(&self, line: String) -> Result<Reply, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(PendingCommand { line, reply: tx })
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)?
    }

    /// Subscribe to the given asynchronous event kinds; an empty slice
    /// unsubscribes from everything.
    pub async fn set_events(&self, kinds: &[&str]) -> Result<(), ControlError> {
        let line = if kinds.is_empty() {
            "SETEVENTS".to_string()
        } else {
            format!("SETEVENTS {}", kinds.join(" "))
        };
        self.raw_command(line).await.map(|_| ())
    }

    /// Request a circuit through the given hops; returns its handle.
    pub async fn new_circuit(&self, hops: &[String]) -> Result<CircuitId, ControlError> {
        let reply = self.raw_command(format!("EXTENDCIRC 0 {}", hops.join(","))).await?;
        for line in &reply.lines {
            if let Some(rest) = line.strip_prefix("EXTENDED ") {
                return Ok(CircuitId(rest.trim().to_string()));
            }
        }
        Err(ControlError::Protocol("EXTENDCIRC reply carried no circuit id".into()))
    }

    pub async fn close_circuit(&self, circuit: &CircuitId) -> Result<(), ControlError> {
        self.raw_command(format!("CLOSECIRCUIT {circuit}")).await.map(|_| ())
    }

    pub async fn attach_stream(
        &self,
        stream: &StreamId,
        circuit: &CircuitId,
    ) -> Result<(), ControlError> {
        self.raw_command(format!("ATTACHSTREAM {stream} {circuit}")).await.map(|_| ())
    }

    /// Fetch a single GETINFO key, resolving both the one-line and the
    /// data-block reply forms to the bare value.
    pub async fn get_info(&self, key: &str) -> Result<String, ControlError> {
        let reply = self.raw_command(format!("GETINFO {key}")).await?;
        let prefix = format!("{key}=");

        for (index, line) in reply.lines.iter().enumerate() {
            let Some(value) = line.strip_prefix(&prefix) else { continue };
            if !value.is_empty() {
                return Ok(value.to_string());
            }
            // Data-block form: the value is every following line up to the
            // final status line.
            let end = reply.lines.len().saturating_sub(1);
            return Ok(reply.lines[index + 1..end].join("\n"));
        }

        Err(ControlError::Protocol(format!("GETINFO reply missing key {key}")))
    }

    /// The server descriptor for a relay, if the control channel has one.
    pub async fn get_server_descriptor(&self, fingerprint: &str) -> Result<String, ControlError> {
        self.get_info(&format!("desc/id/{fingerprint}")).await
    }
}

enum LineOutcome {
    Continue,
    ConnectionDone,
}

struct ReplyAccumulator {
    lines: Vec<String>,
    in_data_block: bool,
    discarding_event_block: bool,
}

impl ReplyAccumulator {
    fn new() -> Self {
        Self { lines: Vec::new(), in_data_block: false, discarding_event_block: false }
    }
}

async fn run_io(
    read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<PendingCommand>,
    event_tx: mpsc::Sender<ControlEvent>,
) {
    let mut reader: Lines<BufReader<OwnedReadHalf>> = BufReader::new(read_half).lines();
    let mut pending: VecDeque<oneshot::Sender<Result<Reply, ControlError>>> = VecDeque::new();
    let mut accumulator = ReplyAccumulator::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let frame = format!("{}\r\n", cmd.line);
                if let Err(err) = write_half.write_all(frame.as_bytes()).await {
                    let _ = cmd.reply.send(Err(ControlError::Io(err)));
                    break;
                }
                pending.push_back(cmd.reply);
            }
            line = reader.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        match handle_line(&line, &mut accumulator, &mut pending, &event_tx) {
                            LineOutcome::Continue => {}
                            LineOutcome::ConnectionDone => break,
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }

    for reply in pending {
        let _ = reply.send(Err(ControlError::Closed));
    }
}

fn handle_line(
    line: &str,
    accumulator: &mut ReplyAccumulator,
    pending: &mut VecDeque<oneshot::Sender<Result<Reply, ControlError>>>,
    event_tx: &mpsc::Sender<ControlEvent>,
) -> LineOutcome {
    if accumulator.discarding_event_block {
        if line == "." {
            accumulator.discarding_event_block = false;
        }
        return LineOutcome::Continue;
    }

    if accumulator.in_data_block {
        if line == "." {
            accumulator.in_data_block = false;
        } else {
            accumulator.lines.push(line.to_string());
        }
        return LineOutcome::Continue;
    }

    if line.len() < 4 {
        tracing::warn!("short control line: {line:?}");
        return LineOutcome::Continue;
    }

    let (code, rest) = line.split_at(3);
    let Ok(status) = code.parse::<u16>() else {
        tracing::warn!("unparsable control status in line: {line:?}");
        return LineOutcome::Continue;
    };
    let separator = rest.as_bytes()[0];
    let payload = &rest[1..];

    if status == 650 {
        match separator {
            b'+' => accumulator.discarding_event_block = true,
            b' ' | b'-' => {
                if let Some(event) = events::parse(payload) {
                    match event_tx.try_send(event) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!("event channel full, dropping event: {payload}");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
            _ => tracing::warn!("unexpected event separator in line: {line:?}"),
        }
        return LineOutcome::Continue;
    }

    match separator {
        b'-' => {
            accumulator.lines.push(payload.to_string());
        }
        b'+' => {
            accumulator.lines.push(payload.to_string());
            accumulator.in_data_block = true;
        }
        b' ' => {
            accumulator.lines.push(payload.to_string());
            let lines = std::mem::take(&mut accumulator.lines);
            let result = if (200..300).contains(&status) {
                Ok(Reply { status, lines })
            } else {
                Err(ControlError::CommandFailed { status, message: payload.to_string() })
            };
            match pending.pop_front() {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    tracing::warn!("unsolicited control reply: {line:?}");
                }
            }
        }
        _ => {
            tracing::warn!("malformed control line: {line:?}");
            return LineOutcome::ConnectionDone;
        }
    }

    LineOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Scripted control server: authenticates anything, answers a handful of
    /// commands, and pushes one async event right after SETEVENTS.
    async fn mock_control_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = String::new();
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                received.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(idx) = received.find("\r\n") {
                    let line: String = received.drain(..idx + 2).take(idx).collect();
                    let response: String = if line.starts_with("AUTHENTICATE") {
                        "250 OK\r\n".into()
                    } else if line.starts_with("SETEVENTS") {
                        "250 OK\r\n650 CIRC 7 BUILT $AAAA~first,$BBBB~exit\r\n".into()
                    } else if line.starts_with("EXTENDCIRC") {
                        "250 EXTENDED 7\r\n".into()
                    } else if line.starts_with("GETINFO ns/all") {
                        "250+ns/all=\r\nr moria1 base64id base64dig 2038-01-01 00:00:00 1.2.3.4 9001 9030\r\ns Exit Fast Running Stable\r\n.\r\n250 OK\r\n".into()
                    } else if line.starts_with("GETINFO version") {
                        "250-version=0.4.8.12\r\n250 OK\r\n".into()
                    } else if line.starts_with("GETINFO desc/id/") {
                        "552 Unrecognized key\r\n".into()
                    } else {
                        "250 OK\r\n".into()
                    };
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn authenticate_and_issue_commands() {
        let addr = mock_control_server().await;
        let (handle, mut events) =
            ControlConnection::connect(addr, &Auth::Password("secret".into()), 16).await.unwrap();

        handle.set_events(&["CIRC", "STREAM"]).await.unwrap();

        // The async event interleaved with the SETEVENTS reply must arrive
        // on the event channel, not as a command reply.
        let event = events.recv().await.unwrap();
        match event {
            ControlEvent::Circuit(circuit) => {
                assert_eq!(circuit.id.0, "7");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let circuit = handle.new_circuit(&["AAAA".into(), "BBBB".into()]).await.unwrap();
        assert_eq!(circuit.0, "7");
    }

    #[tokio::test]
    async fn get_info_handles_both_reply_forms() {
        let addr = mock_control_server().await;
        let (handle, _events) =
            ControlConnection::connect(addr, &Auth::None, 16).await.unwrap();

        let version = handle.get_info("version").await.unwrap();
        assert_eq!(version, "0.4.8.12");

        let ns = handle.get_info("ns/all").await.unwrap();
        assert!(ns.starts_with("r moria1"));
        assert!(ns.contains("s Exit Fast Running Stable"));
    }

    #[tokio::test]
    async fn failed_command_surfaces_status() {
        let addr = mock_control_server().await;
        let (handle, _events) =
            ControlConnection::connect(addr, &Auth::None, 16).await.unwrap();

        let err = handle.get_server_descriptor("CCCC").await.unwrap_err();
        match err {
            ControlError::CommandFailed { status, .. } => assert_eq!(status, 552),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
