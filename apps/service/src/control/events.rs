use super::{CircuitId, StreamId};

/// Asynchronous events delivered by the control channel.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Circuit(CircuitEvent),
    Stream(StreamEvent),
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Launched,
    Extended,
    Built,
    Failed,
    Closed,
    Other,
}

impl CircuitStatus {
    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "LAUNCHED" => CircuitStatus::Launched,
            "EXTENDED" => CircuitStatus::Extended,
            "BUILT" => CircuitStatus::Built,
            "FAILED" => CircuitStatus::Failed,
            "CLOSED" => CircuitStatus::Closed,
            _ => CircuitStatus::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitEvent {
    pub id: CircuitId,
    pub status: CircuitStatus,
    /// Hop fingerprints, entry first. The exit is the last element.
    pub path: Vec<String>,
}

impl CircuitEvent {
    pub fn exit_fingerprint(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    New,
    NewResolve,
    Succeeded,
    Detached,
    Closed,
    Other,
}

impl StreamStatus {
    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "NEW" => StreamStatus::New,
            "NEWRESOLVE" => StreamStatus::NewResolve,
            "SUCCEEDED" => StreamStatus::Succeeded,
            "DETACHED" => StreamStatus::Detached,
            "CLOSED" => StreamStatus::Closed,
            _ => StreamStatus::Other,
        }
    }

    /// Stream states that still need an explicit attach instruction.
    pub fn needs_attach(&self) -> bool {
        matches!(self, StreamStatus::New | StreamStatus::NewResolve)
    }
}

#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub id: StreamId,
    pub status: StreamStatus,
    pub target: String,
    /// The `SOURCE_ADDR=ip:port` value, verbatim, when present.
    pub source_addr: Option<String>,
}

impl StreamEvent {
    /// The ephemeral source port of the connection that opened this stream.
    ///
    /// Extracted from the fixed `SOURCE_ADDR=ip:port` form; anything that
    /// does not parse yields `None` and the event is simply never matched.
    pub fn source_port(&self) -> Option<u16> {
        let addr = self.source_addr.as_deref()?;
        let (host, port) = addr.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        port.parse::<u16>().ok()
    }
}

/// Parse one event payload (the line after the `650 ` prefix).
pub fn parse(payload: &str) -> Option<ControlEvent> {
    let mut tokens = payload.split_ascii_whitespace();
    let kind = tokens.next()?;

    match kind {
        "CIRC" => {
            let id = CircuitId(tokens.next()?.to_string());
            let status = CircuitStatus::from_keyword(tokens.next()?);
            let path = tokens
                .next()
                .filter(|token| token.starts_with('$'))
                .map(parse_path)
                .unwrap_or_default();
            Some(ControlEvent::Circuit(CircuitEvent { id, status, path }))
        }
        "STREAM" => {
            let id = StreamId(tokens.next()?.to_string());
            let status = StreamStatus::from_keyword(tokens.next()?);
            let _circuit = tokens.next()?;
            let target = tokens.next().unwrap_or_default().to_string();
            let source_addr = tokens
                .find_map(|token| token.strip_prefix("SOURCE_ADDR="))
                .map(str::to_string);
            Some(ControlEvent::Stream(StreamEvent { id, status, target, source_addr }))
        }
        _ => Some(ControlEvent::Other(payload.to_string())),
    }
}

/// A circuit path looks like `$FP~nickname,$FP=nickname,$FP`; only the
/// fingerprints matter here.
fn parse_path(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|hop| {
            let hop = hop.strip_prefix('$').unwrap_or(hop);
            let end = hop.find(['~', '=']).unwrap_or(hop.len());
            hop[..end].to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_built_circuit_with_path() {
        let event = parse(
            "CIRC 12 BUILT $9695DFC35FFEB861329B9F1AB04C46397020CE31~first,\
             $847B1F850344D7876491A54892F904934E4EB85D=exit \
             BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL",
        )
        .unwrap();

        let ControlEvent::Circuit(circuit) = event else { panic!("expected circuit event") };
        assert_eq!(circuit.id.0, "12");
        assert_eq!(circuit.status, CircuitStatus::Built);
        assert_eq!(circuit.path.len(), 2);
        assert_eq!(
            circuit.exit_fingerprint(),
            Some("847B1F850344D7876491A54892F904934E4EB85D")
        );
    }

    #[test]
    fn parses_failed_circuit_without_path() {
        let event = parse("CIRC 13 FAILED REASON=TIMEOUT").unwrap();
        let ControlEvent::Circuit(circuit) = event else { panic!("expected circuit event") };
        assert_eq!(circuit.status, CircuitStatus::Failed);
        assert!(circuit.path.is_empty());
    }

    #[test]
    fn parses_new_stream_with_source_port() {
        let event = parse(
            "STREAM 35 NEW 0 www.torproject.org:0 SOURCE_ADDR=127.0.0.1:51000 PURPOSE=DNS_REQUEST",
        )
        .unwrap();

        let ControlEvent::Stream(stream) = event else { panic!("expected stream event") };
        assert_eq!(stream.id.0, "35");
        assert_eq!(stream.status, StreamStatus::New);
        assert!(stream.status.needs_attach());
        assert_eq!(stream.source_port(), Some(51000));
    }

    #[test]
    fn stream_without_source_addr_has_no_port() {
        let event = parse("STREAM 36 NEWRESOLVE 0 example.com:0").unwrap();
        let ControlEvent::Stream(stream) = event else { panic!("expected stream event") };
        assert_eq!(stream.status, StreamStatus::NewResolve);
        assert_eq!(stream.source_port(), None);
    }

    #[test]
    fn malformed_source_addr_is_dropped() {
        for bad in ["SOURCE_ADDR=garbage", "SOURCE_ADDR=:51000", "SOURCE_ADDR=1.2.3.4:notaport"] {
            let line = format!("STREAM 37 NEW 0 example.com:0 {bad}");
            let ControlEvent::Stream(stream) = parse(&line).unwrap() else {
                panic!("expected stream event");
            };
            assert_eq!(stream.source_port(), None, "expected no port from {bad}");
        }
    }

    #[test]
    fn unknown_event_kinds_pass_through() {
        let event = parse("BW 1024 2048").unwrap();
        assert!(matches!(event, ControlEvent::Other(_)));
    }

    #[test]
    fn succeeded_stream_needs_no_attach() {
        let event = parse("STREAM 38 SUCCEEDED 12 example.com:0").unwrap();
        let ControlEvent::Stream(stream) = event else { panic!("expected stream event") };
        assert!(!stream.status.needs_attach());
    }
}
