use std::io::Read;
use std::thread;
use std::time::Duration;

use log::warn;
use thiserror::Error;

pub const PUT_MAX_ATTEMPTS: u32 = 5;
pub const PUT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const STREAM_LINE_CAPACITY: usize = 256;

const DATA_MARKER: &str = "data:";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// The store holds raw scalars, so payloads are not JSON-quoted: floats go
// out with two decimals, strings as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f32),
    Int(i64),
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn to_payload(&self) -> String {
        match self {
            Value::Float(value) => format!("{value:.2}"),
            Value::Int(value) => value.to_string(),
            Value::Bool(value) => value.to_string(),
            Value::Str(value) => value.clone(),
        }
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

pub trait PutTransport {
    fn put(&mut self, url: &str, body: &str) -> Result<u16, TransportError>;
}

impl<T: PutTransport + ?Sized> PutTransport for &mut T {
    fn put(&mut self, url: &str, body: &str) -> Result<u16, TransportError> {
        (**self).put(url, body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub ok: bool,
    pub attempts: u32,
}

pub fn resource_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}.json",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub struct PutClient<T> {
    transport: T,
    base_url: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<T: PutTransport> PutClient<T> {
    pub fn new(transport: T, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_attempts: PUT_MAX_ATTEMPTS,
            retry_delay: PUT_RETRY_DELAY,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    pub fn url_for(&self, path: &str) -> String {
        resource_url(&self.base_url, path)
    }

    pub fn put(&mut self, path: &str, value: &Value) -> PutOutcome {
        let url = self.url_for(path);
        let body = value.to_payload();

        for attempt in 1..=self.max_attempts {
            match self.transport.put(&url, &body) {
                Ok(status) if (200..300).contains(&status) => {
                    return PutOutcome {
                        ok: true,
                        attempts: attempt,
                    };
                }
                Ok(status) => warn!(
                    "put {path} returned status {status} (attempt {attempt}/{})",
                    self.max_attempts
                ),
                Err(err) => warn!(
                    "put {path} failed: {err} (attempt {attempt}/{})",
                    self.max_attempts
                ),
            }
            if attempt < self.max_attempts {
                thread::sleep(self.retry_delay);
            }
        }

        PutOutcome {
            ok: false,
            attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum StreamLine {
    Line(String),
    Overflow,
}

// An overflowing byte discards the partial line instead of growing the
// buffer past its cap.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    capacity: usize,
}

impl LineAssembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<StreamLine> {
        match byte {
            b'\n' => {
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Some(StreamLine::Line(line))
            }
            b'\r' => None,
            _ => {
                if self.buf.len() == self.capacity {
                    self.buf.clear();
                    return Some(StreamLine::Overflow);
                }
                self.buf.push(byte);
                None
            }
        }
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(STREAM_LINE_CAPACITY)
    }
}

pub fn command_payload(line: &str) -> Option<&str> {
    if !line.contains(DATA_MARKER) {
        return None;
    }
    let start = line.find('{')?;
    Some(&line[start..])
}

// A bare boolean or the object's first boolean field decides; anything
// else is ignored.
pub fn parse_relay_command(payload: &str) -> Option<bool> {
    let value: serde_json::Value = serde_json::from_str(payload.trim()).ok()?;
    first_bool(&value)
}

fn first_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(flag) => Some(*flag),
        serde_json::Value::Object(map) => map.values().find_map(first_bool),
        _ => None,
    }
}

pub struct StreamSession<R> {
    stream: R,
    assembler: LineAssembler,
}

impl<R: Read> StreamSession<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            assembler: LineAssembler::default(),
        }
    }

    // Ok(None) means the server closed the stream.
    pub fn next_command(&mut self) -> Result<Option<String>, TransportError> {
        let mut byte = [0u8; 1];
        loop {
            if self.stream.read(&mut byte)? == 0 {
                return Ok(None);
            }
            match self.assembler.push(byte[0]) {
                Some(StreamLine::Line(line)) => {
                    if let Some(payload) = command_payload(&line) {
                        return Ok(Some(payload.to_string()));
                    }
                }
                Some(StreamLine::Overflow) => {
                    warn!("stream line exceeded {STREAM_LINE_CAPACITY} bytes, discarding");
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;

    use super::*;

    struct ScriptedTransport {
        script: VecDeque<Result<u16, TransportError>>,
        calls: u32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<u16, TransportError>>) -> Self {
            Self {
                script: script.into(),
                calls: 0,
            }
        }
    }

    impl PutTransport for ScriptedTransport {
        fn put(&mut self, _url: &str, _body: &str) -> Result<u16, TransportError> {
            self.calls += 1;
            self.script
                .pop_front()
                .unwrap_or(Err(TransportError::Request("script exhausted".into())))
        }
    }

    fn refused() -> Result<u16, TransportError> {
        Err(TransportError::Request("connection refused".into()))
    }

    #[test]
    fn float_payload_has_two_decimals() {
        assert_eq!(Value::Float(21.0).to_payload(), "21.00");
        assert_eq!(Value::Float(23.456).to_payload(), "23.46");
        assert_eq!(Value::from(-0.5f32).to_payload(), "-0.50");
    }

    #[test]
    fn scalar_payloads_are_unquoted() {
        assert_eq!(Value::Int(-3).to_payload(), "-3");
        assert_eq!(Value::Bool(true).to_payload(), "true");
        assert_eq!(Value::Str("on".to_string()).to_payload(), "on");
    }

    #[test]
    fn put_url_appends_json_suffix() {
        let client = PutClient::new(
            ScriptedTransport::new(vec![]),
            "https://store.example.com/",
        );
        assert_eq!(
            client.url_for("controls/switch"),
            "https://store.example.com/controls/switch.json"
        );
        assert_eq!(client.url_for("/x"), "https://store.example.com/x.json");
    }

    #[test]
    fn put_stops_at_first_success() {
        let mut transport = ScriptedTransport::new(vec![refused(), refused(), refused(), Ok(200)]);
        let mut client =
            PutClient::new(&mut transport, "http://store").with_retry(5, Duration::ZERO);

        let outcome = client.put("controls/switch", &Value::Bool(true));
        assert_eq!(outcome, PutOutcome { ok: true, attempts: 4 });
        drop(client);
        assert_eq!(transport.calls, 4);
    }

    #[test]
    fn put_gives_up_after_the_budget() {
        let mut transport =
            ScriptedTransport::new(vec![refused(), refused(), refused(), refused(), refused()]);
        let mut client =
            PutClient::new(&mut transport, "http://store").with_retry(5, Duration::ZERO);

        let outcome = client.put("controls/switch", &Value::Bool(true));
        assert_eq!(outcome, PutOutcome { ok: false, attempts: 5 });
        drop(client);
        assert_eq!(transport.calls, 5);
    }

    #[test]
    fn non_2xx_status_counts_as_a_failure() {
        let mut transport = ScriptedTransport::new(vec![Ok(500), Ok(204)]);
        let mut client =
            PutClient::new(&mut transport, "http://store").with_retry(5, Duration::ZERO);

        let outcome = client.put("sensors/temperature", &Value::Float(20.0));
        assert_eq!(outcome, PutOutcome { ok: true, attempts: 2 });
    }

    // Reader that returns at most one byte per call, the worst chunking a
    // transport can produce.
    struct DripReader<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    impl Read for DripReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.bytes.len() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn dispatches_one_command_per_event() {
        let body = b"event: put\r\ndata: {\"a\":true}\r\n\r\n";
        let mut session = StreamSession::new(Cursor::new(&body[..]));

        assert_eq!(session.next_command().unwrap(), Some("{\"a\":true}".to_string()));
        assert_eq!(session.next_command().unwrap(), None);
    }

    #[test]
    fn dispatch_is_independent_of_chunk_boundaries() {
        let body = b"event: put\ndata: {\"a\":true}\n\n";
        let mut session = StreamSession::new(DripReader { bytes: body, pos: 0 });

        let mut commands = Vec::new();
        while let Some(payload) = session.next_command().unwrap() {
            commands.push(payload);
        }
        assert_eq!(commands, vec!["{\"a\":true}".to_string()]);
    }

    #[test]
    fn keepalive_lines_are_ignored() {
        let body = b"event: keep-alive\ndata: null\ndata: {\"a\":false}\n";
        let mut session = StreamSession::new(Cursor::new(&body[..]));

        assert_eq!(
            session.next_command().unwrap(),
            Some("{\"a\":false}".to_string())
        );
        assert_eq!(session.next_command().unwrap(), None);
    }

    #[test]
    fn overflow_discards_the_line_and_recovers() {
        let mut body = vec![b'x'; STREAM_LINE_CAPACITY + 40];
        body.extend_from_slice(b"\ndata: {\"a\":true}\n");
        let mut session = StreamSession::new(Cursor::new(body));

        assert_eq!(session.next_command().unwrap(), Some("{\"a\":true}".to_string()));
        assert_eq!(session.next_command().unwrap(), None);
    }

    #[test]
    fn assembler_reports_overflow_once_per_burst() {
        let mut assembler = LineAssembler::new(4);
        for byte in *b"abcd" {
            assert_eq!(assembler.push(byte), None);
        }
        assert_eq!(assembler.push(b'e'), Some(StreamLine::Overflow));
        // The overflowing byte is gone; the rest starts a new line.
        assert_eq!(assembler.push(b'f'), None);
        assert_eq!(
            assembler.push(b'\n'),
            Some(StreamLine::Line("f".to_string()))
        );
    }

    #[test]
    fn relay_command_accepts_store_event_shapes() {
        assert_eq!(parse_relay_command("{\"path\":\"/\",\"data\":true}"), Some(true));
        assert_eq!(parse_relay_command("{\"path\":\"/\",\"data\":{\"on\":false}}"), Some(false));
        assert_eq!(parse_relay_command("true"), Some(true));
        assert_eq!(parse_relay_command(" false "), Some(false));
    }

    #[test]
    fn relay_command_rejects_non_boolean_payloads() {
        assert_eq!(parse_relay_command("{\"path\":\"/\",\"data\":null}"), None);
        assert_eq!(parse_relay_command("{\"data\":42}"), None);
        assert_eq!(parse_relay_command("not json"), None);
        assert_eq!(parse_relay_command(""), None);
    }

    #[test]
    fn payload_extraction_needs_the_data_marker() {
        assert_eq!(command_payload("data: {\"a\":true}"), Some("{\"a\":true}"));
        assert_eq!(command_payload("event: put"), None);
        assert_eq!(command_payload("{\"a\":true}"), None);
        assert_eq!(command_payload("data: null"), None);
    }
}
