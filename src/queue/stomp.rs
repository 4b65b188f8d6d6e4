// src/queue/stomp.rs
//! Minimal STOMP 1.2 client over TCP: frame codec, connection handshake,
//! receipted SEND for publishing and client-individual subscriptions for
//! consuming.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::config::BrokerConfig;
use crate::errors::QueueError;
use crate::queue::{
    Delivery, QueueClient, QueueConnector, QueueMessage, QueueSubscriber, QueueSubscription,
};

const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins, as STOMP 1.2 requires for repeated headers.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn escapes_headers(&self) -> bool {
        !matches!(self.command.as_str(), "CONNECT" | "CONNECTED")
    }
}

/// Unit of traffic on the wire: a frame or a heart-beat EOL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmission {
    HeartBeat,
    Frame(Frame),
}

#[derive(Debug, Default)]
pub struct StompCodec;

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String, QueueError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(QueueError::Protocol(format!(
                    "invalid header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

impl Decoder for StompCodec {
    type Item = Transmission;
    type Error = QueueError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Heart-beats are bare EOLs between frames.
        if src.first() == Some(&b'\n') {
            src.advance(1);
            return Ok(Some(Transmission::HeartBeat));
        }
        if src.starts_with(b"\r\n") {
            src.advance(2);
            return Ok(Some(Transmission::HeartBeat));
        }
        if src.as_ref() == b"\r" {
            return Ok(None);
        }

        // Collect command + header lines up to the blank separator line.
        let mut lines: Vec<(usize, usize)> = Vec::new();
        let mut cursor = 0usize;
        loop {
            let Some(rel) = src[cursor..].iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_BYTES {
                    return Err(QueueError::Protocol("frame header too large".into()));
                }
                return Ok(None);
            };
            let mut end = cursor + rel;
            let next = end + 1;
            if end > cursor && src[end - 1] == b'\r' {
                end -= 1;
            }
            if end == cursor {
                cursor = next;
                break;
            }
            lines.push((cursor, end));
            cursor = next;
        }
        let body_start = cursor;

        let text = |(a, b): (usize, usize)| -> Result<String, QueueError> {
            std::str::from_utf8(&src[a..b])
                .map(str::to_string)
                .map_err(|_| QueueError::Protocol("frame header is not utf-8".into()))
        };
        let Some((&first, rest)) = lines.split_first() else {
            return Err(QueueError::Protocol("frame without command".into()));
        };
        let command = text(first)?;
        let escaped = !matches!(command.as_str(), "CONNECT" | "CONNECTED");
        let mut headers = Vec::with_capacity(rest.len());
        for &range in rest {
            let line = text(range)?;
            let Some((k, v)) = line.split_once(':') else {
                return Err(QueueError::Protocol(format!("malformed header line {line:?}")));
            };
            if escaped {
                headers.push((unescape(k)?, unescape(v)?));
            } else {
                headers.push((k.to_string(), v.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| QueueError::Protocol(format!("bad content-length {v:?}")))
            })
            .transpose()?;

        let (body_end, frame_end) = match content_length {
            Some(len) => {
                if len > MAX_FRAME_BYTES {
                    return Err(QueueError::Protocol("frame body too large".into()));
                }
                if src.len() < body_start + len + 1 {
                    src.reserve(body_start + len + 1 - src.len());
                    return Ok(None);
                }
                if src[body_start + len] != 0 {
                    return Err(QueueError::Protocol(
                        "frame body not NUL terminated at content-length".into(),
                    ));
                }
                (body_start + len, body_start + len + 1)
            }
            None => match src[body_start..].iter().position(|b| *b == 0) {
                Some(rel) => (body_start + rel, body_start + rel + 1),
                None => {
                    if src.len() > MAX_FRAME_BYTES {
                        return Err(QueueError::Protocol("frame body too large".into()));
                    }
                    return Ok(None);
                }
            },
        };

        let body = src[body_start..body_end].to_vec();
        src.advance(frame_end);
        Ok(Some(Transmission::Frame(Frame {
            command,
            headers,
            body,
        })))
    }
}

impl Encoder<Transmission> for StompCodec {
    type Error = QueueError;

    fn encode(&mut self, item: Transmission, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            Transmission::HeartBeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            Transmission::Frame(frame) => frame,
        };
        let escaped = frame.escapes_headers();
        dst.reserve(frame.command.len() + frame.body.len() + 64);
        dst.put_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');
        for (k, v) in &frame.headers {
            if escaped {
                dst.put_slice(escape(k).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape(v).as_bytes());
            } else {
                dst.put_slice(k.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(v.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() && frame.get("content-length").is_none() {
            dst.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

/// Connection settings derived from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct StompSettings {
    pub host: String,
    pub port: u16,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub virtual_host: String,
    pub connect_timeout: Duration,
    pub receipt_timeout: Duration,
    pub heartbeat: Duration,
    pub destination: String,
    pub subscription_id: String,
}

impl StompSettings {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            login: cfg.username.clone(),
            passcode: cfg.password.clone(),
            virtual_host: cfg.virtual_host.clone().unwrap_or_else(|| cfg.host.clone()),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs.max(1)),
            receipt_timeout: Duration::from_secs(cfg.receipt_timeout_secs.max(1)),
            heartbeat: Duration::from_millis(cfg.heartbeat_ms),
            destination: cfg.destination.clone(),
            subscription_id: cfg.subscription_id.clone(),
        }
    }
}

pub struct StompConnection {
    framed: Framed<TcpStream, StompCodec>,
    receipt_timeout: Duration,
    next_receipt: u64,
    /// MESSAGE frames that arrived while a receipt was outstanding.
    held: VecDeque<Frame>,
}

impl StompConnection {
    /// Open TCP, send CONNECT and wait for CONNECTED.
    pub async fn connect(settings: &StompSettings, heartbeat: Duration) -> Result<Self, QueueError> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let stream = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| QueueError::Timeout("tcp connect"))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            framed: Framed::new(stream, StompCodec),
            receipt_timeout: settings.receipt_timeout,
            next_receipt: 0,
            held: VecDeque::new(),
        };

        let mut connect = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", settings.virtual_host.clone())
            .header("heart-beat", format!("{},0", heartbeat.as_millis()));
        if let Some(login) = &settings.login {
            connect = connect.header("login", login.clone());
        }
        if let Some(passcode) = &settings.passcode {
            connect = connect.header("passcode", passcode.clone());
        }
        conn.write(connect).await?;

        let reply = tokio::time::timeout(settings.connect_timeout, conn.read_frame())
            .await
            .map_err(|_| QueueError::Timeout("CONNECTED"))??;
        match reply {
            Some(f) if f.command == "CONNECTED" => {
                tracing::debug!(
                    target: "queue",
                    broker = %addr,
                    version = f.get("version").unwrap_or("?"),
                    server = f.get("server").unwrap_or("?"),
                    "stomp session established"
                );
                Ok(conn)
            }
            Some(f) if f.command == "ERROR" => Err(broker_error(&f)),
            Some(f) => Err(QueueError::Protocol(format!(
                "expected CONNECTED, got {}",
                f.command
            ))),
            None => Err(QueueError::Closed),
        }
    }

    pub async fn write(&mut self, frame: Frame) -> Result<(), QueueError> {
        self.framed.send(Transmission::Frame(frame)).await
    }

    pub async fn heartbeat(&mut self) -> Result<(), QueueError> {
        self.framed.send(Transmission::HeartBeat).await
    }

    /// Next frame, skipping heart-beats. `None` on clean EOF. Cancel-safe.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, QueueError> {
        loop {
            match self.framed.next().await {
                Some(Ok(Transmission::HeartBeat)) => continue,
                Some(Ok(Transmission::Frame(f))) => return Ok(Some(f)),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }

    /// MESSAGE frames read ahead during a receipt wait, oldest first.
    pub fn take_held(&mut self) -> Option<Frame> {
        self.held.pop_front()
    }

    fn receipt_id(&mut self) -> String {
        self.next_receipt += 1;
        format!("rcpt-{}", self.next_receipt)
    }

    /// Send a frame with a `receipt` header and wait for the matching RECEIPT.
    pub async fn write_receipted(&mut self, frame: Frame) -> Result<(), QueueError> {
        let receipt = self.receipt_id();
        self.write(frame.header("receipt", receipt.clone())).await?;
        let timeout = self.receipt_timeout;
        tokio::time::timeout(timeout, async {
            loop {
                match self.read_frame().await? {
                    Some(f) if f.command == "RECEIPT" && f.get("receipt-id") == Some(&receipt) => {
                        return Ok(());
                    }
                    Some(f) if f.command == "ERROR" => return Err(broker_error(&f)),
                    Some(f) if f.command == "MESSAGE" => self.held.push_back(f),
                    Some(f) => {
                        tracing::debug!(target: "queue", command = %f.command, "ignoring frame while awaiting receipt");
                    }
                    None => return Err(QueueError::Closed),
                }
            }
        })
        .await
        .map_err(|_| QueueError::Timeout("RECEIPT"))?
    }

    pub async fn send_message(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut frame = Frame::new("SEND").header("destination", message.destination.clone());
        for (k, v) in &message.headers {
            frame = frame.header(k.clone(), v.clone());
        }
        self.write_receipted(frame.body(message.body.as_bytes().to_vec()))
            .await
    }

    pub async fn subscribe(&mut self, destination: &str, id: &str) -> Result<(), QueueError> {
        let frame = Frame::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
            .header("ack", "client-individual");
        self.write_receipted(frame).await
    }

    pub async fn disconnect(&mut self) {
        let frame = Frame::new("DISCONNECT");
        if let Err(e) = self.write_receipted(frame).await {
            tracing::debug!(target: "queue", error = %e, "disconnect without receipt");
        }
    }
}

fn broker_error(frame: &Frame) -> QueueError {
    QueueError::Broker {
        message: frame.get("message").unwrap_or("unspecified").to_string(),
        details: String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

/// Connects publisher and listener sessions to one STOMP broker.
#[derive(Debug, Clone)]
pub struct StompConnector {
    settings: StompSettings,
}

impl StompConnector {
    pub fn new(settings: StompSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self::new(StompSettings::from_config(cfg))
    }

    pub fn settings(&self) -> &StompSettings {
        &self.settings
    }
}

pub struct StompClient {
    conn: StompConnection,
}

#[async_trait]
impl QueueClient for StompClient {
    async fn send(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        self.conn.send_message(message).await
    }

    async fn close(&mut self) {
        self.conn.disconnect().await;
    }
}

#[async_trait]
impl QueueConnector for StompConnector {
    async fn connect(&self) -> Result<Box<dyn QueueClient>, QueueError> {
        // Publishers are short-lived per cycle; no heart-beating.
        let conn = StompConnection::connect(&self.settings, Duration::ZERO).await?;
        tracing::info!(
            target: "queue",
            host = %self.settings.host,
            port = self.settings.port,
            "connected to broker"
        );
        Ok(Box::new(StompClient { conn }))
    }
}

pub struct StompSubscription {
    conn: StompConnection,
    destination: String,
    heartbeat: Option<tokio::time::Interval>,
}

impl StompSubscription {
    fn delivery(&self, f: Frame) -> Result<Delivery, QueueError> {
        let ack_id = f
            .get("ack")
            .or_else(|| f.get("message-id"))
            .ok_or_else(|| QueueError::Protocol("MESSAGE without ack id".into()))?
            .to_string();
        Ok(Delivery {
            ack_id,
            message_id: f.get("message-id").map(str::to_string),
            destination: f
                .get("destination")
                .unwrap_or(&self.destination)
                .to_string(),
            headers: f.headers,
            body: f.body,
        })
    }
}

enum Wake {
    Frame(Result<Option<Frame>, QueueError>),
    Beat,
}

#[async_trait]
impl QueueSubscription for StompSubscription {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        if let Some(f) = self.conn.take_held() {
            return self.delivery(f).map(Some);
        }
        loop {
            let wake = match self.heartbeat.as_mut() {
                Some(ticker) => tokio::select! {
                    f = self.conn.read_frame() => Wake::Frame(f),
                    _ = ticker.tick() => Wake::Beat,
                },
                None => Wake::Frame(self.conn.read_frame().await),
            };
            match wake {
                Wake::Beat => self.conn.heartbeat().await?,
                Wake::Frame(Err(e)) => return Err(e),
                Wake::Frame(Ok(None)) => return Ok(None),
                Wake::Frame(Ok(Some(f))) if f.command == "MESSAGE" => {
                    return self.delivery(f).map(Some);
                }
                Wake::Frame(Ok(Some(f))) if f.command == "ERROR" => return Err(broker_error(&f)),
                Wake::Frame(Ok(Some(f))) => {
                    tracing::debug!(target: "queue", command = %f.command, "ignoring frame on subscription");
                }
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        self.conn
            .write(Frame::new("ACK").header("id", delivery.ack_id.clone()))
            .await
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        self.conn
            .write(Frame::new("NACK").header("id", delivery.ack_id.clone()))
            .await
    }

    async fn close(&mut self) {
        self.conn.disconnect().await;
    }
}

#[async_trait]
impl QueueSubscriber for StompConnector {
    async fn subscribe(&self) -> Result<Box<dyn QueueSubscription>, QueueError> {
        let hb = self.settings.heartbeat;
        let mut conn = StompConnection::connect(&self.settings, hb).await?;
        conn.subscribe(&self.settings.destination, &self.settings.subscription_id)
            .await?;
        tracing::info!(
            target: "queue",
            destination = %self.settings.destination,
            id = %self.settings.subscription_id,
            "subscribed"
        );
        let heartbeat = (!hb.is_zero()).then(|| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + hb, hb);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });
        Ok(Box::new(StompSubscription {
            conn,
            destination: self.settings.destination.clone(),
            heartbeat,
        }))
    }
}
