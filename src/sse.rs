// src/sse.rs
//! `text/event-stream` decoding and the reconnecting stream loop.
use crate::api::{AuthMode, DisplayApi};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental decoder; feed it raw chunks as they arrive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    pending: SseEvent,
    has_fields: bool,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.line(&String::from_utf8_lossy(&line)) {
                out.push(event);
            }
        }
        out
    }

    /// Last `retry:` hint from the server, in milliseconds.
    pub fn take_retry(&mut self) -> Option<u64> {
        self.retry.take()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if !self.has_fields {
                return None;
            }
            self.has_fields = false;
            let mut event = std::mem::take(&mut self.pending);
            if event.data.ends_with('\n') {
                event.data.pop();
            }
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending.event = Some(value.to_string());
                self.has_fields = true;
            }
            "data" => {
                self.pending.data.push_str(value);
                self.pending.data.push('\n');
                self.has_fields = true;
            }
            "id" => {
                self.pending.id = Some(value.to_string());
                self.has_fields = true;
            }
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }
}

/// Exponential reconnect delay, reset after every successful open.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, next: min }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }

    /// Applies a server `retry:` hint as the new floor.
    pub fn set_floor(&mut self, floor: Duration) {
        self.min = floor.min(self.max);
        self.next = self.next.max(self.min);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Opened,
    Message(SseEvent),
    Dropped(String),
}

/// Keeps the change stream open until `tx` is closed or the task is aborted.
pub async fn run_stream(
    api: DisplayApi,
    auth: AuthMode,
    mut backoff: Backoff,
    tx: UnboundedSender<StreamSignal>,
) {
    loop {
        let reason = match api.open_stream(&auth).await {
            Ok(res) => {
                info!("stream open for {}", auth.label());
                backoff.reset();
                if tx.send(StreamSignal::Opened).is_err() {
                    return;
                }
                let mut decoder = SseDecoder::default();
                let mut body = res.bytes_stream();
                loop {
                    match body.next().await {
                        Some(Ok(chunk)) => {
                            for event in decoder.push(&chunk) {
                                debug!("stream event {:?}", event.event);
                                if tx.send(StreamSignal::Message(event)).is_err() {
                                    return;
                                }
                            }
                            if let Some(ms) = decoder.take_retry() {
                                backoff.set_floor(Duration::from_millis(ms));
                            }
                        }
                        Some(Err(e)) => break format!("stream read failed: {e}"),
                        None => break "stream closed by server".to_string(),
                    }
                }
            }
            Err(e) => format!("stream connect failed: {e}"),
        };

        let delay = backoff.next_delay();
        warn!("{reason}; reconnecting in {delay:?}");
        if tx.send(StreamSignal::Dropped(reason)).is_err() {
            return;
        }
        tokio::time::sleep(delay).await;
        if tx.is_closed() {
            return;
        }
    }
}
