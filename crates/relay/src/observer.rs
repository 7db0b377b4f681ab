//! Incoming-message observation.
//!
//! Two strategies behind one trait. The socket observer taps the page's
//! own WebSocket traffic through CDP and is the default; the poll
//! observer scrapes the message list DOM on an interval and exists for
//! pages where frame capture is unavailable.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use pagebridge_core::{config::TargetConfig, ChatMessage, SocketEvent};

use crate::cdp::CdpClient;

#[derive(Debug, Clone, PartialEq)]
pub enum PageSignal {
    Typing(bool),
    Incoming(ChatMessage),
}

#[async_trait]
pub trait MessageObserver: Send {
    /// Next signal from the page, or `None` when the source is gone.
    async fn next(&mut self) -> Option<PageSignal>;
}

/// Translate one decoded socket event into relay signals. Any `message`
/// event means the peer stopped typing, whether or not the payload is
/// something we forward.
fn signals_for_event(event: SocketEvent) -> Vec<PageSignal> {
    match event.event_name.as_str() {
        "start_typing" => vec![PageSignal::Typing(true)],
        "message" => {
            let mut signals = vec![PageSignal::Typing(false)];
            if let Some(message) = event.payload {
                if message.is_incoming() {
                    signals.push(PageSignal::Incoming(message));
                }
            }
            signals
        }
        _ => Vec::new(),
    }
}

fn decode_frame(params: &Value) -> Option<SocketEvent> {
    let payload = params
        .get("response")
        .and_then(|r| r.get("payloadData"))
        .and_then(|v| v.as_str())?;
    serde_json::from_str(payload).ok()
}

/// Observes the page's WebSocket frames via `Network.webSocketFrameReceived`.
pub struct SocketObserver {
    frames: mpsc::Receiver<Value>,
    buffered: Vec<PageSignal>,
}

impl SocketObserver {
    pub async fn new(page: &CdpClient) -> Self {
        Self {
            frames: page.subscribe("Network.webSocketFrameReceived").await,
            buffered: Vec::new(),
        }
    }
}

#[async_trait]
impl MessageObserver for SocketObserver {
    async fn next(&mut self) -> Option<PageSignal> {
        loop {
            if !self.buffered.is_empty() {
                return Some(self.buffered.remove(0));
            }
            let params = self.frames.recv().await?;
            // Frames that are not ours (binary, ping traffic, other apps'
            // JSON) simply produce no signals.
            let Some(event) = decode_frame(&params) else {
                trace!("skipping undecodable socket frame");
                continue;
            };
            self.buffered = signals_for_event(event);
        }
    }
}

/// Fallback: polls the message list and reports only entries past a
/// high-water mark. The first poll only establishes the baseline, so
/// history present at attach time is never re-delivered.
pub struct PollObserver {
    page: CdpClient,
    list_selector: String,
    interval: Duration,
    seen: Option<usize>,
}

impl PollObserver {
    pub fn new(page: CdpClient, target: &TargetConfig) -> Self {
        Self {
            page,
            list_selector: target.selectors.message_list.clone(),
            interval: Duration::from_millis(target.poll_interval_ms),
            seen: None,
        }
    }

    async fn message_texts(&self) -> Option<Vec<String>> {
        let js = format!(
            "Array.from(document.querySelectorAll('{} > *'))\
             .map(el => el.textContent || '')",
            self.list_selector.replace('\'', "\\'")
        );
        let value = self.page.evaluate(&js).await.ok()??;
        serde_json::from_value(value).ok()
    }
}

#[async_trait]
impl MessageObserver for PollObserver {
    async fn next(&mut self) -> Option<PageSignal> {
        loop {
            tokio::time::sleep(self.interval).await;
            let Some(texts) = self.message_texts().await else {
                continue;
            };
            let count = texts.len();
            let baseline = match self.seen {
                Some(n) => n,
                None => {
                    self.seen = Some(count);
                    continue;
                }
            };
            if count > baseline {
                self.seen = Some(baseline + 1);
                let text = texts[baseline].clone();
                return Some(PageSignal::Incoming(ChatMessage::text(text)));
            }
            self.seen = Some(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(payload: &str) -> Value {
        json!({ "requestId": "1", "response": { "opcode": 1, "payloadData": payload } })
    }

    #[test]
    fn test_start_typing_frame() {
        let event = decode_frame(&frame(r#"{"event_name":"start_typing"}"#)).unwrap();
        assert_eq!(signals_for_event(event), vec![PageSignal::Typing(true)]);
    }

    #[test]
    fn test_robot_message_dispatches_incoming() {
        let payload = r#"{
            "event_name": "message",
            "payload": {
                "content": { "type": "text", "text": "hello there" },
                "meta": { "nature": "Robot" }
            }
        }"#;
        let event = decode_frame(&frame(payload)).unwrap();
        let signals = signals_for_event(event);
        assert_eq!(signals[0], PageSignal::Typing(false));
        match &signals[1] {
            PageSignal::Incoming(msg) => {
                assert_eq!(msg.content.as_text(), Some("hello there"))
            }
            other => panic!("expected Incoming, got {:?}", other),
        }
    }

    #[test]
    fn test_customer_echo_only_clears_typing() {
        let payload = r#"{
            "event_name": "message",
            "payload": {
                "content": { "type": "text", "text": "my own words" },
                "meta": { "nature": "Customer" }
            }
        }"#;
        let event = decode_frame(&frame(payload)).unwrap();
        assert_eq!(signals_for_event(event), vec![PageSignal::Typing(false)]);
    }

    #[test]
    fn test_unrelated_event_yields_nothing() {
        let event = decode_frame(&frame(r#"{"event_name":"presence"}"#)).unwrap();
        assert!(signals_for_event(event).is_empty());
    }

    #[test]
    fn test_non_json_frame_is_skipped() {
        assert!(decode_frame(&frame("not json")).is_none());
        assert!(decode_frame(&json!({ "requestId": "1" })).is_none());
    }
}
