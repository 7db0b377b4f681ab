//! Chrome DevTools Protocol client over WebSocket.
//!
//! Commands are correlated to responses through an id → oneshot map; page
//! events are fanned out to subscribers by method name. The client is
//! cheaply cloneable so the relay loop and its message observer can share
//! one page connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use pagebridge_core::{Error, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Aborts the wrapped task when the last client handle is dropped.
struct TaskGuard(tokio::task::JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Shared {
    ws_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: AtomicU64,
    listeners: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>,
    _reader: TaskGuard,
    _writer: TaskGuard,
}

#[derive(Clone)]
pub struct CdpClient {
    shared: Arc<Shared>,
}

impl CdpClient {
    /// Connect to a page target's debugger WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Cdp(format!("connect to {}: {}", ws_url, e)))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let listeners: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(msg)).await {
                    warn!(error = %e, "CDP write failed");
                    break;
                }
            }
        });

        let pending_reader = pending.clone();
        let listeners_reader = listeners.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = pending_reader.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let listeners = listeners_reader.lock().await;
                            if let Some(senders) = listeners.get(method) {
                                let params =
                                    val.get("params").cloned().unwrap_or(Value::Null);
                                for tx in senders {
                                    let _ = tx.try_send(params.clone());
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP socket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "CDP read failed");
                        break;
                    }
                    _ => {}
                }
            }
        });

        let shared = Arc::new(Shared {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            listeners,
            _reader: TaskGuard(reader),
            _writer: TaskGuard(writer),
        });
        Ok(Self { shared })
    }

    /// Send a command and wait (bounded) for its response's `result`.
    pub async fn command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({ "id": id, "method": method, "params": params });

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        self.shared
            .ws_tx
            .send(msg.to_string())
            .await
            .map_err(|e| Error::Cdp(format!("send {}: {}", method, e)))?;

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(Error::Cdp(format!("{}: {}", method, error)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(Error::Cdp(format!("{}: response channel closed", method))),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!("CDP command {}", method)))
            }
        }
    }

    /// Subscribe to a CDP event by method name.
    pub async fn subscribe(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        self.shared
            .listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.command(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.command("Page.navigate", json!({ "url": url })).await?;
        // Give the SPA a moment to boot before anyone probes selectors.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Ok(())
    }

    pub async fn reload(&self) -> Result<()> {
        self.command("Page.reload", json!({})).await?;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Ok(())
    }

    /// Evaluate an expression and return its by-value result, if any.
    pub async fn evaluate(&self, expression: &str) -> Result<Option<Value>> {
        let result = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            return Err(Error::Cdp(format!("evaluate: {}", details)));
        }
        Ok(result.get("result").and_then(|r| r.get("value")).cloned())
    }

    pub async fn selector_exists(&self, selector: &str) -> Result<bool> {
        let js = format!("!!document.querySelector('{}')", escape_selector(selector));
        Ok(self
            .evaluate(&js)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Poll for a selector until it appears or the timeout elapses.
    /// A miss is an `Ok(false)`, not an error; callers race indicators
    /// against each other and decide what absence means.
    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let start = tokio::time::Instant::now();
        loop {
            if self.selector_exists(selector).await? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn click_selector(&self, selector: &str) -> Result<()> {
        let js = format!(
            concat!(
                "(function() {{ var el = document.querySelector('{}');",
                " if (!el) return false;",
                " el.scrollIntoView({{block: 'center'}});",
                " el.click(); return true; }})()"
            ),
            escape_selector(selector)
        );
        let clicked = self
            .evaluate(&js)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        require_element(clicked, selector)
    }

    /// Focus an element, failing when the selector misses. Callers count
    /// on the error to notice a page that has lost its controls; typing
    /// into whatever happens to hold focus would drop the text silently.
    pub async fn focus_selector(&self, selector: &str) -> Result<()> {
        let js = format!(
            concat!(
                "(function() {{ var el = document.querySelector('{}');",
                " if (!el) return false;",
                " el.focus(); return true; }})()"
            ),
            escape_selector(selector)
        );
        let focused = self
            .evaluate(&js)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        require_element(focused, selector)
    }

    /// Focus a field, clear it, insert text, and fire an input event so
    /// framework-bound inputs pick the value up.
    pub async fn fill_selector(&self, selector: &str, text: &str) -> Result<()> {
        self.focus_selector(selector).await?;
        self.evaluate(
            "document.activeElement && (document.activeElement.value = '', \
             document.activeElement.textContent = '')",
        )
        .await?;
        self.command("Input.insertText", json!({ "text": text })).await?;
        self.evaluate(
            "document.activeElement && document.activeElement.dispatchEvent(\
             new Event('input', {bubbles: true}))",
        )
        .await?;
        Ok(())
    }

    /// Press and release Enter in the focused element.
    pub async fn press_enter(&self) -> Result<()> {
        for event_type in ["keyDown", "keyUp"] {
            self.command(
                "Input.dispatchKeyEvent",
                json!({
                    "type": event_type,
                    "key": "Enter",
                    "code": "Enter",
                    "windowsVirtualKeyCode": 13,
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// Attach local files to a file input element.
    pub async fn set_file_input(&self, selector: &str, files: Vec<String>) -> Result<()> {
        let doc = self.command("DOM.getDocument", json!({ "depth": 1 })).await?;
        let root_id = doc
            .get("root")
            .and_then(|r| r.get("nodeId"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::Cdp("no document root".to_string()))?;
        let node = self
            .command(
                "DOM.querySelector",
                json!({ "nodeId": root_id, "selector": selector }),
            )
            .await?;
        let node_id = node.get("nodeId").and_then(|v| v.as_i64()).unwrap_or(0);
        if node_id == 0 {
            return Err(Error::NotFound(format!("file input {}", selector)));
        }
        self.command(
            "DOM.setFileInputFiles",
            json!({ "files": files, "nodeId": node_id }),
        )
        .await?;
        // Fire change so the page reacts to the programmatic attach.
        self.evaluate(&format!(
            "document.querySelector('{}')?.dispatchEvent(new Event('change', {{bubbles: true}}))",
            escape_selector(selector)
        ))
        .await?;
        Ok(())
    }

    pub async fn get_cookies(&self) -> Result<Vec<Value>> {
        let result = self.command("Network.getCookies", json!({})).await?;
        Ok(result
            .get("cookies")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Restore previously captured cookies. Dumped cookie objects carry
    /// read-only fields CDP rejects on write, so each one is reduced to
    /// the settable subset first.
    pub async fn set_cookies(&self, cookies: &[Value]) -> Result<()> {
        let params: Vec<Value> = cookies.iter().map(cookie_to_param).collect();
        self.command("Network.setCookies", json!({ "cookies": params }))
            .await?;
        Ok(())
    }

    /// Dump the page's entire localStorage as key/value pairs.
    pub async fn local_storage_dump(&self) -> Result<HashMap<String, String>> {
        let value = self
            .evaluate(
                "(function() { const out = {}; \
                 for (let i = 0; i < localStorage.length; i++) { \
                   const k = localStorage.key(i); out[k] = localStorage.getItem(k); } \
                 return out; })()",
            )
            .await?
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    /// Replace the page's localStorage with a captured snapshot.
    pub async fn local_storage_restore(&self, entries: &HashMap<String, String>) -> Result<()> {
        let data = serde_json::to_string(entries)?;
        let js = format!(
            "(function() {{ const data = {}; localStorage.clear(); \
             for (const k in data) localStorage.setItem(k, data[k]); \
             return true; }})()",
            data
        );
        self.evaluate(&js).await?;
        Ok(())
    }
}

fn escape_selector(selector: &str) -> String {
    selector.replace('\\', "\\\\").replace('\'', "\\'")
}

fn require_element(found: bool, selector: &str) -> Result<()> {
    if found {
        Ok(())
    } else {
        Err(Error::NotFound(format!("element {}", selector)))
    }
}

fn cookie_to_param(cookie: &Value) -> Value {
    let mut param = json!({
        "name": cookie.get("name").cloned().unwrap_or(Value::Null),
        "value": cookie.get("value").cloned().unwrap_or(Value::Null),
        "domain": cookie.get("domain").cloned().unwrap_or(Value::Null),
        "path": cookie.get("path").cloned().unwrap_or(Value::Null),
    });
    for key in ["secure", "httpOnly", "sameSite", "expires"] {
        if let Some(v) = cookie.get(key) {
            param[key] = v.clone();
        }
    }
    param
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_selector_quotes() {
        assert_eq!(
            escape_selector("button[data-testid='next']"),
            "button[data-testid=\\'next\\']"
        );
    }

    #[test]
    fn test_cookie_to_param_strips_readonly_fields() {
        let dumped = json!({
            "name": "session",
            "value": "tok",
            "domain": ".example.com",
            "path": "/",
            "size": 42,
            "session": false,
            "priority": "Medium",
            "secure": true,
            "expires": 1999999999.0
        });
        let param = cookie_to_param(&dumped);
        assert_eq!(param["name"], "session");
        assert_eq!(param["secure"], true);
        assert!(param.get("size").is_none());
        assert!(param.get("priority").is_none());
    }

    #[test]
    fn test_require_element_misses_are_errors() {
        assert!(matches!(
            require_element(false, "#send-box"),
            Err(Error::NotFound(_))
        ));
        assert!(require_element(true, "#send-box").is_ok());
    }
}
