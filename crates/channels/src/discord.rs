use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use pagebridge_core::{config::DiscordConfig, Error, Result};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Discord Gateway opcodes
const GATEWAY_DISPATCH: u8 = 0;
const GATEWAY_HEARTBEAT: u8 = 1;
const GATEWAY_IDENTIFY: u8 = 2;
const GATEWAY_PRESENCE_UPDATE: u8 = 3;
const GATEWAY_HELLO: u8 = 10;
const GATEWAY_HEARTBEAT_ACK: u8 = 11;

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Option<serde_json::Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Serialize)]
struct GatewayIdentify {
    op: u8,
    d: IdentifyData,
}

#[derive(Debug, Serialize)]
struct IdentifyData {
    token: String,
    intents: u64,
    properties: IdentifyProperties,
}

#[derive(Debug, Serialize)]
struct IdentifyProperties {
    os: String,
    browser: String,
    device: String,
}

#[derive(Debug, Serialize)]
struct GatewayHeartbeat {
    op: u8,
    d: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(default)]
    content: String,
    author: WireUser,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
    #[serde(default)]
    mentions: Vec<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    #[serde(default)]
    url: Option<String>,
}

/// A received Discord message, reduced to what the dispatcher needs.
#[derive(Debug, Clone)]
pub struct DirectMessage {
    pub message_id: String,
    pub author_id: String,
    pub author_name: Option<String>,
    pub channel_id: String,
    pub content: String,
    /// Attachment URLs, in message order.
    pub attachments: Vec<String>,
    /// True for messages outside any guild.
    pub is_dm: bool,
    pub mentions_bot: bool,
    pub author_is_bot: bool,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// Discord channel using Gateway WebSocket for receiving messages
/// and REST API for sending messages.
pub struct DiscordChannel {
    config: DiscordConfig,
    client: Client,
    inbound_tx: mpsc::Sender<DirectMessage>,
    /// Bot user id, learned from the READY dispatch.
    bot_user_id: Mutex<Option<String>>,
    /// Sender into the live gateway connection, when one exists.
    gateway_tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig, inbound_tx: mpsc::Sender<DirectMessage>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Channel(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            inbound_tx,
            bot_user_id: Mutex::new(None),
            gateway_tx: Mutex::new(None),
        })
    }

    fn is_allowed(&self, user_id: &str) -> bool {
        let allow_from = &self.config.allow_from;
        if allow_from.is_empty() {
            return true;
        }
        allow_from.iter().any(|allowed| allowed == user_id)
    }

    /// Get the Gateway WebSocket URL from Discord.
    async fn get_gateway_url(&self) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/gateway/bot", DISCORD_API_BASE))
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Failed to get Discord gateway: {}", e)))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Channel(format!("Failed to parse gateway response: {}", e)))?;

        body.get("url")
            .and_then(|v| v.as_str())
            .map(|s| format!("{}/?v=10&encoding=json", s))
            .ok_or_else(|| Error::Channel("No gateway URL in response".to_string()))
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        if !self.config.enabled {
            info!("Discord channel disabled");
            return;
        }

        if self.config.bot_token.is_empty() {
            warn!("Discord bot token not configured");
            return;
        }

        info!("Discord channel starting");

        loop {
            tokio::select! {
                result = self.connect_and_run() => {
                    match result {
                        Ok(_) => {
                            info!("Discord connection closed normally");
                        }
                        Err(e) => {
                            error!(error = %e, "Discord connection error, reconnecting in 5s");
                        }
                    }
                    *self.gateway_tx.lock().await = None;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = shutdown.recv() => {
                            info!("Discord channel shutting down");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Discord channel shutting down");
                    break;
                }
            }
        }
    }

    async fn connect_and_run(&self) -> Result<()> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

        let gateway_url = self.get_gateway_url().await?;
        info!(url = %gateway_url, "Connecting to Discord Gateway");

        let url = url::Url::parse(&gateway_url)
            .map_err(|e| Error::Channel(format!("Invalid gateway URL: {}", e)))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::Channel(format!("WebSocket connection failed: {}", e)))?;

        info!("Connected to Discord Gateway");

        let (mut write, mut read) = ws_stream.split();
        let sequence: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let mut heartbeat_interval_ms: u64 = 41250; // Default

        // Read the first message (should be Hello with heartbeat_interval)
        if let Some(Ok(WsMessage::Text(text))) = read.next().await {
            if let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) {
                if payload.op == GATEWAY_HELLO {
                    if let Some(d) = &payload.d {
                        if let Some(interval) = d.get("heartbeat_interval").and_then(|v| v.as_u64())
                        {
                            heartbeat_interval_ms = interval;
                            debug!(interval_ms = interval, "Received Hello with heartbeat interval");
                        }
                    }
                }
            }
        }

        // Send Identify
        // Intents: GUILDS (1<<0) | GUILD_MESSAGES (1<<9) | DIRECT_MESSAGES (1<<12) | MESSAGE_CONTENT (1<<15)
        let intents: u64 = (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15);
        let identify = GatewayIdentify {
            op: GATEWAY_IDENTIFY,
            d: IdentifyData {
                token: self.config.bot_token.clone(),
                intents,
                properties: IdentifyProperties {
                    os: std::env::consts::OS.to_string(),
                    browser: "pagebridge".to_string(),
                    device: "pagebridge".to_string(),
                },
            },
        };

        let identify_json = serde_json::to_string(&identify)
            .map_err(|e| Error::Channel(format!("Failed to serialize identify: {}", e)))?;
        write
            .send(WsMessage::Text(identify_json))
            .await
            .map_err(|e| Error::Channel(format!("Failed to send identify: {}", e)))?;

        info!("Sent Identify to Discord Gateway");

        // Outbound gateway frames: heartbeats plus caller-supplied
        // payloads such as presence updates.
        let (gateway_tx, mut gateway_rx) = mpsc::channel::<String>(8);
        *self.gateway_tx.lock().await = Some(gateway_tx.clone());

        let heartbeat_handle = tokio::spawn({
            let interval = Duration::from_millis(heartbeat_interval_ms);
            let sequence = sequence.clone();
            async move {
                loop {
                    tokio::time::sleep(interval).await;

                    let seq = {
                        let guard = sequence.lock().await;
                        *guard
                    };

                    let hb = GatewayHeartbeat {
                        op: GATEWAY_HEARTBEAT,
                        d: seq,
                    };
                    if let Ok(json) = serde_json::to_string(&hb) {
                        if gateway_tx.send(json).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) {
                                // Update sequence number
                                if let Some(s) = payload.s {
                                    let mut guard = sequence.lock().await;
                                    *guard = Some(s);
                                }

                                match payload.op {
                                    op if op == GATEWAY_DISPATCH => {
                                        if let Err(e) = self.handle_dispatch(&payload.t, payload.d).await {
                                            error!(error = %e, "Failed to handle Discord dispatch");
                                        }
                                    }
                                    op if op == GATEWAY_HEARTBEAT_ACK => {
                                        debug!("Heartbeat ACK received");
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            info!("Discord Gateway closed connection");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break;
                        }
                        None => {
                            info!("Discord WebSocket stream ended");
                            break;
                        }
                        _ => {}
                    }
                }
                Some(frame) = gateway_rx.recv() => {
                    if let Err(e) = write.send(WsMessage::Text(frame)).await {
                        error!(error = %e, "Failed to send gateway frame");
                        break;
                    }
                }
            }
        }

        heartbeat_handle.abort();
        Ok(())
    }

    async fn handle_dispatch(
        &self,
        event_type: &Option<String>,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        let (Some(event_type), Some(data)) = (event_type.as_deref(), data) else {
            return Ok(());
        };
        match event_type {
            "READY" => {
                let bot_id = data
                    .get("user")
                    .and_then(|u| u.get("id"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
                if let Some(id) = &bot_id {
                    info!(bot_id = %id, "Discord gateway ready");
                }
                *self.bot_user_id.lock().await = bot_id;
            }
            "MESSAGE_CREATE" => self.handle_message_create(data).await?,
            _ => {}
        }
        Ok(())
    }

    async fn handle_message_create(&self, data: serde_json::Value) -> Result<()> {
        let msg: WireMessage = serde_json::from_value(data)
            .map_err(|e| Error::Channel(format!("Failed to parse Discord message: {}", e)))?;

        if !self.is_allowed(&msg.author.id) {
            debug!(user_id = %msg.author.id, "Discord user not in allowlist, ignoring");
            return Ok(());
        }

        if msg.content.is_empty() && msg.attachments.is_empty() {
            return Ok(());
        }

        let bot_id = self.bot_user_id.lock().await.clone();
        let direct = to_direct_message(msg, bot_id.as_deref());

        self.inbound_tx
            .send(direct)
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;

        Ok(())
    }

    /// Advertise the live relay-session count on the bot's presence.
    pub async fn update_presence(&self, active_sessions: usize) -> Result<()> {
        let frame = presence_frame(active_sessions);
        let tx = self.gateway_tx.lock().await.clone();
        match tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|e| Error::Channel(format!("presence update: {}", e))),
            None => Err(Error::Channel("gateway not connected".to_string())),
        }
    }
}

fn to_direct_message(msg: WireMessage, bot_id: Option<&str>) -> DirectMessage {
    let mentions_bot = match bot_id {
        Some(bot_id) => msg.mentions.iter().any(|u| u.id == bot_id),
        None => false,
    };
    DirectMessage {
        message_id: msg.id,
        author_id: msg.author.id,
        author_name: msg.author.username,
        channel_id: msg.channel_id,
        content: msg.content,
        attachments: msg.attachments.into_iter().filter_map(|a| a.url).collect(),
        is_dm: msg.guild_id.is_none(),
        mentions_bot,
        author_is_bot: msg.author.bot.unwrap_or(false),
        received_at: chrono::Utc::now(),
    }
}

fn presence_frame(active_sessions: usize) -> String {
    serde_json::json!({
        "op": GATEWAY_PRESENCE_UPDATE,
        "d": {
            "since": null,
            "activities": [{
                "name": format!("{} active session{}", active_sessions,
                                if active_sessions == 1 { "" } else { "s" }),
                "type": 0
            }],
            "status": "online",
            "afk": false
        }
    })
    .to_string()
}

/// REST client for replies, typing indicators, and DM channels.
#[derive(Clone)]
pub struct DiscordRest {
    client: Client,
    token: String,
}

impl DiscordRest {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Channel(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            token: config.bot_token.clone(),
        })
    }

    /// Send a message. Discord caps messages at 2000 characters, so long
    /// texts are split at newline boundaries.
    pub async fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        #[derive(Serialize)]
        struct CreateMessage<'a> {
            content: &'a str,
        }

        let chunks = split_message(text, 2000);

        for chunk in &chunks {
            let request = CreateMessage { content: chunk };

            let response = self
                .client
                .post(format!("{}/channels/{}/messages", DISCORD_API_BASE, channel_id))
                .header("Authorization", format!("Bot {}", self.token))
                .json(&request)
                .send()
                .await
                .map_err(|e| Error::Channel(format!("Failed to send Discord message: {}", e)))?;

            if !response.status().is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Channel(format!("Discord API error: {}", body)));
            }

            // Small delay between chunks to avoid rate limiting
            if chunks.len() > 1 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        Ok(())
    }

    /// Show the typing indicator in a channel (auto-expires server side).
    pub async fn trigger_typing(&self, channel_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/channels/{}/typing", DISCORD_API_BASE, channel_id))
            .header("Authorization", format!("Bot {}", self.token))
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Failed to trigger typing: {}", e)))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!("Discord API error: {}", body)));
        }
        Ok(())
    }

    /// Open (or fetch) the DM channel with a user, returning its id.
    pub async fn create_dm(&self, user_id: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/users/@me/channels", DISCORD_API_BASE))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&serde_json::json!({ "recipient_id": user_id }))
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Failed to create DM: {}", e)))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Channel(format!("Failed to parse DM response: {}", e)))?;

        body.get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::Channel("No channel id in DM response".to_string()))
    }
}

/// Split a message into chunks at newline boundaries, respecting a max length.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // The byte limit may land inside a multi-byte character; back off
        // to the nearest char boundary before slicing.
        let boundary = floor_char_boundary(remaining, max_len);

        // Try to split at a newline within the limit
        let split_at = remaining[..boundary]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(boundary);

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    chunks
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(json: &str) -> WireMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_dm_message_maps_to_direct() {
        let msg = wire(
            r#"{
            "id": "123456",
            "content": "hello world",
            "author": {"id": "789", "username": "testuser"},
            "channel_id": "456",
            "attachments": [{"url": "https://cdn.example.com/pic.png"}]
        }"#,
        );
        let direct = to_direct_message(msg, Some("bot1"));
        assert!(direct.is_dm);
        assert!(!direct.mentions_bot);
        assert!(!direct.author_is_bot);
        assert_eq!(direct.attachments, vec!["https://cdn.example.com/pic.png"]);
    }

    #[test]
    fn test_guild_mention_detected() {
        let msg = wire(
            r#"{
            "id": "1",
            "content": "<@bot1> hi",
            "author": {"id": "789"},
            "channel_id": "456",
            "guild_id": "g1",
            "mentions": [{"id": "bot1", "bot": true}]
        }"#,
        );
        let direct = to_direct_message(msg, Some("bot1"));
        assert!(!direct.is_dm);
        assert!(direct.mentions_bot);
    }

    #[test]
    fn test_bot_author_flagged() {
        let msg = wire(
            r#"{
            "id": "1",
            "content": "bot message",
            "author": {"id": "789", "bot": true},
            "channel_id": "456"
        }"#,
        );
        assert!(to_direct_message(msg, None).author_is_bot);
    }

    #[test]
    fn test_split_message_prefers_newlines() {
        let text = format!("{}\n{}", "a".repeat(1500), "b".repeat(1000));
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 1501);
        assert!(chunks.iter().all(|c| c.len() <= 2000));
    }

    #[test]
    fn test_split_message_hard_break_without_newline() {
        let text = "x".repeat(4100);
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 100);
    }

    #[test]
    fn test_split_message_multibyte_at_boundary() {
        // A four-byte emoji straddling the byte limit must not be sliced
        // through.
        let text = format!("{}😀", "a".repeat(1999));
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 1999);
        assert_eq!(chunks[1], "😀");
        assert!(chunks.iter().all(|c| c.len() <= 2000));
    }

    #[test]
    fn test_split_message_all_multibyte() {
        let text = "😀".repeat(1000); // 4000 bytes
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() == 500));
    }

    #[test]
    fn test_presence_frame_shape() {
        let frame: serde_json::Value = serde_json::from_str(&presence_frame(2)).unwrap();
        assert_eq!(frame["op"], 3);
        assert_eq!(frame["d"]["activities"][0]["name"], "2 active sessions");
    }
}
