//! Routes Discord traffic to the relay engine and relay events back out.
//!
//! One dispatcher instance serves every user. Login commands run in their
//! own tasks because a login drives a whole browser and can take seconds;
//! ordinary DM text just lands in the outbound queues and returns
//! immediately.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pagebridge_channels::{DirectMessage, DiscordChannel, DiscordRest};
use pagebridge_core::MessageContent;
use pagebridge_relay::{
    media, start_session, Authenticator, EndReason, LoginOutcome, RelayDeps, RelayEvent,
};

const USAGE: &str = "Commands:\n\
    `!login <email> <password>` - log in and start your session\n\
    `!logout` - end your session\n\
    Anything else you send here is relayed into your session.";

#[derive(Debug, PartialEq, Eq)]
enum BridgeCommand {
    Login { email: String, password: String },
    Logout,
    Help,
    Unknown,
}

fn parse_command(content: &str) -> Option<BridgeCommand> {
    let content = content.trim();
    if !content.starts_with('!') {
        return None;
    }
    let mut parts = content.split_whitespace();
    let command = parts.next().unwrap_or("");
    Some(match command {
        "!login" => match (parts.next(), parts.next()) {
            (Some(email), Some(password)) if parts.next().is_none() => BridgeCommand::Login {
                email: email.to_string(),
                password: password.to_string(),
            },
            _ => BridgeCommand::Unknown,
        },
        "!logout" => BridgeCommand::Logout,
        "!help" => BridgeCommand::Help,
        _ => BridgeCommand::Unknown,
    })
}

/// Flatten page message content into a Discord-sendable string. `None`
/// means there is nothing worth forwarding.
fn render_content(content: &MessageContent) -> Option<String> {
    match content {
        MessageContent::Text { text } => Some(text.clone()),
        MessageContent::Images { text, images } => {
            let mut out = text.clone();
            for url in images {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(url);
            }
            (!out.is_empty()).then_some(out)
        }
        MessageContent::ServiceMessage { text }
        | MessageContent::VoiceRecord { text }
        | MessageContent::VoiceRecognized { text } => (!text.is_empty()).then(|| text.clone()),
        MessageContent::Achievement {
            text,
            achievement_description,
        } => {
            let mut out = text.clone();
            if !achievement_description.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(achievement_description);
            }
            (!out.is_empty()).then_some(out)
        }
        MessageContent::Unknown => None,
    }
}

pub struct Dispatcher {
    channel: Arc<DiscordChannel>,
    rest: DiscordRest,
    deps: RelayDeps,
    auth: Authenticator,
    media_dir: PathBuf,
    max_media_bytes: u64,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<DiscordChannel>,
        rest: DiscordRest,
        deps: RelayDeps,
        auth: Authenticator,
        media_dir: PathBuf,
        max_media_bytes: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            rest,
            deps,
            auth,
            media_dir,
            max_media_bytes,
        })
    }

    /// Consume inbound Discord messages until the channel closes.
    /// Messages are handled in arrival order; spawning a task per message
    /// would let a slow attachment download reorder one user's texts.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<DirectMessage>) {
        while let Some(msg) = inbound.recv().await {
            if let Err(e) = self.clone().handle(msg).await {
                error!(error = %e, "failed to handle inbound message");
            }
        }
        info!("inbound channel closed, dispatcher stopping");
    }

    async fn handle(self: Arc<Self>, msg: DirectMessage) -> pagebridge_core::Result<()> {
        if msg.author_is_bot {
            return Ok(());
        }

        if !msg.is_dm {
            // In guilds the bot only reacts to being mentioned, and only
            // by moving the conversation to a DM.
            if msg.mentions_bot {
                let dm_channel = self.rest.create_dm(&msg.author_id).await?;
                self.rest
                    .send_message(&dm_channel, &format!("Hi! Talk to me here.\n\n{}", USAGE))
                    .await?;
            }
            return Ok(());
        }

        match parse_command(&msg.content) {
            Some(BridgeCommand::Login { email, password }) => {
                // A login drives a whole browser and can take seconds;
                // run it off the inbound loop so other users aren't held up.
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.handle_login(msg, email, password).await {
                        error!(error = %e, "login handling failed");
                    }
                });
                Ok(())
            }
            Some(BridgeCommand::Logout) => self.handle_logout(msg).await,
            Some(BridgeCommand::Help) | Some(BridgeCommand::Unknown) => {
                self.rest.send_message(&msg.channel_id, USAGE).await
            }
            None => self.handle_relay(msg).await,
        }
    }

    async fn handle_login(
        &self,
        msg: DirectMessage,
        email: String,
        password: String,
    ) -> pagebridge_core::Result<()> {
        self.rest
            .send_message(&msg.channel_id, "Logging in, give me a moment...")
            .await?;

        let outcome = self
            .auth
            .login(&self.deps.pool, &self.deps.registry, &msg.author_id, &email, &password)
            .await?;

        let reply = match outcome {
            LoginOutcome::Success => "Logged in. Your session is starting.",
            LoginOutcome::WrongUsername => "That account doesn't seem to exist. Check the email.",
            LoginOutcome::WrongPassword => "Wrong password.",
            LoginOutcome::Inconclusive => {
                "The login page didn't respond in time, so I can't tell whether \
                 the credentials are valid. Try again in a bit."
            }
        };
        self.rest.send_message(&msg.channel_id, reply).await?;

        if outcome == LoginOutcome::Success {
            let events = start_session(self.deps.clone(), msg.author_id.clone());
            self.spawn_event_consumer(msg.channel_id.clone(), events);
            self.refresh_presence().await;
        }
        Ok(())
    }

    async fn handle_logout(&self, msg: DirectMessage) -> pagebridge_core::Result<()> {
        let reply = if self.deps.registry.remove(&msg.author_id).await {
            // The relay loop notices the removal within one cycle.
            "Logging you out."
        } else {
            "You're not logged in."
        };
        self.rest.send_message(&msg.channel_id, reply).await
    }

    async fn handle_relay(&self, msg: DirectMessage) -> pagebridge_core::Result<()> {
        if !self.deps.registry.has_session(&msg.author_id).await {
            self.rest
                .send_message(
                    &msg.channel_id,
                    &format!("You're not logged in.\n\n{}", USAGE),
                )
                .await?;
            return Ok(());
        }

        for url in &msg.attachments {
            match media::download_image(url, &self.media_dir, self.max_media_bytes).await {
                Ok(path) => {
                    self.deps.queues.push_image(&msg.author_id, path).await;
                }
                Err(e) => {
                    warn!(url, error = %e, "attachment rejected");
                    self.rest
                        .send_message(
                            &msg.channel_id,
                            &format!("Couldn't take that attachment: {}", e),
                        )
                        .await?;
                }
            }
        }

        let text = msg.content.trim();
        if !text.is_empty() {
            self.deps.queues.push_text(&msg.author_id, text.to_string()).await;
        }
        Ok(())
    }

    /// Forward relay events for one session into its DM channel.
    fn spawn_event_consumer(&self, channel_id: String, mut events: mpsc::Receiver<RelayEvent>) {
        let rest = self.rest.clone();
        let channel = self.channel.clone();
        let registry = self.deps.registry.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let result = match event {
                    RelayEvent::Ready => rest.send_message(&channel_id, "Session connected.").await,
                    RelayEvent::Typing(true) => rest.trigger_typing(&channel_id).await,
                    // Discord's typing indicator expires on its own.
                    RelayEvent::Typing(false) => Ok(()),
                    RelayEvent::Message(content) => match render_content(&content) {
                        Some(text) => rest.send_message(&channel_id, &text).await,
                        None => Ok(()),
                    },
                    RelayEvent::Ended(reason) => {
                        let text = match reason {
                            EndReason::LoggedOut => "Session ended. See you!",
                            EndReason::SessionExpired => {
                                "Your saved session has expired. Please `!login` again."
                            }
                            EndReason::Failed => {
                                "Your session hit repeated errors and was shut down. \
                                 Please `!login` again."
                            }
                        };
                        let result = rest.send_message(&channel_id, text).await;
                        let count = registry.active_users().await.len();
                        if let Err(e) = channel.update_presence(count).await {
                            warn!(error = %e, "presence update failed");
                        }
                        result
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "failed to forward relay event");
                }
            }
        });
    }

    async fn refresh_presence(&self) {
        let count = self.deps.registry.active_users().await.len();
        if let Err(e) = self.channel.update_presence(count).await {
            warn!(error = %e, "presence update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagebridge_core::config::{DiscordConfig, TargetConfig};
    use pagebridge_relay::{AuthArtifacts, BrowserPool, OutboundQueues, SessionRegistry};

    fn test_dispatcher() -> (Arc<Dispatcher>, RelayDeps) {
        let discord = DiscordConfig::default();
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let channel = Arc::new(DiscordChannel::new(discord.clone(), inbound_tx).unwrap());
        let rest = DiscordRest::new(&discord).unwrap();
        let deps = RelayDeps {
            pool: Arc::new(BrowserPool::new(Default::default(), std::env::temp_dir())),
            registry: SessionRegistry::new(),
            queues: OutboundQueues::new(),
            target: TargetConfig::default(),
        };
        let auth = Authenticator::new(deps.target.clone());
        let dispatcher = Dispatcher::new(
            channel,
            rest,
            deps.clone(),
            auth,
            std::env::temp_dir(),
            1024,
        );
        (dispatcher, deps)
    }

    fn dm(author: &str, content: &str) -> DirectMessage {
        DirectMessage {
            message_id: "1".to_string(),
            author_id: author.to_string(),
            author_name: None,
            channel_id: "c1".to_string(),
            content: content.to_string(),
            attachments: Vec::new(),
            is_dm: true,
            mentions_bot: false,
            author_is_bot: false,
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dm_texts_enqueue_in_arrival_order() {
        let (dispatcher, deps) = test_dispatcher();
        deps.registry.register("u1", AuthArtifacts::default()).await;

        // Awaited back to back, exactly as the inbound loop does it.
        dispatcher.clone().handle(dm("u1", "first")).await.unwrap();
        dispatcher.clone().handle(dm("u1", "second")).await.unwrap();

        let drained = deps.queues.drain_texts("u1").await;
        assert_eq!(
            drained.iter().map(|i| i.content.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
    }

    #[tokio::test]
    async fn test_bot_authors_are_ignored() {
        let (dispatcher, deps) = test_dispatcher();
        deps.registry.register("u1", AuthArtifacts::default()).await;

        let mut msg = dm("u1", "from a bot");
        msg.author_is_bot = true;
        dispatcher.clone().handle(msg).await.unwrap();

        assert!(!deps.queues.has_pending("u1").await);
    }

    #[test]
    fn test_parse_login() {
        assert_eq!(
            parse_command("!login me@example.com hunter2"),
            Some(BridgeCommand::Login {
                email: "me@example.com".to_string(),
                password: "hunter2".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_login_wrong_arity() {
        assert_eq!(parse_command("!login me@example.com"), Some(BridgeCommand::Unknown));
        assert_eq!(
            parse_command("!login a b c"),
            Some(BridgeCommand::Unknown)
        );
    }

    #[test]
    fn test_parse_logout_and_help() {
        assert_eq!(parse_command("!logout"), Some(BridgeCommand::Logout));
        assert_eq!(parse_command("  !help  "), Some(BridgeCommand::Help));
        assert_eq!(parse_command("!frobnicate"), Some(BridgeCommand::Unknown));
    }

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn test_render_text_and_unknown() {
        let text = MessageContent::Text { text: "hi".to_string() };
        assert_eq!(render_content(&text), Some("hi".to_string()));
        assert_eq!(render_content(&MessageContent::Unknown), None);
    }

    #[test]
    fn test_render_images_appends_urls() {
        let content = MessageContent::Images {
            text: "look".to_string(),
            images: vec!["https://cdn.example.com/a.png".to_string()],
        };
        assert_eq!(
            render_content(&content),
            Some("look\nhttps://cdn.example.com/a.png".to_string())
        );
    }

    #[test]
    fn test_render_empty_service_message_is_dropped() {
        let content = MessageContent::ServiceMessage { text: String::new() };
        assert_eq!(render_content(&content), None);
    }
}
