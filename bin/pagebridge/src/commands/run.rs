use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use pagebridge_channels::{DiscordChannel, DiscordRest};
use pagebridge_core::{Config, Paths};
use pagebridge_relay::{Authenticator, BrowserPool, OutboundQueues, RelayDeps, SessionRegistry};

use crate::dispatch::Dispatcher;

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = paths.config_file();
    if !config_path.exists() {
        anyhow::bail!(
            "no config at {}; run `pagebridge init` first",
            config_path.display()
        );
    }
    let config = Config::load(&config_path)?;

    if !config.channels.discord.enabled {
        anyhow::bail!("Discord channel is disabled; set channels.discord.enabled = true");
    }
    if config.channels.discord.bot_token.is_empty() {
        anyhow::bail!("channels.discord.botToken is not set");
    }

    let deps = RelayDeps {
        pool: Arc::new(BrowserPool::new(
            config.browser.clone(),
            paths.browser_data_dir(),
        )),
        registry: SessionRegistry::new(),
        queues: OutboundQueues::new(),
        target: config.target.clone(),
    };
    let auth = Authenticator::new(config.target.clone());

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let channel = Arc::new(DiscordChannel::new(
        config.channels.discord.clone(),
        inbound_tx,
    )?);
    let rest = DiscordRest::new(&config.channels.discord)?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let gateway = tokio::spawn(channel.clone().run_loop(shutdown_tx.subscribe()));

    let dispatcher = Dispatcher::new(
        channel,
        rest,
        deps.clone(),
        auth,
        paths.media_dir(),
        config.media.max_bytes,
    );
    let dispatch = tokio::spawn(dispatcher.run(inbound_rx));

    info!("pagebridge running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Pull every session record so the relay loops wind down on their
    // own, then wait for the pool to empty.
    let _ = shutdown_tx.send(());
    for user in deps.registry.active_users().await {
        deps.registry.remove(&user).await;
    }
    if deps.pool.has_active() {
        info!("waiting for active sessions to wind down");
    }
    if let Err(e) = deps.pool.drain_and_close().await {
        warn!(error = %e, "pool drain failed");
    }

    gateway.abort();
    dispatch.abort();
    info!("goodbye");
    Ok(())
}
