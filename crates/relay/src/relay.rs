//! The per-user session relay loop.
//!
//! One spawned job per logged-in user: restores the captured login state
//! into a fresh browser, verifies the page still honors it, then cycles
//! at a fixed interval draining that user's outbound queues while an
//! observer forwards the page's own traffic back out as events. The loop
//! holds no kill switch; it stops when its registry record disappears.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use pagebridge_core::{config::TargetConfig, MessageContent, Result};

use crate::browser::BrowserContext;
use crate::cdp::CdpClient;
use crate::observer::{MessageObserver, PageSignal, PollObserver, SocketObserver};
use crate::pool::BrowserPool;
use crate::queue::OutboundQueues;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The registry record was removed (logout or replacement).
    LoggedOut,
    /// The restored login state no longer authenticates.
    SessionExpired,
    /// Repeated page errors exhausted the recovery budget.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// The session is restored and the loop is consuming queues.
    Ready,
    Typing(bool),
    /// A message from the far side of the page.
    Message(MessageContent),
    Ended(EndReason),
}

/// Everything a relay job needs, shared across all jobs.
#[derive(Clone)]
pub struct RelayDeps {
    pub pool: Arc<BrowserPool>,
    pub registry: SessionRegistry,
    pub queues: OutboundQueues,
    pub target: TargetConfig,
}

/// Spawn the relay job for `user_id` and hand back its event stream.
/// Returns as soon as the job is scheduled; `Ready` (or an `Ended`)
/// arrives over the channel.
pub fn start_session(deps: RelayDeps, user_id: String) -> mpsc::Receiver<RelayEvent> {
    let (events, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let Some(record) = deps.registry.get(&user_id).await else {
            warn!(user_id, "no session record, nothing to relay");
            let _ = events.send(RelayEvent::Ended(EndReason::LoggedOut)).await;
            return;
        };
        let generation = record.generation;
        if let Err(e) = run_session(&deps, &user_id, generation, &events).await {
            error!(user_id, error = %e, "relay session aborted");
            let _ = events.send(RelayEvent::Ended(EndReason::Failed)).await;
            cleanup_session(&deps, &user_id, generation).await;
        }
    });
    rx
}

/// Tear down this loop's registry record and queued items. A successor
/// session for the same user owns a newer generation; its record and its
/// freshly queued items must survive the old loop's exit.
async fn cleanup_session(deps: &RelayDeps, user_id: &str, generation: u64) {
    let removed = deps.registry.remove_if_generation(user_id, generation).await;
    if removed || !deps.registry.has_session(user_id).await {
        deps.queues.discard_user(user_id).await;
    }
}

async fn run_session(
    deps: &RelayDeps,
    user_id: &str,
    generation: u64,
    events: &mpsc::Sender<RelayEvent>,
) -> Result<()> {
    let lease = deps.pool.acquire(user_id).await?;
    let end = match relay_on_context(deps, user_id, generation, lease.context(), events).await {
        Ok(end) => end,
        Err(e) => {
            lease.close().await;
            return Err(e);
        }
    };

    cleanup_session(deps, user_id, generation).await;
    lease.close().await;
    info!(user_id, reason = ?end, "relay session ended");
    let _ = events.send(RelayEvent::Ended(end)).await;
    Ok(())
}

async fn relay_on_context(
    deps: &RelayDeps,
    user_id: &str,
    generation: u64,
    context: &BrowserContext,
    events: &mpsc::Sender<RelayEvent>,
) -> Result<EndReason> {
    let target = &deps.target;
    let page = context.attach_page().await?;

    // Restore the captured login state, then reload so the app boots
    // with it in place.
    page.navigate(&target.base_url).await?;
    let artifacts = deps
        .registry
        .artifacts(user_id)
        .await
        .unwrap_or_default();
    page.set_cookies(&artifacts.cookies).await?;
    page.local_storage_restore(&artifacts.local_storage).await?;
    page.reload().await?;

    let auth_window = Duration::from_millis(target.auth_timeout_ms);
    if !page.wait_for_selector(&target.selectors.message_input, auth_window).await? {
        warn!(user_id, "restored state no longer authenticates");
        return Ok(EndReason::SessionExpired);
    }

    let _ = events.send(RelayEvent::Ready).await;
    info!(user_id, observer = %target.observer, "relay session ready");

    let forwarder = spawn_observer(&page, target, events.clone()).await;

    let interval = Duration::from_millis(target.poll_interval_ms);
    let mut consecutive_failures: u32 = 0;
    let end = loop {
        if !deps.registry.is_active(user_id, generation).await {
            break EndReason::LoggedOut;
        }
        match run_cycle(&page, deps, user_id).await {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    user_id,
                    error = %e,
                    attempt = consecutive_failures,
                    "cycle failed, reloading page"
                );
                if consecutive_failures >= target.max_recovery_attempts {
                    error!(user_id, "recovery budget exhausted");
                    break EndReason::Failed;
                }
                if let Err(e) = page.reload().await {
                    warn!(user_id, error = %e, "recovery reload failed");
                }
            }
        }
        // Fixed throttle between cycles keeps the page responsive.
        tokio::time::sleep(interval).await;
    };

    forwarder.abort();
    Ok(end)
}

/// One drain pass: images first, then texts, both strictly FIFO within
/// this user's slice of the queues.
async fn run_cycle(page: &CdpClient, deps: &RelayDeps, user_id: &str) -> Result<()> {
    let target = &deps.target;
    let selectors = &target.selectors;

    let pending = deps.queues.pending_images(user_id).await;
    if !pending.is_empty() {
        let upload_window = Duration::from_millis(target.upload_wait_ms);
        if page.wait_for_selector(&selectors.upload_input, upload_window).await? {
            for item in pending {
                let path = item.path.to_string_lossy().into_owned();
                page.set_file_input(&selectors.upload_input, vec![path]).await?;
                // Let the page finish its own upload before moving on.
                tokio::time::sleep(Duration::from_millis(target.upload_settle_ms)).await;
                deps.queues.mark_uploaded(item.id).await;
                debug!(user_id, image = item.id, "image handed to page");
            }
            deps.queues.sweep_uploaded(user_id).await;
        } else {
            // No upload control right now; leave the items queued for the
            // next cycle.
            debug!(user_id, "upload control absent, deferring images");
        }
    }

    for item in deps.queues.drain_texts(user_id).await {
        page.fill_selector(&selectors.message_input, &item.content).await?;
        page.press_enter().await?;
        debug!(user_id, chars = item.content.len(), "text relayed to page");
    }

    Ok(())
}

/// Run the configured observer in its own task, translating page signals
/// into relay events until the page or the event channel goes away.
async fn spawn_observer(
    page: &CdpClient,
    target: &TargetConfig,
    events: mpsc::Sender<RelayEvent>,
) -> tokio::task::JoinHandle<()> {
    let mut observer: Box<dyn MessageObserver> = if target.observer == "poll" {
        Box::new(PollObserver::new(page.clone(), target))
    } else {
        Box::new(SocketObserver::new(page).await)
    };
    tokio::spawn(async move {
        while let Some(signal) = observer.next().await {
            let event = match signal {
                PageSignal::Typing(on) => RelayEvent::Typing(on),
                PageSignal::Incoming(message) => RelayEvent::Message(message.content),
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AuthArtifacts;

    #[tokio::test]
    async fn test_session_without_record_ends_logged_out() {
        let deps = RelayDeps {
            pool: Arc::new(BrowserPool::new(Default::default(), std::env::temp_dir())),
            registry: SessionRegistry::new(),
            queues: OutboundQueues::new(),
            target: TargetConfig::default(),
        };
        let mut rx = start_session(deps, "nobody".to_string());
        assert_eq!(rx.recv().await, Some(RelayEvent::Ended(EndReason::LoggedOut)));
    }

    #[tokio::test]
    async fn test_failed_session_cleans_registry_and_queues() {
        // No browser binary in the test environment, so the pool acquire
        // fails and the job must tear everything down.
        let registry = SessionRegistry::new();
        let queues = OutboundQueues::new();
        registry.register("u1", AuthArtifacts::default()).await;
        queues.push_text("u1", "queued".to_string()).await;

        let config = pagebridge_core::config::BrowserConfig {
            binary: Some("/nonexistent/chromium-for-tests".to_string()),
            ..Default::default()
        };
        let deps = RelayDeps {
            pool: Arc::new(BrowserPool::new(config, std::env::temp_dir())),
            registry: registry.clone(),
            queues: queues.clone(),
            target: TargetConfig::default(),
        };
        let mut rx = start_session(deps, "u1".to_string());
        assert_eq!(rx.recv().await, Some(RelayEvent::Ended(EndReason::Failed)));
        assert!(!registry.has_session("u1").await);
        assert!(!queues.has_pending("u1").await);
    }

    #[tokio::test]
    async fn test_cleanup_spares_successor_session() {
        let deps = RelayDeps {
            pool: Arc::new(BrowserPool::new(Default::default(), std::env::temp_dir())),
            registry: SessionRegistry::new(),
            queues: OutboundQueues::new(),
            target: TargetConfig::default(),
        };
        let old = deps.registry.register("u1", AuthArtifacts::default()).await;
        let new = deps.registry.register("u1", AuthArtifacts::default()).await;
        deps.queues.push_text("u1", "for the new session".to_string()).await;

        // The displaced loop's teardown must not touch the successor.
        cleanup_session(&deps, "u1", old).await;
        assert!(deps.registry.is_active("u1", new).await);
        assert!(deps.queues.has_pending("u1").await);

        cleanup_session(&deps, "u1", new).await;
        assert!(!deps.registry.has_session("u1").await);
        assert!(!deps.queues.has_pending("u1").await);
    }
}
