//! Login against the target page.
//!
//! The page reuses one error indicator for both login stages, so the two
//! failure kinds are told apart purely by position in the flow: an error
//! surfacing right after the identifier is submitted is a bad username,
//! one surfacing after the password is a bad password. Once the username
//! stage errors the flow stops; the password is never typed.

use std::time::Duration;

use tracing::{info, warn};

use pagebridge_core::{config::TargetConfig, Result};

use crate::browser::BrowserContext;
use crate::pool::BrowserPool;
use crate::registry::{AuthArtifacts, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    WrongUsername,
    WrongPassword,
    /// Neither the error indicator nor the authenticated state showed up
    /// in time. The credentials may still be valid; the caller decides
    /// whether to retry or report.
    Inconclusive,
}

/// Which stage of the form an error indicator surfaced at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginStage {
    Username,
    Password,
}

fn classify(error_at: Option<LoginStage>, authenticated: bool) -> LoginOutcome {
    match (error_at, authenticated) {
        (Some(LoginStage::Username), _) => LoginOutcome::WrongUsername,
        (Some(LoginStage::Password), _) => LoginOutcome::WrongPassword,
        (None, true) => LoginOutcome::Success,
        (None, false) => LoginOutcome::Inconclusive,
    }
}

pub struct Authenticator {
    target: TargetConfig,
}

impl Authenticator {
    pub fn new(target: TargetConfig) -> Self {
        Self { target }
    }

    /// Walk the two-stage login form. On success, capture cookies and
    /// localStorage and register them for `user_id`, replacing any
    /// previous record. The leased browser is closed either way; no
    /// relay loop is started here.
    pub async fn login(
        &self,
        pool: &BrowserPool,
        registry: &SessionRegistry,
        user_id: &str,
        email: &str,
        password: &str,
    ) -> Result<LoginOutcome> {
        let lease = pool.acquire(user_id).await?;
        let outcome = self.run_login(lease.context(), registry, user_id, email, password).await;
        lease.close().await;
        outcome
    }

    async fn run_login(
        &self,
        context: &BrowserContext,
        registry: &SessionRegistry,
        user_id: &str,
        email: &str,
        password: &str,
    ) -> Result<LoginOutcome> {
        let selectors = &self.target.selectors;
        let error_window = Duration::from_millis(self.target.error_timeout_ms);
        let auth_window = Duration::from_millis(self.target.auth_timeout_ms);

        let page = context.attach_page().await?;
        page.navigate(&self.target.login_url()).await?;
        if !page.wait_for_selector(&selectors.email_field, auth_window).await? {
            warn!(user_id, "login form never appeared");
            return Ok(LoginOutcome::Inconclusive);
        }

        // Username stage.
        page.fill_selector(&selectors.email_field, email).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        page.click_selector(&selectors.advance_button).await?;
        if page.wait_for_selector(&selectors.error_indicator, error_window).await? {
            info!(user_id, "login rejected at username stage");
            return Ok(classify(Some(LoginStage::Username), false));
        }

        // Password stage.
        if !page.wait_for_selector(&selectors.password_field, error_window).await? {
            return Ok(LoginOutcome::Inconclusive);
        }
        page.fill_selector(&selectors.password_field, password).await?;
        page.click_selector(&selectors.advance_button).await?;
        if page.wait_for_selector(&selectors.error_indicator, error_window).await? {
            info!(user_id, "login rejected at password stage");
            return Ok(classify(Some(LoginStage::Password), false));
        }

        // Authenticated state takes noticeably longer than the error
        // indicator, hence the wider window.
        if !page.wait_for_selector(&selectors.message_input, auth_window).await? {
            warn!(user_id, "login outcome inconclusive");
            return Ok(classify(None, false));
        }

        let artifacts = AuthArtifacts {
            cookies: page.get_cookies().await?,
            local_storage: page.local_storage_dump().await?,
        };
        registry.register(user_id, artifacts).await;
        info!(user_id, "login succeeded, session registered");
        Ok(classify(None, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_error_wins_regardless_of_later_state() {
        assert_eq!(
            classify(Some(LoginStage::Username), false),
            LoginOutcome::WrongUsername
        );
        assert_eq!(
            classify(Some(LoginStage::Username), true),
            LoginOutcome::WrongUsername
        );
    }

    #[test]
    fn test_password_error_maps_to_wrong_password() {
        assert_eq!(
            classify(Some(LoginStage::Password), false),
            LoginOutcome::WrongPassword
        );
    }

    #[test]
    fn test_no_indicator_is_inconclusive_not_wrong_password() {
        assert_eq!(classify(None, false), LoginOutcome::Inconclusive);
        assert_eq!(classify(None, true), LoginOutcome::Success);
    }
}
