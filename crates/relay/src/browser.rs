//! Chromium process management.
//!
//! Each context is a dedicated browser process with its own user data
//! directory, so one user's cookies and localStorage never leak into
//! another's page.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use pagebridge_core::{config::BrowserConfig, Error, Result};

use crate::cdp::CdpClient;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(20);

/// A running Chromium instance bound to one relay session.
pub struct BrowserContext {
    child: Child,
    debug_port: u16,
    data_dir: PathBuf,
    http: reqwest::Client,
}

impl BrowserContext {
    /// Launch Chromium with remote debugging on a free port.
    pub async fn launch(config: &BrowserConfig, data_dir: &Path) -> Result<Self> {
        let binary = resolve_binary(config)?;
        let debug_port = free_port().await?;

        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| Error::Browser(format!("create {}: {}", data_dir.display(), e)))?;

        let mut cmd = Command::new(&binary);
        cmd.arg(format!("--remote-debugging-port={}", debug_port))
            .arg(format!("--user-data-dir={}", data_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-extensions")
            .arg("--mute-audio")
            .arg("--window-size=1280,900")
            .arg("about:blank")
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if !config.headed {
            cmd.arg("--headless=new").arg("--disable-gpu");
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Browser(format!("spawn {}: {}", binary.display(), e)))?;

        let ctx = Self {
            child,
            debug_port,
            data_dir: data_dir.to_path_buf(),
            http: reqwest::Client::new(),
        };
        ctx.wait_for_devtools().await?;
        info!(port = debug_port, data_dir = %ctx.data_dir.display(), "browser launched");
        Ok(ctx)
    }

    /// Poll the DevTools HTTP endpoint until the browser answers.
    async fn wait_for_devtools(&self) -> Result<()> {
        let url = format!("http://127.0.0.1:{}/json/version", self.debug_port);
        let start = tokio::time::Instant::now();
        loop {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                _ => {}
            }
            if start.elapsed() >= LAUNCH_TIMEOUT {
                return Err(Error::Timeout("browser devtools endpoint".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Attach to the first page target and enable the domains the relay
    /// needs (Page, Runtime, DOM, Network).
    pub async fn attach_page(&self) -> Result<CdpClient> {
        let url = format!("http://127.0.0.1:{}/json/list", self.debug_port);
        let targets: Vec<Value> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Browser(format!("list targets: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Browser(format!("parse targets: {}", e)))?;

        let ws_url = targets
            .iter()
            .find(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
            .and_then(|t| t.get("webSocketDebuggerUrl"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Browser("no page target".to_string()))?;

        debug!(ws_url, "attaching to page target");
        let client = CdpClient::connect(ws_url).await?;
        for domain in ["Page", "Runtime", "DOM", "Network"] {
            client.enable_domain(domain).await?;
        }
        Ok(client)
    }

    /// Terminate the browser process and wait for it to exit.
    pub async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill browser");
        }
        let _ = self.child.wait().await;
        debug!(data_dir = %self.data_dir.display(), "browser closed");
    }
}

fn resolve_binary(config: &BrowserConfig) -> Result<PathBuf> {
    if let Some(path) = &config.binary {
        return Ok(PathBuf::from(path));
    }
    for name in [
        "chromium",
        "chromium-browser",
        "google-chrome",
        "google-chrome-stable",
        "chrome",
    ] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    Err(Error::Browser(
        "no Chromium binary found; set browser.binary in config".to_string(),
    ))
}

async fn free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Browser(format!("probe free port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Browser(format!("local addr: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}
