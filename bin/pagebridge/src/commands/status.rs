use pagebridge_core::{Config, Paths};

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("pagebridge status");
    println!("=================");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:   {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found)" }
    );

    if !config_exists {
        println!();
        println!("Run `pagebridge init` to initialize.");
        return Ok(());
    }

    let config = Config::load(&config_path)?;

    // Browser binary
    let browser = match &config.browser.binary {
        Some(path) => format!("{} (configured)", path),
        None => {
            let detected = ["chromium", "chromium-browser", "google-chrome", "google-chrome-stable"]
                .iter()
                .find_map(|name| which::which(name).ok());
            match detected {
                Some(path) => format!("{} (detected)", path.display()),
                None => "✗ (none found; set browser.binary)".to_string(),
            }
        }
    };
    println!("Browser:  {}", browser);
    println!("Sessions: up to {} concurrent", config.browser.max_concurrency);
    println!("Target:   {}", config.target.base_url);
    println!("Observer: {}", config.target.observer);
    println!();

    println!("Discord:");
    println!(
        "  enabled:   {}",
        if config.channels.discord.enabled { "yes" } else { "no" }
    );
    println!(
        "  bot token: {}",
        if config.channels.discord.bot_token.is_empty() {
            "✗ (not set)"
        } else {
            "✓"
        }
    );
    if !config.channels.discord.allow_from.is_empty() {
        println!("  allowlist: {} users", config.channels.discord.allow_from.len());
    }

    Ok(())
}
