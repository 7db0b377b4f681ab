use pagebridge_core::{Config, Paths};

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = paths.config_file();

    if config_path.exists() && !force {
        println!("Config already exists: {}", config_path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    std::fs::create_dir_all(paths.media_dir())?;
    std::fs::create_dir_all(paths.browser_data_dir())?;

    let config = Config::default();
    config.save(&config_path)?;

    println!("Wrote default config: {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set channels.discord.botToken in the config");
    println!("  2. Set channels.discord.enabled to true");
    println!("  3. pagebridge run");
    Ok(())
}
