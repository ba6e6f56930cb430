use anyhow::{Context, Result};
use bibliotek::config::{Config, resolve_paths};
use bibliotek::db::Database;
use clap::Parser;
use rand::RngCore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bibliotek-token")]
#[command(about = "Create a device sync token, creating the user if needed")]
struct Cli {
    /// Name of the user the token belongs to
    user: String,
    #[arg(short = 'c', long = "config")]
    config_path: Option<String>,
}

fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let (config_path, data_dir) = resolve_paths(cli.config_path);
    std::fs::create_dir_all(&data_dir).with_context(|| format!("failed to create {}", data_dir.display()))?;

    let cfg = Config::new(&config_path.to_string_lossy())
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    let db = Database::new(&cfg, &data_dir).await.context("failed to open database")?;

    let user = match db.find_user_by_name(&cli.user).await? {
        Some(user) => user,
        None => db.create_user(&cli.user).await?,
    };

    let token = generate_token();
    db.create_token(user.id, &token).await?;
    db.sync().await?;

    tracing::info!(user_id = user.id, "created device token");
    println!("{token}");
    Ok(())
}
