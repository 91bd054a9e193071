//! Vestibule CLI - Command line interface.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use reqwest::{header, Client, StatusCode};
use vestibule_auth::SessionCache;
use vestibule_portal::{GatewayConfig, PortalRegistry};

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "vestibule")]
#[command(about = "Vestibule CLI - Manage and inspect authentication portals")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a password for a local user entry
    HashPassword {
        /// Password (or read from stdin if not provided)
        password: Option<String>,
    },
    /// Validate a configuration file and provision its portals
    CheckConfig {
        /// Configuration file path
        #[arg(default_value = "config/vestibule.json", env = "VESTIBULE_CONFIG")]
        path: String,
    },
    /// Show the claims of a session token
    Whoami {
        /// Vestibule server address
        #[arg(long, default_value = "http://localhost:8080", env = "VESTIBULE_ADDR")]
        addr: String,
        /// Session token
        #[arg(long, env = "VESTIBULE_TOKEN")]
        token: String,
        /// Portal mount path
        #[arg(long, default_value = "/auth")]
        portal: String,
    },
}

// ============================================================================
// Command Handlers
// ============================================================================

fn hash_password(password: &str) -> Result<String> {
    if password.is_empty() {
        bail!("Password cannot be empty");
    }
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

fn cmd_hash_password(password: Option<String>) -> Result<()> {
    let password = match password {
        Some(p) => p,
        None => {
            print!("Enter password: ");
            io::stdout().flush()?;
            let stdin = io::stdin();
            let mut line = String::new();
            stdin.lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        },
    };

    println!("{}", hash_password(&password)?);
    Ok(())
}

fn check_config(path: &str) -> Result<PortalRegistry> {
    let config = GatewayConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path))?;
    let sessions = Arc::new(SessionCache::new(Duration::from_secs(
        config.session_ttl_secs,
    )));
    PortalRegistry::from_config(&config, sessions).context("Failed to provision portals")
}

fn cmd_check_config(path: &str) -> Result<()> {
    let registry = check_config(path)?;

    println!("Configuration {} is valid.", path);
    for portal in registry.iter() {
        let marker = if portal.is_primary() { " (primary)" } else { "" };
        println!("  {}{} at {}", portal.name(), marker, portal.auth_url_path());
        for backend in portal.backends() {
            println!(
                "    {}/{} ({})",
                backend.method(),
                backend.realm(),
                backend.name()
            );
        }
    }

    Ok(())
}

async fn cmd_whoami(addr: &str, portal: &str, token: &str) -> Result<()> {
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")?;

    let url = format!(
        "{}{}/whoami",
        addr.trim_end_matches('/'),
        portal.trim_end_matches('/')
    );
    let resp = client
        .get(&url)
        .bearer_auth(token)
        .header(header::ACCEPT, "application/json")
        .send()
        .await
        .context("Failed to connect to server")?;

    match resp.status() {
        StatusCode::OK => {},
        StatusCode::UNAUTHORIZED => bail!("Token is not valid for this portal"),
        status => bail!("Server error: {}", status),
    }

    let claims: serde_json::Value = resp.json().await.context("Failed to parse response")?;
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::HashPassword { password } => cmd_hash_password(password),
        Commands::CheckConfig { path } => cmd_check_config(&path),
        Commands::Whoami {
            addr,
            token,
            portal,
        } => cmd_whoami(&addr, &portal, &token).await,
    }
}
