//! Tandem collaboration server.
//!
//! ```text
//! tandem-server --listen 0.0.0.0:9090 \
//!     --user secret-a:u1:Ada --user secret-b:u2:Grace \
//!     --member u2:roadmap
//! ```

use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use log::info;
use tandem_collab::{CollabServer, ConfigError, ServerConfig, StaticTokens};

/// Real-time presence, edit claims and change fan-out for project workspaces
#[derive(Parser, Debug, Clone)]
#[command(name = "tandem-server")]
#[command(about = "WebSocket collaboration server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TANDEM_LISTEN", default_value = "127.0.0.1:9090")]
    listen: String,

    /// Known users as token:user_id:display name (repeatable)
    #[arg(long = "user", env = "TANDEM_USERS", value_delimiter = ',')]
    users: Vec<String>,

    /// Project memberships as user_id:project_id (repeatable). Users without
    /// any membership may join every project.
    #[arg(long = "member", env = "TANDEM_MEMBERS", value_delimiter = ',')]
    members: Vec<String>,

    /// Events buffered per connection before new ones are dropped for it
    #[arg(long, env = "TANDEM_OUTBOUND_CAPACITY", default_value = "256")]
    outbound_capacity: usize,

    /// WebSocket ping interval in seconds
    #[arg(long, env = "TANDEM_HEARTBEAT_SECS", default_value = "25")]
    heartbeat_secs: u64,

    /// Silent connections are dropped after this many seconds
    #[arg(long, env = "TANDEM_IDLE_TIMEOUT_SECS", default_value = "60")]
    idle_timeout_secs: u64,

    /// Expiry sweep interval in milliseconds
    #[arg(long, env = "TANDEM_SWEEP_MS", default_value = "1000")]
    sweep_ms: u64,

    /// Idle edit claims are released after this many seconds
    #[arg(long, env = "TANDEM_CLAIM_TTL_SECS", default_value = "300")]
    claim_ttl_secs: u64,

    /// Typing indicators expire after this many seconds without a refresh
    #[arg(long, env = "TANDEM_TYPING_TTL_SECS", default_value = "8")]
    typing_ttl_secs: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.listen.clone(),
            outbound_capacity: self.outbound_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_millis(self.sweep_ms),
            claim_ttl: Duration::from_secs(self.claim_ttl_secs),
            typing_ttl: Duration::from_secs(self.typing_ttl_secs),
        }
    }

    fn authenticator(&self) -> Result<StaticTokens, ConfigError> {
        let mut auth = StaticTokens::new();
        for entry in &self.users {
            let (token, user) = StaticTokens::parse_entry(entry)?;
            auth = auth.with_user(token, user);
        }
        for entry in &self.members {
            match entry.split_once(':') {
                Some((user, project)) if !user.is_empty() && !project.is_empty() => {
                    auth = auth.with_membership(user, project);
                }
                _ => return Err(ConfigError::MembershipEntry(entry.clone())),
            }
        }
        Ok(auth)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let auth = args.authenticator()?;
    if auth.is_empty() {
        log::warn!("No users configured; every authenticate request will be rejected");
    }
    info!("Starting tandem-server with {} known user(s)", auth.len());

    let server = CollabServer::new(args.server_config(), Arc::new(auth))?;
    server.run().await?;
    Ok(())
}
