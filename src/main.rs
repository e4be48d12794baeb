//! rssh - expose local services under subdomains of a public root domain
//!
//! `rssh server` runs the broker (control channel, gate allocation, HTTP
//! dispatcher); `rssh agent` connects a local service to a broker.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{ServerArgs, ServerSettings};
use rssh_agent::{AgentClient, AgentConfig, AgentError};
use rssh_auth::{AgentClaims, JwtAuthenticator};
use rssh_control::Executor;
use rssh_router::TunnelRegistry;
use rssh_server_http::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rssh")]
#[command(about = "Reverse tunnel broker: public subdomains for services behind NAT")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the broker
    Server(ServerArgs),

    /// Expose a local service through a broker
    Agent {
        /// Broker control address (host:port)
        #[arg(long, env = "RSSH_SERVER", default_value = "127.0.0.1:2222")]
        server: String,

        /// Agent identity, also the default subdomain label
        #[arg(long, env = "RSSH_AGENT_ID")]
        agent_id: String,

        /// Authentication token (see `rssh generate-token`)
        #[arg(long, env = "RSSH_TOKEN", default_value = "")]
        token: String,

        /// Local service to forward requests to (e.g. 127.0.0.1:3000)
        #[arg(long)]
        local_addr: String,

        /// Subdomain label to request instead of the agent id
        #[arg(long)]
        subdomain: Option<String>,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },

    /// Generate a JWT token for an agent
    GenerateToken {
        /// Secret shared with the broker's --jwt-secret
        #[arg(long, env = "RSSH_JWT_SECRET")]
        secret: String,

        /// Agent the token is issued for
        #[arg(long)]
        agent_id: String,

        /// Validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateToken {
            secret,
            agent_id,
            hours,
        } => generate_token(&secret, &agent_id, hours),
        Commands::Server(args) => {
            init_logging(&cli.log_level)?;
            run_server(args).await
        }
        Commands::Agent {
            server,
            agent_id,
            token,
            local_addr,
            subdomain,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            init_logging(&cli.log_level)?;

            let mut config = AgentConfig::new(server, agent_id, local_addr).with_token(token);
            if let Some(subdomain) = subdomain {
                config = config.with_subdomain(subdomain);
            }

            run_agent(
                config,
                max_reconnect_attempts,
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
            )
            .await
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let file = config::load_config(args.config.as_deref())?;
    let settings = ServerSettings::resolve(&args, file)?;

    info!("🚀 Starting rssh broker for *.{}", settings.root_domain);
    info!("Gate hosts: {}", settings.gate_hosts.join(", "));
    info!("Gate port range: {}", settings.port_range);

    let store = rssh_store::open(&settings.store_endpoints)
        .await
        .context("Failed to open slot store")?;

    let registry = Arc::new(TunnelRegistry::new());
    let mut executor = Executor::new(settings.executor_config(), store, registry)
        .context("Failed to create executor")?;

    match &settings.jwt_secret {
        Some(secret) => {
            executor = executor.with_authenticator(Arc::new(JwtAuthenticator::new(secret.as_bytes())));
            info!("✅ JWT authentication enabled");
        }
        None => warn!("⚠️  No JWT secret configured, any agent may connect"),
    }
    let executor = Arc::new(executor);

    let control = executor.bind_control().await?;

    let dispatcher = Dispatcher::new(settings.dispatcher_config());
    let http = dispatcher.bind().await?;

    let mut control_task = tokio::spawn(executor.clone().serve(control));
    let mut http_task = {
        let registry = executor.registry().clone();
        let shutdown = executor.shutdown_token();
        tokio::spawn(async move { dispatcher.serve(http, registry, shutdown).await })
    };

    info!("Broker running, press Ctrl+C to stop");

    let outcome: Result<()> = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = &mut control_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Control channel failed: {}", e);
                Err(e.into())
            }
            Err(e) => Err(anyhow::anyhow!("Control task panicked: {}", e)),
        },
        result = &mut http_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("HTTP dispatcher failed: {}", e);
                Err(e.into())
            }
            Err(e) => Err(anyhow::anyhow!("Dispatcher task panicked: {}", e)),
        },
    };

    executor.shutdown().await;
    control_task.abort();
    http_task.abort();

    info!("✅ Broker stopped, all gates released");
    outcome
}

/// Keep an agent connected, reconnecting with exponential backoff
async fn run_agent(
    config: AgentConfig,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<()> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                shutdown.cancel();
            }
        });
    }

    info!("Agent ID: {}", config.agent_id);
    info!("Broker: {}", config.server_addr);
    info!("Local service: {}", config.local_addr);

    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;
        if max_attempts > 0 && attempt > max_attempts {
            error!("Maximum reconnection attempts ({}) reached", max_attempts);
            anyhow::bail!("Failed to connect after {} attempts", max_attempts);
        }

        let result = tokio::select! {
            result = AgentClient::connect(config.clone()) => result,
            _ = shutdown.cancelled() => return Ok(()),
        };

        let error = match result {
            Ok(connection) => {
                info!("✅ Tunnel ready: {}", connection.public_url());
                attempt = 0;
                current_delay = initial_delay;

                match connection.run_until(shutdown.clone()).await {
                    Ok(()) => {
                        info!("Agent stopped");
                        return Ok(());
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        if let AgentError::Rejected(reason) = &error {
            error!("Broker rejected agent: {}", reason);
        } else {
            error!("Agent error: {}", error);
        }

        warn!("Reconnecting in {} seconds...", current_delay.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(current_delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
        current_delay = std::cmp::min(current_delay * 2, max_delay);
    }
}

fn generate_token(secret: &str, agent_id: &str, hours: i64) -> Result<()> {
    let claims = AgentClaims::new(agent_id, chrono::Duration::hours(hours));
    let token = JwtAuthenticator::encode(secret.as_bytes(), &claims)
        .map_err(|e| anyhow::anyhow!("Failed to generate token: {}", e))?;

    println!("\n✅ JWT Token generated successfully!\n");
    println!("Agent ID:      {}", agent_id);
    println!("Valid for:     {} hours", hours);
    println!("Expires:       {}", claims.exp_formatted());
    println!("\n{}", "=".repeat(70));
    println!("TOKEN:");
    println!("{}", "=".repeat(70));
    println!("{}", token);
    println!("{}", "=".repeat(70));
    println!("\nUse it with:");
    println!("  rssh agent --agent-id {} --token <TOKEN> --local-addr 127.0.0.1:3000", agent_id);
    println!();

    Ok(())
}
