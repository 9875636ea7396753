//! chatd - a small broadcast chat server.
//!
//! ## Modes
//!
//! **Server** (`chatd server`): accepts TCP (optionally TLS) connections,
//! registers each client under the name it sends first, and relays every
//! message to all other registered clients.
//!
//! **Chat** (`chatd chat`): line client. Each stdin line is sent as a
//! message; incoming messages print as `author > body`.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatd::client::{Client, ClientError};
use chatd::config::{ConfigError, NameRelease, OverflowPolicy, ServerConfig, TlsFiles};
use chatd::server::{Server, ServerError};

/// chatd - broadcast chat over framed TCP
#[derive(ClapParser, Debug)]
#[command(name = "chatd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the chat server
    Server {
        /// Address to listen on (default 0.0.0.0:50051)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// TOML config file; flags override its values
        #[arg(long, env = "CHATD_CONFIG")]
        config: Option<PathBuf>,

        /// Serve over TLS using --cert-file and --key-file
        #[arg(long, requires = "cert_file", requires = "key_file")]
        tls: bool,

        /// PEM certificate chain
        #[arg(long)]
        cert_file: Option<PathBuf>,

        /// PEM private key
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// What to do when a receiver's queue is full
        #[arg(long, value_enum)]
        overflow: Option<OverflowPolicy>,

        /// Whether a name is freed when its session ends
        #[arg(long, value_enum)]
        name_release: Option<NameRelease>,
    },

    /// Connect to a server and chat from stdin
    Chat {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:50051")]
        server_addr: String,

        /// Display name; read from the first stdin line when omitted
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum ChatdError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ChatdError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            bind,
            config,
            tls,
            cert_file,
            key_file,
            overflow,
            name_release,
        } => {
            init_tracing();
            let mut config = match config {
                Some(path) => ServerConfig::load(&path)?.unwrap_or_default(),
                None => ServerConfig::default(),
            };
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(overflow) = overflow {
                config.overflow = overflow;
            }
            if let Some(name_release) = name_release {
                config.name_release = name_release;
            }
            if tls {
                if let (Some(cert_file), Some(key_file)) = (cert_file, key_file) {
                    config.tls = Some(TlsFiles {
                        cert_file,
                        key_file,
                    });
                }
            }
            run_server(config).await
        }
        Commands::Chat { server_addr, name } => {
            // stdout carries the conversation
            init_tracing_stderr();
            run_chat(server_addr, name).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chatd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chatd=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config: ServerConfig) -> Result<(), ChatdError> {
    tracing::info!(
        overflow = ?config.overflow,
        name_release = ?config.name_release,
        "chatd server starting"
    );

    let server = Server::bind(&config).await?;
    let cancel = CancellationToken::new();
    let serve = tokio::spawn(server.serve(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    serve.await??;
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!(?e, "failed to install SIGTERM handler"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl+C");
}

// ── Chat mode ──────────────────────────────────────────────────────

async fn run_chat(server_addr: String, name: Option<String>) -> Result<(), ChatdError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let name = match name {
        Some(name) => name,
        None => {
            println!("Enter your name:");
            match lines.next_line().await? {
                Some(line) => line,
                None => return Ok(()),
            }
        }
    };

    let stream = Client::connect(&server_addr).await?.register(&name).await?;
    let (mut sender, mut receiver) = stream.split();

    let printer = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(Some(envelope)) => println!("{} > {}", envelope.author, envelope.body),
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    });

    let input = async {
        while let Some(line) = lines.next_line().await? {
            sender.send(&line).await?;
        }
        sender.close().await?;
        Ok::<_, ChatdError>(())
    };

    // A refused name or server shutdown ends the session without waiting on stdin.
    tokio::select! {
        result = input => result,
        printed = printer => {
            printed??;
            Ok(())
        }
    }
}
