//! Going CLI application

use clap::{Parser, Subcommand};
use going::{
    Client, EchoHandler, LoggingHandler, MessageHandler, PeerId, RegistryServer, Result,
    DEFAULT_SERVER_PORT,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "going-cli")]
#[command(about = "Rendezvous server and peer endpoint for a minimal UDP overlay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rendezvous registry server
    Server {
        /// Address to listen on, all interfaces on the default port if omitted
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
    /// Run a peer endpoint
    Peer {
        /// Rendezvous server address
        #[arg(short, long)]
        server: SocketAddr,

        /// Local address to bind
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        /// Peer id to use instead of the one derived from the local address
        #[arg(long)]
        id: Option<u64>,

        /// Send one message on startup, as <peer-id>=<text>
        #[arg(long, value_parser = parse_outgoing)]
        send: Option<Outgoing>,

        /// Answer every inbound message with this text
        #[arg(long)]
        reply: Option<String>,
    },
    /// Show version information
    Version,
}

/// A message given on the command line
#[derive(Debug, Clone)]
struct Outgoing {
    peer: PeerId,
    text: String,
}

fn parse_outgoing(arg: &str) -> std::result::Result<Outgoing, String> {
    let (peer, text) = arg
        .split_once('=')
        .ok_or_else(|| "expected <peer-id>=<text>".to_string())?;
    let peer = peer
        .parse::<PeerId>()
        .map_err(|e| format!("invalid peer id: {e}"))?;
    Ok(Outgoing {
        peer,
        text: text.to_string(),
    })
}

/// Listen address of the registry server, all interfaces on the default port if unset
fn server_bind_addr(bind: Option<SocketAddr>) -> SocketAddr {
    bind.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SERVER_PORT)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Server { bind } => {
            let server = RegistryServer::bind(server_bind_addr(bind)).await?;
            info!("Registry server listening on {}", server.local_addr());

            wait_for_shutdown().await;

            info!("Shutting down registry server...");
            server.close();
        },
        Commands::Peer {
            server,
            bind,
            id,
            send,
            reply,
        } => {
            let handler: Arc<dyn MessageHandler> = match reply {
                Some(text) => Arc::new(EchoHandler::new(text)),
                None => Arc::new(LoggingHandler),
            };
            let mut builder = Client::builder()
                .local_addr(bind)
                .server_addr(server)
                .with_handler(handler);
            if let Some(id) = id {
                builder = builder.with_id(PeerId::new(id));
            }
            let client = builder.connect().await?;
            info!("Peer {} running on {}", client.id(), client.local_addr());
            for peer in client.known_peers() {
                info!("Known peer {}", peer);
            }

            if let Some(Outgoing { peer, text }) = send {
                match client.send_message(peer, text).await {
                    Ok(()) => info!("Message sent to {}", peer),
                    Err(e) => warn!("Sending to {} failed: {}", peer, e),
                }
            }

            wait_for_shutdown().await;

            info!("Shutting down peer...");
            client.close();
        },
        Commands::Version => {
            println!("{} v{}", going::NAME, going::VERSION);
        },
    }

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_to_well_known_port() {
        let cli = Cli::try_parse_from(["going-cli", "server"]).unwrap();
        let Commands::Server { bind } = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(server_bind_addr(bind), "0.0.0.0:9191".parse::<SocketAddr>().unwrap());

        let explicit: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(server_bind_addr(Some(explicit)), explicit);
    }

    #[test]
    fn peer_send_argument_is_parsed() {
        let cli = Cli::try_parse_from([
            "going-cli",
            "peer",
            "--server",
            "127.0.0.1:9191",
            "--send",
            "42=hello=world",
        ])
        .unwrap();
        let Commands::Peer { send: Some(outgoing), .. } = cli.command else {
            panic!("expected peer command with a message");
        };
        assert_eq!(outgoing.peer, PeerId::new(42));
        assert_eq!(outgoing.text, "hello=world");

        assert!(parse_outgoing("no-separator").is_err());
        assert!(parse_outgoing("abc=text").is_err());
    }
}
