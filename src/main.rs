//! QUIC Chat Relay
//!
//! Standalone relay server with an in-memory message store and a fixed
//! token table seeded with demo accounts.
//!
//! Usage:
//!   cargo run -- server                    # Run relay server
//!   cargo run -- server --port 4433        # Run on specific port

use std::env;
use std::sync::Arc;
use std::time::Duration;

use parley::auth::StaticTokenVerifier;
use parley::protocol::events::Identity;
use parley::store::MemoryMessageStore;
use parley::{RelayConfig, RelayServer};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => {
            run_server(&args).await?;
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
            return Ok(());
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Parley - QUIC Chat Relay");
    println!();
    println!("USAGE:");
    println!("    cargo run -- server [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    server              Start the relay server");
    println!("    help                Show this help message");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>       Port to listen on (default: 4433)");
    println!("    --max-conn <NUM>    Maximum connections (default: 10000)");
    println!();
    println!("PROTOCOL:");
    println!("    Each client holds one QUIC connection with a single control stream:");
    println!("    - Hello carries the credential; the relay answers Me or AuthFailed");
    println!("    - Authenticated sessions auto-join the global room and get history");
    println!("    - join-room / dm-initiate / send-message flow as request frames");
    println!("    - Presence, history, messages and DM invites flow back as events");
    println!();
    println!("EXAMPLES:");
    println!("    cargo run -- server");
    println!("    cargo run -- server --port 5000");
    println!("    RUST_LOG=debug cargo run -- server");
}

fn parse_port(args: &[String]) -> u16 {
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            if let Ok(port) = args[i + 1].parse() {
                return port;
            }
        }
    }
    4433 // default port
}

fn parse_max_connections(args: &[String]) -> usize {
    for i in 0..args.len() {
        if args[i] == "--max-conn" && i + 1 < args.len() {
            if let Ok(max) = args[i + 1].parse() {
                return max;
            }
        }
    }
    10000 // default
}

/// Demo accounts: token `token-user001` resolves to identity `user001`, etc.
fn seed_verifier() -> StaticTokenVerifier {
    let mut verifier = StaticTokenVerifier::new();
    for i in 1..=10 {
        let id = format!("user{:03}", i);
        verifier = verifier.with_identity(
            &format!("token-{}", id),
            Identity {
                id: id.clone(),
                display_name: format!("User {:03}", i),
                contact_handle: format!("{}@example.com", id),
            },
        );
    }
    verifier
}

async fn run_server(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting QUIC Chat Relay...");

    let port = parse_port(args);
    let max_connections = parse_max_connections(args);

    let config = RelayConfig {
        bind_addr: format!("0.0.0.0:{}", port).parse()?,
        max_connections,
        idle_timeout: Duration::from_secs(300),
        history_limit: 100,
    };

    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - History replay limit: {}", config.history_limit);

    let store = Arc::new(MemoryMessageStore::new());
    let verifier = Arc::new(seed_verifier());

    let mut server = RelayServer::new(config, store, verifier);

    // Start server (this will run indefinitely)
    if let Err(e) = server.start().await {
        error!("Relay error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
