//! muxrpc - multiplexed binary RPC
//!
//! Runs a demo server exposing the `hello` service, performs one-shot calls
//! against any server, and load-tests a server over a single connection.

use bytes::Bytes;
use clap::{Parser, Subcommand};
use muxrpc_client::{Client, ClientError, ConnectionConfig};
use muxrpc_server::{Callback, Config, Server};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "muxrpc")]
#[command(about = "Multiplexed binary RPC over a single TCP connection")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server exposing the `hello` service
    Serve {
        /// Address to bind to (overrides configuration)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Perform one call and print its result
    Call {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7450", env = "MUXRPC_SERVER")]
        server: String,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Call signature, e.g. hello.echo
        signature: String,

        /// Parameter, sent as UTF-8 bytes
        #[arg(default_value = "")]
        param: String,
    },

    /// Fan out concurrent calls over one connection and report throughput
    Bench {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7450", env = "MUXRPC_SERVER")]
        server: String,

        /// Number of concurrent tasks
        #[arg(short, long, default_value_t = 100)]
        tasks: usize,

        /// Calls issued by each task, one after another
        #[arg(short, long, default_value_t = 1000)]
        calls: usize,

        /// Signature to call
        #[arg(long, default_value = "hello.echo")]
        signature: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind } => serve(bind).await,
        Commands::Call {
            server,
            timeout_ms,
            signature,
            param,
        } => call(server, timeout_ms, signature, param).await,
        Commands::Bench {
            server,
            tasks,
            calls,
            signature,
        } => bench(server, tasks, calls, signature).await,
    }
}

/// The `hello` service: `echo` answers `echo:<param>`.
fn hello(method: String, param: Bytes, callback: Callback) {
    match method.as_str() {
        "echo" => {
            let mut result = Vec::with_capacity(5 + param.len());
            result.extend_from_slice(b"echo:");
            result.extend_from_slice(&param);
            callback.success(result);
        }
        other => callback.failure(format!("unknown method: {}", other)),
    }
}

async fn serve(bind: Option<SocketAddr>) -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (from file if MUXRPC_CONFIG is set, then env overrides)
    let mut config = match std::env::var("MUXRPC_CONFIG") {
        Ok(path) => match Config::load() {
            Ok(c) => {
                tracing::info!("Loaded config from {}", path);
                c
            }
            Err(e) => {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
        },
        Err(_) => {
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    if let Some(bind) = bind {
        config.network.bind_addr = bind;
    }
    config.validate()?;

    tracing::info!("Starting muxrpc server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    if config.dispatch.max_in_flight_calls == 0 {
        tracing::info!("  In-flight calls per connection: unlimited");
    } else {
        tracing::info!(
            "  In-flight calls per connection: {} ({:?} when full)",
            config.dispatch.max_in_flight_calls,
            config.dispatch.overload_policy
        );
    }

    let server = Arc::new(Server::new(config.server_config()));
    server.register("hello", hello)?;

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connections, {} calls, {} rejected)",
        stats.connections_total.load(Ordering::Relaxed),
        stats.calls_total.load(Ordering::Relaxed),
        stats.rejected_total.load(Ordering::Relaxed)
    );
    Ok(())
}

async fn call(
    server: String,
    timeout_ms: Option<u64>,
    signature: String,
    param: String,
) -> Result<(), Box<dyn std::error::Error>> {
    muxrpc_protocol::parse_signature(&signature)?;

    let mut config = ConnectionConfig::new(server);
    if let Some(ms) = timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(ms));
    }
    let client = Client::new(config);
    client.connect().await?;

    let outcome = client.call(&signature, param.into_bytes()).await;
    client.close();

    match outcome {
        Ok(result) => {
            println!("{}", String::from_utf8_lossy(&result));
            Ok(())
        }
        Err(ClientError::Remote(message)) => {
            eprintln!("error: {}", message);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn bench(
    server: String,
    tasks: usize,
    calls: usize,
    signature: String,
) -> Result<(), Box<dyn std::error::Error>> {
    muxrpc_protocol::parse_signature(&signature)?;

    let client = Arc::new(Client::new(ConnectionConfig::new(server)));
    client.connect().await?;

    let start = Instant::now();
    let mut set = JoinSet::new();
    for task in 0..tasks {
        let client = client.clone();
        let signature = signature.clone();
        set.spawn(async move {
            let mut failures = 0usize;
            for i in 0..calls {
                let param = format!("{}-{}", task, i);
                match client.call(&signature, param.clone()).await {
                    Ok(result) if result.ends_with(param.as_bytes()) => {}
                    Ok(_) => failures += 1,
                    Err(e) => {
                        tracing::debug!("Call {} failed: {}", param, e);
                        failures += 1;
                    }
                }
            }
            failures
        });
    }

    let mut failures = 0;
    while let Some(joined) = set.join_next().await {
        failures += joined?;
    }
    let elapsed = start.elapsed();
    client.close();

    let total = tasks * calls;
    println!(
        "{} calls from {} tasks in {:.2?} ({:.0} calls/s), {} failed",
        total,
        tasks,
        elapsed,
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        failures
    );
    Ok(())
}
