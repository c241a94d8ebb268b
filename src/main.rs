//! Acceptor echo server.
//!
//! Listens on one transport and echoes every message back to its sender.
//! See the `acceptor` library for the acceptance layer itself.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mimalloc::MiMalloc;

use acceptor::{ServerConfig, Socket, SocketServer, TcpSocketServer, WebSocketServer};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Which wire the server speaks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// Length-prefixed frames over raw TCP.
    Tcp,
    /// WebSocket binary messages.
    Ws,
}

#[derive(Parser)]
#[command(name = "acceptor")]
#[command(version)]
#[command(about = "Echo server over TCP or WebSocket")]
struct Cli {
    /// Transport to listen with
    #[arg(long, value_enum, default_value_t = Transport::Tcp)]
    transport: Transport,

    /// Address to bind; empty means localhost
    #[arg(long, default_value = "")]
    address: String,

    /// Port to bind; 0 picks a free one
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Echo every message until the peer goes away.
fn echo(socket: Box<dyn Socket>) {
    let id = socket.socket_id();
    socket.start_streams();
    while let Some(message) = socket.get_message() {
        if !socket.put_message(&message) {
            break;
        }
    }
    log::info!("Socket {id} from {}:{} finished", socket.address(), socket.port());
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref())?;

    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;

    let server: Arc<dyn SocketServer> = match cli.transport {
        Transport::Tcp => Arc::new(TcpSocketServer::new(config)),
        Transport::Ws => Arc::new(WebSocketServer::new(config)),
    };
    server
        .listen(&cli.address, cli.port)
        .with_context(|| format!("Failed to start {:?} server", cli.transport))?;
    println!("Listening on {}:{} ({:?})", server.address(), server.port(), cli.transport);

    let accept_thread = {
        let server = Arc::clone(&server);
        thread::Builder::new()
            .name("echo-accept".to_string())
            .spawn(move || {
                while let Some(socket) = server.await_pending_socket() {
                    let spawned = thread::Builder::new()
                        .name(format!("echo-{}", socket.socket_id()))
                        .spawn(move || echo(socket));
                    if let Err(e) = spawned {
                        log::error!("Failed to spawn echo thread: {e}");
                    }
                }
            })
            .context("Failed to spawn accept thread")?
    };

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    println!("Shutting down...");
    server.close();
    if accept_thread.join().is_err() {
        log::error!("Accept thread panicked");
    }
    log::info!("Server closed");

    Ok(())
}
