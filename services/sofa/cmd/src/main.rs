//! sofa command-line front end.
//!
//! `serve` runs the counter sample server, `connect` runs clients against it,
//! and `proxy` relays front connections to backends.

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use sofa_session::{
    AddressFamily, Client, CloseReason, MultiClient, Server, Session, SessionHandler,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod config;
mod logging;
mod proxy;

use config::SofaConfig;
use proxy::{BackHandler, FrontBackHolder, FrontHandler};

/// Callback-driven TCP sessions
#[derive(Parser, Debug)]
#[command(name = "sofa", version, about = "Callback-driven TCP server, client and relay")]
struct Args {
    /// YAML config file with `server:` and `client:` sections
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the counter sample server
    Serve {
        #[command(flatten)]
        listen: ListenArgs,

        /// Idle timeout set on every session when it opens, e.g. 5s
        #[arg(long, default_value = "5s")]
        session_idle: humantime::Duration,
    },

    /// Connect clients that echo the counter back
    Connect {
        /// Target host
        #[arg(long)]
        host: Option<String>,

        /// Target port
        #[arg(long)]
        port: Option<u16>,

        /// Number of concurrent clients
        #[arg(long, default_value_t = 5)]
        clients: usize,

        /// Maximum replies each client sends before it stops answering
        #[arg(long, default_value_t = 4)]
        replies: u32,

        /// How long each client stays connected, e.g. 2s
        #[arg(long, default_value = "2s")]
        hold: humantime::Duration,
    },

    /// Relay front connections to backends
    Proxy {
        #[command(flatten)]
        listen: ListenArgs,

        /// Backend address (repeatable), e.g. --backend 127.0.0.1:33306
        #[arg(long = "backend", required = true)]
        backends: Vec<SocketAddr>,
    },
}

#[derive(clap::Args, Debug)]
struct ListenArgs {
    /// Bind host
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(long)]
    port: Option<u16>,

    /// Session table partitions
    #[arg(long)]
    divide: Option<usize>,

    /// Use an IPv6 socket
    #[arg(long)]
    ipv6: bool,

    /// Let an IPv6 listener accept IPv4-mapped connections
    #[arg(long, requires = "ipv6")]
    dual_stack: bool,
}

impl ListenArgs {
    fn apply(&self, config: &mut SofaConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(divide) = self.divide {
            config.server.divide = divide;
        }
        if self.ipv6 {
            config.server.family = AddressFamily::Ipv6;
            config.server.dual_stack = self.dual_stack;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let mut config = match &args.config {
        Some(path) => SofaConfig::load_from_file(path)?,
        None => SofaConfig::from_env(),
    };

    match args.command {
        Command::Serve {
            listen,
            session_idle,
        } => {
            listen.apply(&mut config);
            serve(config, session_idle.into()).await
        }
        Command::Connect {
            host,
            port,
            clients,
            replies,
            hold,
        } => {
            if let Some(host) = host {
                config.client.host = host;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            connect(config, clients, replies, hold.into()).await
        }
        Command::Proxy { listen, backends } => {
            listen.apply(&mut config);
            run_proxy(config, backends).await
        }
    }
}

const INC_KEY: &str = "inc";

/// Counter sample: greets with `inc:0`, answers each message with the next
/// count and closes the session once the count passes 3
struct CounterHandler {
    session_idle: Duration,
}

#[async_trait]
impl SessionHandler for CounterHandler {
    async fn on_open(&self, session: &Session) {
        info!("OnOpen {}", session);
        session.set_value(INC_KEY, 0u32);
        session.change_idle_timeout(self.session_idle);
        if let Err(e) = session.send_default("inc:0").await {
            warn!("Greeting failed: {}", e);
        }
    }

    async fn on_message(&self, session: &Session, message: Bytes) {
        info!("OnMessage {} {}", session, String::from_utf8_lossy(&message));
        let inc = session.value::<u32>(INC_KEY).unwrap_or(0) + 1;
        session.set_value(INC_KEY, inc);
        if let Err(e) = session.send_default(format!("inc:{}", inc)).await {
            warn!("Reply failed: {}", e);
        }
        if inc > 3 {
            session.close();
        }
    }

    async fn on_close(&self, session: &Session, reason: CloseReason) {
        let inc = session.value::<u32>(INC_KEY).unwrap_or(0);
        session.clear_value(INC_KEY);
        info!("OnClose {} {}, inc:{}", session, reason, inc);
    }
}

/// Echoes what it receives, up to a bounded number of replies
struct EchoHandler {
    replies: u32,
}

#[async_trait]
impl SessionHandler for EchoHandler {
    async fn on_open(&self, session: &Session) {
        info!("OnOpen {}", session);
        session.set_value("replies", 0u32);
    }

    async fn on_message(&self, session: &Session, message: Bytes) {
        info!("OnMessage {} {}", session, String::from_utf8_lossy(&message));
        let sent = session.value::<u32>("replies").unwrap_or(0);
        if sent >= self.replies {
            return;
        }
        session.set_value("replies", sent + 1);
        if let Err(e) = session.send_default(message).await {
            warn!("Echo failed: {}", e);
        }
    }

    async fn on_close(&self, session: &Session, reason: CloseReason) {
        info!("OnClose {} {}", session, reason);
    }
}

async fn serve(config: SofaConfig, session_idle: Duration) -> anyhow::Result<()> {
    let server = Server::start(config.server, Arc::new(CounterHandler { session_idle }))
        .await
        .context("failed to start server")?;
    info!("Serving on {}", server.local_addr());

    tokio::select! {
        _ = server.wait_for() => warn!("Accept loop stopped"),
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Received interrupt, shutting down");
        }
    }
    server.shutdown().await;
    Ok(())
}

async fn connect(
    config: SofaConfig,
    clients: usize,
    replies: u32,
    hold: Duration,
) -> anyhow::Result<()> {
    let handler = Arc::new(EchoHandler { replies });
    let mut tasks = tokio::task::JoinSet::new();

    for _ in 0..clients {
        let client_config = config.client.clone();
        let handler = Arc::clone(&handler);
        tasks.spawn(async move {
            let client = Client::connect(client_config, handler).await?;
            tokio::time::sleep(hold).await;
            client.disconnect().await;
            Ok::<_, sofa_session::ClientError>(())
        });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Client failed: {}", e);
                failed += 1;
            }
            Err(e) => {
                warn!("Client task failed: {}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} clients failed", failed, clients);
    }
    Ok(())
}

async fn run_proxy(config: SofaConfig, backends: Vec<SocketAddr>) -> anyhow::Result<()> {
    let holder = Arc::new(FrontBackHolder::default());
    let multi_client = Arc::new(MultiClient::new(
        config.multi_client(),
        Arc::new(BackHandler::new(Arc::clone(&holder))),
    ));
    let front = FrontHandler::new(
        Arc::clone(&holder),
        Arc::clone(&multi_client),
        backends.clone(),
        config.client.family,
    );

    let server = Server::start(config.server, Arc::new(front))
        .await
        .context("failed to start proxy")?;
    component_info!("proxy", "Proxy on {} -> {:?}", server.local_addr(), backends);

    tokio::select! {
        _ = server.wait_for() => warn!("Accept loop stopped"),
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Received interrupt, shutting down");
        }
    }
    server.shutdown().await;
    multi_client.shutdown().await;
    component_info!("proxy", "Proxy stopped, {} pairs left", holder.pair_count());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_args() {
        let args = Args::parse_from([
            "sofa",
            "--log-level",
            "debug",
            "proxy",
            "--port",
            "9000",
            "--backend",
            "127.0.0.1:33306",
            "--backend",
            "127.0.0.1:33307",
        ]);
        assert_eq!(args.log_level, "debug");
        match args.command {
            Command::Proxy { listen, backends } => {
                assert_eq!(listen.port, Some(9000));
                assert_eq!(backends.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_listen_args_override_config() {
        let args = Args::parse_from(["sofa", "serve", "--ipv6", "--dual-stack", "--divide", "3"]);
        let Command::Serve { listen, session_idle } = args.command else {
            panic!("expected serve");
        };
        assert_eq!(Duration::from(session_idle), Duration::from_secs(5));

        let mut config = SofaConfig::default();
        listen.apply(&mut config);
        assert_eq!(config.server.family, AddressFamily::Ipv6);
        assert!(config.server.dual_stack);
        assert_eq!(config.server.divide, 3);
        assert_eq!(config.server.port, 8710);
    }

    #[test]
    fn test_dual_stack_requires_ipv6() {
        assert!(Args::try_parse_from(["sofa", "serve", "--dual-stack"]).is_err());
    }
}
