//! Ping between two tether endpoints.
//!
//! ```text
//! tether-ping 127.0.0.1:7100                   # listen only, print pings
//! tether-ping 127.0.0.1:7101 127.0.0.1:7100    # listen and ping the peer
//! ```

use std::process;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tether::{
    Bytes, Endpoint, Message, MessageInstance, MessageRouter, ProtocolSerializer, RemoteConfig,
    RemoteManager, init_tracing,
};

const PING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    from: Endpoint,
    note: String,
}

impl Message for Ping {
    const KIND: &'static str = "tether.ping.Ping";
}

fn usage() -> ! {
    eprintln!("Usage: tether-ping <listen-addr> [peer-addr]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <listen-addr>    host:port to listen on (port 0 picks one)");
    eprintln!("  [peer-addr]      host:port of another tether-ping to ping");
    process::exit(2);
}

fn parse_args(args: &[String]) -> anyhow::Result<(Endpoint, Option<Endpoint>)> {
    match args {
        [_, listen] => Ok((listen.parse().context("invalid listen address")?, None)),
        [_, listen, peer] => Ok((
            listen.parse().context("invalid listen address")?,
            Some(peer.parse().context("invalid peer address")?),
        )),
        _ => anyhow::bail!("expected one or two addresses"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        usage();
    }
    let (listen, peer) = match parse_args(&args) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {e:#}");
            eprintln!();
            usage();
        }
    };

    let serializer = ProtocolSerializer::builder().register::<Ping>().build()?;
    let (manager, local) = RemoteManager::bind(listen, RemoteConfig::from_env())
        .await
        .context("failed to start listener")?;
    println!("listening on {local}");

    // Without a peer, accept pings from any local port.
    let watch = peer.clone().unwrap_or_else(|| Endpoint::new("127.0.0.1", 0));
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Bytes>();
    manager.register_observer(watch, frames_tx)?;

    let (pings_tx, mut pings_rx) = mpsc::unbounded_channel::<MessageInstance<Ping>>();
    let router = MessageRouter::new().subscribe::<Ping, _>(pings_tx);

    let sender = peer.as_ref().map(|p| manager.sender(p)).transpose()?;
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    let mut sequence: i64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick(), if sender.is_some() => {
                let Some(sender) = sender.as_ref() else { continue };
                sequence += 1;
                let ping = Ping {
                    from: local.clone(),
                    note: format!("ping #{sequence}"),
                };
                match sender.send(serializer.write(&ping, sequence)?).await {
                    Ok(()) => tracing::debug!(sequence, "Sent ping"),
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(error = %e, "Peer unavailable, will retry");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(frame) = frames_rx.recv() => {
                if let Err(e) = serializer.read(&frame, &router) {
                    tracing::warn!(error = %e, "Dropping undecodable frame");
                }
            }
            Some(ping) = pings_rx.recv() => {
                println!("[{}] {} from {}", ping.sequence(), ping.message().note, ping.message().from);
            }
        }
    }

    manager.close().await?;
    Ok(())
}
