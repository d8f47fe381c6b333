//! Ember Mesh
//!
//! `ember-mesh hub` runs the signaling relay. `host <url>` and
//! `join <url> <code>` run a headless peer against a relay. `demo` runs two
//! in-process peers through a short match.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ember_mesh::{
    game::events::Projectile,
    game::entity::Weapon,
    network::{
        memory::MemoryNetwork,
        relay::{HubConfig, RelaySignaling, SignalHub},
        signaling::LocalBus,
        websocket::{WsTransport, WsTransportConfig},
    },
    MatchConfig, MeshConfig, MeshSession, Profile, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Ember Mesh v{}", VERSION);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str).unwrap_or("hub") {
        "hub" => run_hub().await,
        "demo" => run_demo().await,
        "host" => {
            let url = args.get(1).context("usage: ember-mesh host <relay-url>")?;
            run_peer(url, None).await
        }
        "join" => {
            let (Some(url), Some(code)) = (args.get(1), args.get(2)) else {
                bail!("usage: ember-mesh join <relay-url> <room-code>");
            };
            run_peer(url, Some(code)).await
        }
        other => bail!("unknown mode {other:?}, expected hub, demo, host or join"),
    }
}

async fn run_hub() -> anyhow::Result<()> {
    let config = HubConfig::from_env();
    info!("Max connections: {}", config.max_connections);
    let hub = SignalHub::new(config);

    tokio::select! {
        result = hub.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            hub.shutdown();
        }
    }
    Ok(())
}

fn profile() -> Profile {
    let name = std::env::var("EMBER_NAME").unwrap_or_else(|_| "Agent".to_string());
    let avatar = std::env::var("EMBER_AVATAR").unwrap_or_else(|_| "flame".to_string());
    Profile::new(name, avatar)
}

async fn run_peer(url: &str, code: Option<&String>) -> anyhow::Result<()> {
    let config = MeshConfig::from_env();
    let signaling = RelaySignaling::connect(url).await?;
    let transport = WsTransport::new(WsTransportConfig::from_env());
    let mut ticker = tokio::time::interval(config.tick_interval());
    let mut session = MeshSession::new(config, Arc::new(signaling), Arc::new(transport));

    session.on_notice(|notice| info!("{:?}", notice));
    session.on_peer_joined(|entity| info!("{} joined", entity.name));
    session.on_peer_left(|peer| info!("{} left", peer.short()));
    session.on_chat(|sender, text| info!("<{}> {}", sender, text));

    match code {
        Some(code) => session.join_room(code, &profile())?,
        None => {
            let code = session.create_room(&profile(), MatchConfig::default())?;
            info!("Room code: {}", code);
        }
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.tick();
                // No simulation here, so keep re-sending the spawn state.
                if let Some(me) = session.local_entity().cloned() {
                    session.send_local_snapshot(me);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect();
    Ok(())
}

/// Two peers in one process: connect, move, shoot, report.
async fn run_demo() -> anyhow::Result<()> {
    let bus = LocalBus::default();
    let net = MemoryNetwork::new();
    let config = MeshConfig::default();
    let peer = || MeshSession::new(config.clone(), Arc::new(bus.clone()), Arc::new(net.clone()));
    let mut host = peer();
    let mut joiner = peer();

    let code = host.create_room(&Profile::new("Host", "flame"), MatchConfig::new(300, "frost"))?;
    info!("Room code: {}", code);
    joiner.join_room(code.as_str(), &Profile::new("Joiner", "bolt"))?;

    let mut ticker = tokio::time::interval(config.tick_interval());
    let ticks = config.tick_rate * 3;
    for t in 0..ticks {
        ticker.tick().await;
        host.tick();
        joiner.tick();

        if let Some(mut me) = host.local_entity().cloned() {
            me.vx = 4.0;
            me.x = (me.x + me.vx).min(host.map().bounds.width);
            host.send_local_snapshot(me);
        }
        if let Some(me) = joiner.local_entity().cloned() {
            joiner.send_local_snapshot(me);
        }

        if t % config.tick_rate == 0 && joiner.local_entity().is_some() {
            if let Some(me) = host.local_entity() {
                let shot = Projectile {
                    x: me.x,
                    y: me.y,
                    vx: 15.0,
                    vy: 0.0,
                    owner_id: me.id.clone(),
                    weapon_type: Weapon::Rifle,
                    seq: None,
                };
                host.spawn_projectile(shot);
            }
        }
    }

    info!("Joiner saw {} projectiles", joiner.take_projectiles().len());
    for view in joiner.remote_entities() {
        info!("Joiner renders {} at ({:.1}, {:.1})", view.name, view.x, view.y);
    }
    let stats = host.stats();
    info!(
        "Host: {} peers, latency {:?}, {} sent, {} received",
        stats.peers, stats.latency.unwrap_or(Duration::ZERO), stats.messages_sent, stats.messages_received
    );

    joiner.disconnect();
    host.disconnect();
    Ok(())
}
