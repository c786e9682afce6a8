//! Soak runner: spins up a server plus a handful of synthetic clients,
//! lets them wander and place objects for a while, then prints server and
//! client diagnostics as JSON.
//!
//! Usage:
//!   cargo run -p world_tests --bin soak_runner -- [--clients 3] [--secs 10]

use std::env;
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;
use tracing::info;
use world_client::GameClient;
use world_server::bind_ephemeral;
use world_shared::config::EngineConfig;
use world_shared::math::{Orientation, Vec3};
use world_shared::net::{Animation, GridCoord, Identity};

struct Options {
    clients: u32,
    secs: u64,
}

fn parse_args() -> Options {
    let mut opts = Options { clients: 3, secs: 10 };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--clients" if i + 1 < args.len() => {
                opts.clients = args[i + 1].parse().unwrap_or(3);
                i += 2;
            }
            "--secs" if i + 1 < args.len() => {
                opts.secs = args[i + 1].parse().unwrap_or(10);
                i += 2;
            }
            _ => i += 1,
        }
    }
    opts
}

async fn run_client(cfg: EngineConfig, index: u32, secs: u64) -> anyhow::Result<String> {
    let identity = Identity {
        name: format!("Soak{index}"),
        ..Identity::default()
    };
    let mut client = GameClient::connect(&cfg, identity).await.context("connect")?;

    let tick = Duration::from_millis(16);
    let start = Instant::now();
    let deadline = start + Duration::from_secs(secs);
    let mut next = Instant::now();
    let mut angle = index as f32;
    let mut last_move = Instant::now();
    let mut placed = false;

    while Instant::now() < deadline {
        let now = Instant::now();
        client.poll(now).await?;
        client.render_tick(now, tick.as_secs_f32());

        if now.duration_since(last_move) >= Duration::from_millis(100) {
            last_move = now;
            angle += 0.05;
            let pos = Vec3::new(angle.cos() * 3.0, 0.0, angle.sin() * 3.0);
            client
                .send_update(pos, Orientation::yaw_only(angle), false, Animation::Walk)
                .await;
        }

        // Each client claims one cell; collisions across clients are the
        // point of the exercise.
        if !placed && now.duration_since(start) >= Duration::from_secs(1) {
            placed = true;
            let coord = GridCoord {
                x: (index % 2) as i32,
                z: 0,
                layer: 0,
            };
            client.place_object(coord, 0x00FF_0000 + index).await;
        }

        next += tick;
        tokio::time::sleep_until(next).await;
    }

    let diag = client.reconciler.diagnostics(Instant::now());
    client.disconnect().await;
    Ok(serde_json::to_string_pretty(&diag)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let opts = parse_args();
    let (mut server, cfg) = bind_ephemeral(EngineConfig::default()).await?;
    info!(addr = %cfg.server_addr, clients = opts.clients, secs = opts.secs, "Soak starting");

    let mut handles = Vec::new();
    for index in 0..opts.clients {
        let cfg = cfg.clone();
        let secs = opts.secs;
        handles.push(tokio::spawn(async move {
            // Stagger joins a little.
            tokio::time::sleep(Duration::from_millis(50 * index as u64)).await;
            run_client(cfg, index, secs).await
        }));
    }

    let tick = Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let deadline = Instant::now() + Duration::from_secs(opts.secs + 2);
    let mut next = Instant::now();
    while Instant::now() < deadline {
        let _ = server.try_accept(Duration::from_millis(1)).await;
        server.step(Instant::now()).await?;
        next += tick;
        tokio::time::sleep_until(next).await;
    }

    for (index, handle) in handles.into_iter().enumerate() {
        match handle.await? {
            Ok(diag) => println!("--- client {index} ---\n{diag}"),
            Err(e) => println!("--- client {index} failed: {e:#} ---"),
        }
    }

    let diag = server.diagnostics(Instant::now());
    println!("--- server ---\n{}", serde_json::to_string_pretty(&diag)?);
    Ok(())
}
