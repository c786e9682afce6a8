//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p world_client -- [--addr 127.0.0.1:40000] [--name Player]
//!
//! Connects to a server, walks the player in a slow circle, and prints chat
//! and entity events as they arrive. Mostly useful for poking at a running
//! server without a renderer.

use std::env;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tokio::time::Instant;
use tracing::info;
use world_client::GameClient;
use world_shared::config::EngineConfig;
use world_shared::event::{ChatEvent, EntityEvent};
use world_shared::math::{Orientation, Vec3};
use world_shared::net::{Animation, Identity};

fn parse_args() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.server_addr, name = %cfg.player_name, "Connecting");

    let identity = Identity {
        name: cfg.player_name.clone(),
        numeric_id: None,
        avatar: None,
    };
    let mut client = GameClient::connect(&cfg, identity)
        .await
        .context("connect")?;

    // Wander in a circle so other clients see movement.
    let mut angle: f32 = rand::thread_rng().gen_range(0.0..std::f32::consts::TAU);
    let tick = Duration::from_millis(16);
    let mut next = Instant::now();
    let mut last_move = Instant::now();

    loop {
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

        for event in client.events.drain::<EntityEvent>() {
            match event {
                EntityEvent::Added(r) => info!(id = ?r.id, "player appeared"),
                EntityEvent::Removed(id) => info!(?id, "player left"),
                EntityEvent::Updated(_) => {}
            }
        }
        for chat in client.events.drain::<ChatEvent>() {
            println!("[{}] {}", chat.name, chat.text);
        }

        next += tick;
        tokio::time::sleep_until(next).await;
    }
}
