use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use clap::Parser;
use network_client::{ClientNetworkRuntime, Session, state::PoseCodec, state::SharedResource};
use network_shared::{
    ClientSyncConfig, FrameUpdate, Value,
    prelude::keys::{self, commands, frame},
    transport::LoopbackServer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Parser, Debug)]
#[command(name = "sync_probe")]
#[command(about = "Runs a sync session against an in-process loopback server")]
struct Args {
    /// Client configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of ticks to run at 30 Hz
    #[arg(long, default_value_t = 90)]
    ticks: u32,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ClientSyncConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientSyncConfig::default(),
    };

    let runtime = ClientNetworkRuntime::multi_thread(&config.runtime)?;
    let server = LoopbackServer::new();
    server.register_command(commands::PLAY, |_| {
        BTreeMap::from([("playing".to_owned(), Value::from(true))])
    });
    server.set_value(keys::SUGGEST_HEALTH_REPORT, true);

    let mut session = Session::new(config, runtime.handle());
    let token = session.open(Arc::new(server.connect()), Instant::now())?;
    session
        .store_mut()
        .set_local(keys::avatar(&token), Value::number_list([0.0f32; 10]));
    let mut scene = SharedResource::new(keys::SIMULATION_POSE, PoseCodec);
    let mut play = Some(session.trajectory().play()?);

    let period = Duration::from_millis(1000 / 30);
    for tick in 0..args.ticks {
        if tick % 3 == 0 {
            let t = tick as f32 * 0.1;
            server.publish_frame(
                FrameUpdate::new(u64::from(tick) + 1)
                    .with_value(frame::PARTICLE_COUNT, 2)
                    .with_value(frame::PARTICLE_POSITIONS, positions(&[[t, 0.0, 0.0], [0.0, t, 0.0]])),
            );
        }
        if tick == 10 {
            let mut pose = scene.value(session.store()).unwrap_or_default();
            pose.position = [1.0, 2.0, 3.0];
            scene.update_value_with_lock(session.store_mut(), pose)?;
        }
        if let Some(event) = scene.poll_lock(session.store_mut()) {
            info!(?event, "scene lock");
        }

        let report = session.tick(Instant::now())?;
        if report.frame_rejected {
            warn!(tick, "frame rejected");
        }
        if let Some(result) = play.as_mut().and_then(|pending| pending.try_result()) {
            info!(?result, "play acknowledged");
            play = None;
        }
        std::thread::sleep(period);
    }

    let health = session.health_at(Instant::now());
    info!(
        frames = health.frames,
        state = health.state,
        rtt_ms = health.rtt_ms(),
        awaiting_index = health.awaiting_index,
        "connection health"
    );
    if let Some(frame) = session.trajectory().current_frame() {
        info!(
            index = ?session.trajectory().current_frame_index(),
            particles = ?frame.particle_count(),
            "last frame"
        );
    }
    info!(scene = ?server.value(keys::SIMULATION_POSE), "server scene pose");

    scene.release_lock(session.store_mut())?;
    runtime.block_on(session.close())?;
    Ok(())
}

fn positions(points: &[[f32; 3]]) -> Vec<u8> {
    points
        .iter()
        .flatten()
        .flat_map(|component| component.to_le_bytes())
        .collect()
}
