mod bot;
pub mod net;

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use replica::{ConnectionState, PacketLossSimulation, SceneWorld, SessionConfig, WireFormat};

use bot::Bot;
use net::{ClientConfig, NetworkClient};

#[derive(Parser)]
#[command(name = "replica-client")]
#[command(about = "Headless replication client")]
struct Args {
    #[arg(
        short,
        long,
        help = "Server address to connect to (e.g., 127.0.0.1:27015)"
    )]
    server: Option<String>,

    #[arg(short, long, default_value_t = 1, help = "Local players on this connection")]
    players: u32,

    #[arg(short, long, default_value_t = 15, help = "Network updates per second")]
    tick_rate: u32,

    #[arg(long, default_value_t = 20, help = "Ticks between projectiles")]
    fire_interval: u64,

    #[arg(long, default_value_t = 45, help = "Ticks a projectile lives")]
    projectile_lifetime: u64,

    #[arg(long, help = "Write records with full-width ids and floats")]
    full_wire: bool,

    #[arg(long, help = "Skip the synchronization barrier")]
    no_sync: bool,

    #[arg(long, default_value_t = 0.0, help = "Outgoing packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Stop after this many ticks (0 runs until kicked)")]
    ticks: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_addr: SocketAddr = args
        .server
        .unwrap_or_else(|| format!("127.0.0.1:{}", replica::DEFAULT_PORT))
        .parse()?;

    let session = SessionConfig {
        update_fps: args.tick_rate,
        wire: if args.full_wire {
            WireFormat::Full
        } else {
            WireFormat::Packed
        },
        need_synchronization: !args.no_sync,
        ..Default::default()
    };
    let dt = session.tick_duration().as_secs_f32();
    let config = ClientConfig {
        num_players: args.players,
        session,
        ..Default::default()
    };

    let mut client = NetworkClient::new(config)?;
    if args.loss_percent > 0.0 {
        client
            .endpoint_mut()
            .set_loss_simulation(PacketLossSimulation::new(args.loss_percent));
    }
    let mut world = SceneWorld::new();
    let mut bot = Bot::new(args.fire_interval, args.projectile_lifetime);

    client.connect(server_addr)?;

    let mut ticks = 0u64;
    loop {
        let due = client.update(&mut world)?;
        for _ in 0..due {
            ticks += 1;
            if let Some(session) = client.session_mut() {
                bot.step(&mut world, session, dt);
            }
        }

        if client.is_finished() {
            break;
        }
        if args.ticks > 0 && ticks >= args.ticks {
            break;
        }
        if client.session().is_none() && client.state() == ConnectionState::Disconnected {
            log::error!("Could not reach {}", server_addr);
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let rtt_ms = client.stats().rtt_ms;
    if client.is_connected() {
        client.disconnect(&mut world);
    }
    log::info!(
        "Done after {} ticks: {} projectiles fired ({} live), {} entities mirrored, rtt {:.1} ms",
        ticks,
        bot.fired(),
        bot.live_projectiles(),
        world.entity_count(),
        rtt_ms
    );

    Ok(())
}
