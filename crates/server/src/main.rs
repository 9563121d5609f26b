mod config;
mod events;
mod server;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use replica::{PacketLossSimulation, PositionPolicy, SessionConfig, WireFormat};
use server::GameServer;

#[derive(Parser)]
#[command(name = "replica-server")]
#[command(about = "Authoritative replication host")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = replica::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 15, help = "Network updates per second")]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 8)]
    max_clients: usize,

    #[arg(long, default_value_t = 4)]
    players_per_client: u32,

    #[arg(long, default_value_t = 6, help = "Server-owned wandering entities")]
    wanderers: usize,

    #[arg(long, help = "Write records with full-width ids and floats")]
    full_wire: bool,

    #[arg(long, help = "Skip the synchronization barrier")]
    no_sync: bool,

    #[arg(long, help = "Correct client positions against acknowledged history")]
    reconcile: bool,

    #[arg(long, value_enum, default_value_t = PolicyArg::Log)]
    position_policy: PolicyArg,

    #[arg(long, default_value_t = 0.0, help = "Outgoing packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Stop after this many ticks (0 runs forever)")]
    ticks: u64,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum PolicyArg {
    Log,
    Clamp,
    Reject,
}

impl From<PolicyArg> for PositionPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Log => PositionPolicy::LogOnly,
            PolicyArg::Clamp => PositionPolicy::Clamp,
            PolicyArg::Reject => PositionPolicy::Reject,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let session = SessionConfig {
        update_fps: args.tick_rate,
        players_per_client: args.players_per_client,
        wire: if args.full_wire {
            WireFormat::Full
        } else {
            WireFormat::Packed
        },
        need_synchronization: !args.no_sync,
        server_reconciliation: args.reconcile,
        position_policy: args.position_policy.into(),
        ..Default::default()
    };

    let config = ServerConfig {
        max_clients: args.max_clients,
        wanderers: args.wanderers,
        packet_loss: (args.loss_percent > 0.0).then(|| PacketLossSimulation::new(args.loss_percent)),
        session,
        ..Default::default()
    };

    let mut server = GameServer::new(&bind_addr, config)?;
    log::info!("Server started on {}", server.local_addr());

    server.run((args.ticks > 0).then_some(args.ticks));

    let stats = server.stats();
    log::info!(
        "Server shutting down at tick {} ({}), {} entities, {} packets sent, {} received",
        stats.tick,
        stats.status,
        stats.entity_count,
        stats.network_stats.packets_sent,
        stats.network_stats.packets_received
    );
    log::debug!("{} of {} client slots were in use", stats.client_count, stats.max_clients);

    Ok(())
}
