use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;

use ember_net::{NetContext, NetFuncType, NetStatus, NetValue, NetValueKind};

#[derive(Parser, Debug)]
#[command(name = "ember-client")]
#[command(about = "Ember headless client")]
struct Args {
    /// Server address; omit to discover one on the LAN.
    #[arg(short, long)]
    server: Option<SocketAddr>,

    #[arg(short, long, default_value_t = ember_net::DEFAULT_PORT)]
    port: u16,

    /// Seconds to stay connected before leaving.
    #[arg(short, long, default_value_t = 30)]
    duration: u64,
}

const FIELD_POSITION: usize = 0;
const FIELD_HEALTH: usize = 1;
const FIELD_NAME: usize = 2;

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut ctx = NetContext::new(ember_net::NetConfig {
        port: args.port,
        ..ember_net::NetConfig::default()
    });
    register_game(&mut ctx);

    let addr = match args.server {
        Some(addr) => addr,
        None => discover(&mut ctx)?,
    };

    ctx.callbacks.on_accept = Some(Box::new(|host_id, session| {
        log::info!("joined '{}' as host {host_id}", session.name);
    }));
    ctx.callbacks.on_reject = Some(Box::new(|reason| {
        log::error!("connection failed: {}", reason.as_str());
    }));
    ctx.callbacks.on_kick = Some(Box::new(|_| {
        log::warn!("kicked from the session");
    }));

    ctx.connect(addr)?;

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut last_report = Instant::now();
    let mut shouted = false;

    while Instant::now() < deadline {
        ctx.update();

        if ctx.status() == NetStatus::Local {
            bail!("connection lost");
        }

        // Once our avatar shows up, say hello through the server rpc.
        if !shouted && ctx.is_connected() {
            let me = ctx.local_host_id();
            let mine = ctx.objects().find(|o| o.owner == me).map(|o| o.net_id);
            if let Some(net_id) = mine {
                ctx.invoke_by_name(
                    "shout",
                    net_id,
                    &[NetValue::String(String::from("hello from the client"))],
                )?;
                shouted = true;
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            report(&ctx);
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    ctx.disconnect();
    Ok(())
}

fn discover(ctx: &mut NetContext) -> Result<SocketAddr> {
    log::info!("searching for sessions...");
    ctx.begin_session_search()?;
    while ctx.is_searching() {
        ctx.update();
        std::thread::sleep(Duration::from_millis(1));
    }

    let sessions = ctx.sessions();
    for session in &sessions {
        log::info!(
            "  {} at {} ({}/{} players)",
            session.info.name,
            session.addr,
            session.info.player_count,
            session.info.max_players
        );
    }
    match sessions.first() {
        Some(session) => Ok(session.addr),
        None => bail!("no sessions found"),
    }
}

fn report(ctx: &NetContext) {
    let stats = ctx.stats();
    log::info!(
        "rtt {:.1} ms, {} object(s) replicated",
        stats.rtt_ms,
        ctx.objects().count()
    );
    for object in ctx.objects() {
        let name = match object.field(FIELD_NAME) {
            Some(NetValue::String(name)) if !name.is_empty() => name.clone(),
            _ => format!("object-{}", object.net_id),
        };
        log::debug!(
            "  {name}: pos={:?} health={:?}",
            object.field(FIELD_POSITION),
            object.field(FIELD_HEALTH)
        );
    }
}

fn register_game(ctx: &mut NetContext) {
    ctx.register_class(
        "player",
        Box::new(|obj| {
            obj.declare_field(NetValueKind::Vec3);
            obj.declare_field(NetValueKind::I32);
            obj.declare_field(NetValueKind::String);
        }),
    );

    ctx.register_func(
        "announce",
        NetFuncType::Multicast,
        true,
        vec![NetValueKind::String],
        Box::new(|_, args| {
            if let Some(NetValue::String(text)) = args.first() {
                log::info!("[announce] {text}");
            }
        }),
    )
    .expect("rpc registration");

    ctx.register_func(
        "shout",
        NetFuncType::Server,
        true,
        vec![NetValueKind::String],
        Box::new(|net_id, args| {
            if let Some(NetValue::String(text)) = args.first() {
                log::info!("object {net_id} shouts: {text}");
            }
        }),
    )
    .expect("rpc registration");
}
