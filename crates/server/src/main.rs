mod config;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use glam::Vec3;

use ember_net::{
    HostId, NetContext, NetFuncType, NetHost, NetId, NetValue, NetValueKind, SessionInfo,
};

use config::ServerArgs;

const FIELD_POSITION: usize = 0;
const FIELD_HEALTH: usize = 1;
const FIELD_NAME: usize = 2;

fn main() -> Result<()> {
    env_logger::init();
    let args = ServerArgs::parse();

    let mut ctx = NetContext::new(args.net_config());
    register_game(&mut ctx);

    let joined: Rc<RefCell<Vec<NetHost>>> = Rc::new(RefCell::new(Vec::new()));
    let departed: Rc<RefCell<Vec<NetHost>>> = Rc::new(RefCell::new(Vec::new()));

    let sink = Rc::clone(&joined);
    ctx.callbacks.on_connect = Some(Box::new(move |host| {
        sink.borrow_mut().push(*host);
    }));
    let sink = Rc::clone(&departed);
    ctx.callbacks.on_disconnect = Some(Box::new(move |host| {
        sink.borrow_mut().push(*host);
    }));

    ctx.open_session(SessionInfo {
        name: args.name.clone(),
        max_players: args.max_players,
        player_count: 0,
    })?;
    ctx.loss_sim.enabled = args.simulate_loss > 0.0;
    ctx.loss_sim.loss_percent = args.simulate_loss;

    log::info!(
        "'{}' listening on {} at {} Hz",
        args.name,
        ctx.local_addr().expect("session is open"),
        args.tick_rate
    );

    let tick_duration = Duration::from_secs_f64(1.0 / args.tick_rate as f64);
    let mut last_tick = Instant::now();
    let mut accumulator = Duration::ZERO;
    let mut avatars: HashMap<HostId, NetId> = HashMap::new();
    let mut elapsed = 0.0f32;
    let mut last_report = Instant::now();

    loop {
        let now = Instant::now();
        accumulator += now - last_tick;
        last_tick = now;

        while accumulator >= tick_duration {
            accumulator -= tick_duration;
            elapsed += tick_duration.as_secs_f32();

            ctx.update();

            for host in joined.borrow_mut().drain(..) {
                let net_id = ctx.spawn_object("player", host.id)?;
                ctx.set_field(net_id, FIELD_HEALTH, NetValue::I32(100))?;
                ctx.set_field(
                    net_id,
                    FIELD_NAME,
                    NetValue::String(format!("player-{}", host.id)),
                )?;
                avatars.insert(host.id, net_id);
                log::info!("spawned object {net_id} for client {}", host.id);
            }

            for host in departed.borrow_mut().drain(..) {
                if let Some(net_id) = avatars.remove(&host.id) {
                    ctx.destroy_object(net_id)?;
                    log::info!("despawned object {net_id} of client {}", host.id);
                }
            }

            // Drive some visible motion so clients have state to follow.
            for (slot, net_id) in avatars.values().enumerate() {
                let phase = elapsed + slot as f32;
                let position = Vec3::new(phase.cos() * 5.0, 1.0, phase.sin() * 5.0);
                ctx.set_field(*net_id, FIELD_POSITION, NetValue::Vec3(position))?;
            }
        }

        if last_report.elapsed() >= Duration::from_secs(5) {
            last_report = Instant::now();
            let stats = ctx.stats();
            log::info!(
                "{} client(s), {} objects, {} B out / {} B in",
                ctx.connected_count(),
                ctx.objects().count(),
                stats.bytes_sent,
                stats.bytes_received
            );
            if ctx.connected_count() > 0 {
                if let Some(net_id) = avatars.values().next() {
                    ctx.invoke_by_name(
                        "announce",
                        *net_id,
                        &[NetValue::String(format!(
                            "{} players online",
                            ctx.connected_count()
                        ))],
                    )?;
                }
            }
        }

        std::thread::sleep(Duration::from_millis(1));
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
