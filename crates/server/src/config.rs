use clap::Parser;

use ember_net::NetConfig;

#[derive(Parser, Debug)]
#[command(name = "ember-server")]
#[command(about = "Ember dedicated server")]
pub struct ServerArgs {
    #[arg(short, long, default_value_t = ember_net::DEFAULT_PORT)]
    pub port: u16,

    #[arg(short, long, default_value_t = 60)]
    pub tick_rate: u32,

    #[arg(short, long, default_value_t = 8)]
    pub max_players: u8,

    #[arg(short, long, default_value = "Ember Server")]
    pub name: String,

    /// Replicate full object state every update instead of deltas.
    #[arg(long)]
    pub full_replication: bool,

    /// Outbound packet loss percentage (0-100) for soak testing.
    #[arg(long, default_value_t = 0.0)]
    pub simulate_loss: f32,
}

impl ServerArgs {
    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            port: self.port,
            incremental: !self.full_replication,
            ..NetConfig::default()
        }
    }
}
