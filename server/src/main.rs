use clap::Parser;
use log::{error, info};
use server::bus::InMemoryBus;
use server::config::{generate_instance_id, ArbiterConfig, ElectionConfig, InstanceConfig};
use server::coordinator::{Coordinator, CoordinatorHandle};
use server::network::UdpTransport;
use server::registry::InMemoryRegistry;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of coordinator instances to run
    #[arg(short = 'n', long, default_value = "3")]
    instances: usize,

    /// Instance id to reuse after a restart (suffixed with the index when
    /// running several instances)
    #[arg(short = 'i', long)]
    instance_id: Option<String>,

    /// Address the client listeners bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Client port of the first instance; the others use the following ports
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Lower bound of the election timeout in milliseconds
    #[arg(long, default_value = "1500")]
    election_min_ms: u64,

    /// Upper bound of the election timeout in milliseconds
    #[arg(long, default_value = "3000")]
    election_max_ms: u64,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value = "500")]
    heartbeat_ms: u64,

    /// Phi threshold for suspecting a silent leader (disabled if unset)
    #[arg(long)]
    phi_threshold: Option<f64>,

    /// Number of matchmaking skill levels
    #[arg(short = 'l', long, default_value = "10")]
    skill_levels: usize,

    /// Maximum clients per instance
    #[arg(short = 'm', long, default_value = "256")]
    max_clients: usize,
}

impl Args {
    fn instance_id(&self, index: usize) -> String {
        match &self.instance_id {
            Some(id) if self.instances == 1 => id.clone(),
            Some(id) => format!("{}-{}", id, index),
            None => generate_instance_id(),
        }
    }

    fn instance_config(&self, index: usize) -> InstanceConfig {
        let port = self.port.saturating_add(index as u16);
        InstanceConfig {
            instance_id: self.instance_id(index),
            election: ElectionConfig {
                election_timeout_min: Duration::from_millis(self.election_min_ms),
                election_timeout_max: Duration::from_millis(self.election_max_ms),
                heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
                phi_threshold: self.phi_threshold,
            },
            arbiter: ArbiterConfig {
                skill_levels: self.skill_levels,
                ..ArbiterConfig::default()
            },
            client_addr: SocketAddr::new(self.host, port),
            max_clients: self.max_clients,
            ..InstanceConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    if args.instances == 0 {
        return Err("at least one instance is required".into());
    }

    let bus = Arc::new(InMemoryBus::new());
    let registry = Arc::new(InMemoryRegistry::new());

    let mut handles: Vec<CoordinatorHandle> = Vec::new();
    let mut tasks = Vec::new();
    for index in 0..args.instances {
        let config = args.instance_config(index);
        info!(
            "Starting instance {} (clients on {})",
            config.instance_id, config.client_addr
        );
        let transport = UdpTransport::new(
            config.client_addr,
            &config.instance_id,
            config.max_clients,
            config.client_timeout,
        );
        let (coordinator, handle) =
            Coordinator::new(config, bus.clone(), registry.clone(), Box::new(transport));
        handles.push(handle);
        tasks.push(tokio::spawn(coordinator.run()));
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    for handle in &handles {
        handle.shutdown();
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!("Coordinator task panicked: {}", e);
        }
    }

    Ok(())
}
