#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use galelb::config::NodeCliOverrides;
use galelb::server;

#[derive(Parser)]
#[command(name = "gale-node", about = "Backend agent for the gale load balancer")]
struct Cli {
    /// Path to node config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Comma-separated `host:port` pairs, e.g. "lb1:7070,lb2:7070"
    #[arg(long)]
    load_balancer_addresses: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config;
    let overrides = NodeCliOverrides {
        load_balancer_addresses: cli.load_balancer_addresses,
    };

    let worker_threads = server::runtime::get_container_cpu_limit();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run_node(server::bootstrap::NodeArgs {
        config_path,
        overrides,
    }))
}
