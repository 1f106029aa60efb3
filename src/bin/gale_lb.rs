#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use galelb::config::LbCliOverrides;
use galelb::server;

#[derive(Parser)]
#[command(name = "gale-lb", about = "Layer-4 load balancer control plane")]
struct Cli {
    /// Path to LB config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long)]
    node_port: Option<u16>,

    #[arg(long)]
    api_port: Option<u16>,

    #[arg(long)]
    net_interface_private: Option<String>,

    #[arg(long)]
    clients_port: Option<u16>,

    #[arg(long)]
    net_interface_public: Option<String>,

    #[arg(long)]
    checks_before_routing: Option<u32>,

    #[arg(long)]
    checks_timeout: Option<String>,

    #[arg(long)]
    black_list_after_fails: Option<i64>,

    #[arg(long)]
    black_list_expiry: Option<String>,
}

impl From<Cli> for LbCliOverrides {
    fn from(cli: Cli) -> Self {
        LbCliOverrides {
            node_port: cli.node_port,
            api_port: cli.api_port,
            net_interface_private: cli.net_interface_private,
            clients_port: cli.clients_port,
            net_interface_public: cli.net_interface_public,
            checks_before_routing: cli.checks_before_routing,
            checks_timeout: cli.checks_timeout,
            black_list_after_fails: cli.black_list_after_fails,
            black_list_expiry: cli.black_list_expiry,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();
    let overrides = LbCliOverrides::from(cli);

    let worker_threads = server::runtime::get_container_cpu_limit();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run_lb(server::bootstrap::LbArgs {
        config_path,
        overrides,
    }))
}
