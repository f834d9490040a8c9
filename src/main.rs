use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use grace_server::config::{self, Config};
use grace_server::handler::DemoHandler;
use grace_server::logger;
use grace_server::server::ServiceController;

/// Demo HTTP server that restarts on SIGHUP without dropping connections.
#[derive(Debug, Parser)]
#[command(name = "grace_server", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Network family: tcp, tcp4 or tcp6
    #[arg(long)]
    network: Option<String>,

    /// Listen address, e.g. ":6086" or "127.0.0.1:6086"
    #[arg(long)]
    address: Option<String>,

    /// Seconds to wait for connections to drain; 0 waits forever
    #[arg(long)]
    close_timeout: Option<u64>,
}

impl Cli {
    fn apply(self, cfg: &mut Config) {
        if let Some(network) = self.network {
            cfg.server.network = network;
        }
        if let Some(address) = self.address {
            cfg.server.address = address;
        }
        if let Some(secs) = self.close_timeout {
            cfg.grace.close_timeout_secs = secs;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut cfg = Config::load_from(&cli.config.to_string_lossy())?;
    cli.apply(&mut cfg);

    logger::init(&cfg.logging)?;

    // worker count follows the configuration, defaulting to the CPU count
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    if let Some(workers) = cfg.server.workers {
        runtime_builder.worker_threads(workers);
        tracing::debug!(workers, "using configured worker threads");
    }
    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(cfg))
}

async fn async_main(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let controller = Arc::new(ServiceController::from_config(&cfg));

    let (listener, inherited) = controller.get_listener(&cfg.server.network, &cfg.server.address)?;
    let listener = Arc::new(listener);
    logger::log_server_start(&listener.local_addr(), &cfg, inherited);

    let serving = tokio::spawn({
        let controller = Arc::clone(&controller);
        let listener = Arc::clone(&listener);
        async move {
            let handler = DemoHandler::new(Arc::clone(&listener), inherited);
            controller.serve(listener, handler).await
        }
    });

    if inherited && cfg.grace.notify_parent {
        if let Err(e) = controller.close_parent_service() {
            logger::log_error(&format!("failed to notify parent: {e}"));
        }
    }

    let state = controller.wait_signal(Some(&listener)).await?;
    tracing::info!(
        ?state,
        pid = std::process::id(),
        replacement = ?controller.last_restart_pid(),
        "signal loop finished"
    );

    if serving.is_finished() {
        let err = serving.await?;
        if !err.is_already_closed() {
            return Err(err.into());
        }
    }

    Ok(())
}
