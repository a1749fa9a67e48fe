mod bgp;
mod config;
mod context;
mod error;
mod mfea;
mod rib;

use std::path::PathBuf;

use clap::Parser;
use daemonize::Daemonize;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::EnvFilter;

use bgp::Bgp;
use mfea::{Family, MfeaNode};
use rib::Rib;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Arg {
    #[arg(short, long, help = "Configuration file", default_value = "/etc/okapid/okapid.yaml")]
    config: PathBuf,

    #[arg(short, long, help = "Run as daemon in background")]
    daemon: bool,

    #[arg(short, long, help = "Log to file instead of stdout")]
    log_file: Option<PathBuf>,
}

fn tracing_set(arg: &Arg) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &arg.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "okapid.log".to_string());
            let writer = rolling::never(dir, file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_target(false)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
}

fn daemonize() -> anyhow::Result<()> {
    let daemonize = Daemonize::new()
        .pid_file("/var/run/okapid.pid")
        .working_directory("/")
        .umask(0o027);
    daemonize
        .start()
        .map_err(|e| anyhow::anyhow!("failed to daemonize: {}", e))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let arg = Arg::parse();
    tracing_set(&arg);

    let config = if arg.config.exists() {
        config::load(&arg.config).map_err(|e| anyhow::anyhow!("{}", e))?
    } else {
        info!("no configuration at {}, using defaults", arg.config.display());
        config::DaemonConfig::default()
    };

    let mut rib = Rib::new();
    for route in config.rib.statics.iter() {
        rib.route_add(route.prefix, route.metric);
    }
    let rib_tx = rib.tx.clone();

    if arg.daemon {
        daemonize()?;
    }

    rib::serve(rib);

    if config.bgp.enabled {
        let bgp = Bgp::new(&config.bgp, rib_tx.clone());
        bgp::serve(bgp);
    }

    if config.mfea.enabled {
        let node = MfeaNode::new(Family::Ipv4, config.mfea.table_id);
        let tx = node.tx.clone();
        mfea::serve(node);
        let _ = tx.send(mfea::Message::StartNode).await;

        if config.mfea.enable_ipv6 {
            let node6 = MfeaNode::new(Family::Ipv6, config.mfea.table_id);
            let tx6 = node6.tx.clone();
            mfea::serve(node6);
            let _ = tx6.send(mfea::Message::StartNode).await;
        }
    }

    info!("okapid started");

    // The subsystems run on their own tasks; keep the process alive
    // until a termination signal arrives.
    tokio::signal::ctrl_c().await?;
    info!("okapid shutting down");
    Ok(())
}
