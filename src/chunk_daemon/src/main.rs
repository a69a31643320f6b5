use log::{error, info, warn};
use std::env;
use std::path::PathBuf;

use chunk_store::{ChunkNode, NodeConfig};

fn usage() -> String {
    "usage: chunk_daemon <server_id> <ip> <port> [options]\n\
     options:\n\
     --config <path>        JSON node config; positional args override it\n\
     --directory <ip:port>  directory service endpoint\n\
     --storage-dir <path>   persist chunks under this directory\n\
     --capacity <bytes>     maximum chunk capacity"
        .to_string()
}

fn parse_args() -> Result<NodeConfig, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.len() < 3 || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let server_id = args[0].clone();
    let ip = args[1].clone();
    let port: u16 = args[2]
        .parse()
        .map_err(|_| format!("invalid port: {}\n{}", args[2], usage()))?;

    let mut config = NodeConfig::default();
    let mut i = 3usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                let raw = std::fs::read_to_string(value)
                    .map_err(|e| format!("read config {} failed: {}", value, e))?;
                config = serde_json::from_str(&raw)
                    .map_err(|e| format!("parse config {} failed: {}", value, e))?;
            }
            "--directory" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --directory".to_string())?;
                let (dir_ip, dir_port) = value
                    .rsplit_once(':')
                    .ok_or_else(|| format!("invalid directory endpoint: {}", value))?;
                config.directory_ip = dir_ip.to_string();
                config.directory_port = dir_port
                    .parse()
                    .map_err(|_| format!("invalid directory port: {}", dir_port))?;
            }
            "--storage-dir" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --storage-dir".to_string())?;
                config.storage_dir = Some(PathBuf::from(value));
            }
            "--capacity" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --capacity".to_string())?;
                config.max_capacity = value
                    .parse()
                    .map_err(|_| format!("invalid capacity: {}", value))?;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    config.server_id = server_id;
    config.ip = ip;
    config.port = port;
    Ok(config)
}

async fn run(config: NodeConfig) -> dfs_lib::DfsResult<()> {
    let node = ChunkNode::new(config)?;
    let addr = node.start().await?;
    info!("chunk daemon serving on {}", addr);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    node.stop().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("install SIGTERM handler failed: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn main() {
    env_logger::init();
    let config = match parse_args() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("create runtime failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(config)) {
        error!("chunk daemon failed: {}", err);
        std::process::exit(1);
    }
}
