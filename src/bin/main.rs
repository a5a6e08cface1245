use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;
use xaynet_cluster::{
    cluster::{spawn_liveness_sweep, MembershipManager, SCHEDULER},
    comm::LocalNetwork,
    common::ReplicaId,
    server::ServerNode,
    settings::Settings,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        cluster: cluster_settings,
        store: store_settings,
        cipher: cipher_settings,
        rounds: round_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let network = LocalNetwork::new();
    let manager =
        MembershipManager::new(cluster_settings, Arc::new(network.communicator(SCHEDULER)));
    manager.set_abnormal_callback(|err| error!("the cluster is unusable: {}", err));
    network.join(SCHEDULER, manager.clone());

    let servers: Vec<ReplicaId> = (0..cluster_settings.server_num)
        .map(|rank| format!("server-{}", rank))
        .collect();
    let nodes: Vec<Arc<ServerNode>> = servers
        .iter()
        .map(|id| {
            let node = ServerNode::new(
                Arc::new(network.communicator(id.as_str())),
                &servers,
                store_settings,
                cipher_settings,
                &round_settings,
            )
            .unwrap_or_else(|err| {
                eprintln!("{}", err);
                process::exit(1);
            });
            network.join(id.as_str(), node.clone());
            node
        })
        .collect();

    for node in &nodes {
        if let Err(err) = node.register().await {
            error!("failed to register {}: {}", node.id(), err);
        }
    }
    let sweep = spawn_liveness_sweep(manager.clone());
    let drivers: Vec<_> = nodes
        .iter()
        .map(|node| node.spawn_iteration_driver())
        .collect();

    let mut heartbeat = tokio::time::interval(cluster_settings.heartbeat_interval());
    let heartbeats = async {
        loop {
            heartbeat.tick().await;
            for node in &nodes {
                if let Err(err) = node.heartbeat().await {
                    warn!("heartbeat of {} failed: {}", node.id(), err);
                }
            }
        }
    };

    tokio::select! {
        _ = heartbeats => {}
        _ = sweep => {
            warn!("shutting down: liveness sweep terminated");
        }
        _ = signal::ctrl_c() => {}
    }

    manager.shutdown();
    for driver in drivers {
        driver.abort();
    }
}
