use std::sync::Arc;

use anyhow::Result;
use api_types::SharedMappingTable;
use clap::Parser;
use fpga_admission::config::Cli;
use fpga_admission::mapping_source::ClusterMappingSource;
use fpga_admission::mapping_source::FileMappingSource;
use fpga_admission::server::AdmissionServer;
use fpga_admission::server::TlsFiles;
use fpga_admission::Translator;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init();
    tracing::info!("Starting fpga-admission {}", &**version::VERSION);

    let table = Arc::new(SharedMappingTable::new());
    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    if let Some(path) = cli.mappings_file.clone() {
        let source = FileMappingSource::new(path, table.clone());
        // a bad file at startup is fatal, later reloads are not
        let loaded = source.load().map_err(|e| anyhow::anyhow!("{e:?}"))?;
        tracing::info!(loaded, "mapping file loaded");
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = source.run(token).await {
                tracing::error!("Mapping file watcher failed: {e:?}");
            }
        }));
    }

    if cli.watch_crds {
        let source = ClusterMappingSource::new(
            cli.kubeconfig.clone(),
            cli.namespace.clone(),
            table.clone(),
        );
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = source.run(token).await {
                tracing::error!("AcceleratorFunction watcher failed: {e:?}");
            }
        }));
    }

    let tls = match (cli.tls_cert, cli.tls_key) {
        (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
        _ => None,
    };
    let server = AdmissionServer::new(cli.listen_addr, tls, Arc::new(Translator::new(table)));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let shutdown = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        }
        shutdown.cancel();
    });

    let served = server.run(token.clone()).await;
    token.cancel();
    futures::future::join_all(tasks).await;

    served.map_err(|e| anyhow::anyhow!("{e:?}"))
}
