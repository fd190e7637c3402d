use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use fpga_plugin::app_builder::ApplicationBuilder;
use fpga_plugin::config::Cli;
use fpga_plugin::config::Commands;
use fpga_plugin::config::DaemonArgs;
use fpga_plugin::config::ScanArgs;
use fpga_plugin::inventory::Inventory;
use fpga_plugin::scanner::Scanner;
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

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Scan(scan_args) => run_scan(scan_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    tracing::info!("Starting fpga-plugin daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;
    app.run().await?;

    tracing::info!("fpga-plugin daemon stopped");
    Ok(())
}

fn run_scan(scan_args: ScanArgs) -> Result<()> {
    let scanner = Scanner::new(
        scan_args.sysfs.sysfs_root,
        scan_args.sysfs.dev_root,
        scan_args.sysfs.mode,
    );
    let outcome = scanner.scan();
    for error in &outcome.errors {
        tracing::warn!("scan: {error}");
    }

    let inventory = Inventory::from_scan(outcome.devices);
    let report = serde_json::to_string_pretty(&inventory.report())
        .context("serialize inventory report")?;
    println!("{report}");
    Ok(())
}
