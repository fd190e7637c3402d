use std::sync::Arc;

use anyhow::Result;

use crate::allocator::Allocator;
use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::device_plugin::DevicePluginManager;
use crate::inventory::Inventory;
use crate::lease_reconciler::LeaseReconciler;
use crate::pod_lookup::PendingPods;
use crate::pod_lookup::PodWatcher;
use crate::reprogram::CommandProgrammer;
use crate::reprogram::StateMachine;
use crate::scanner::Scanner;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Scans the node once and wires every component around the result.
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let scanner = Arc::new(Scanner::new(
            args.sysfs.sysfs_root.clone(),
            args.sysfs.dev_root.clone(),
            args.sysfs.mode,
        ));
        let initial = {
            let scanner = scanner.clone();
            tokio::task::spawn_blocking(move || scanner.scan()).await?
        };
        for error in &initial.errors {
            tracing::warn!("initial scan: {error}");
        }
        let inventory = Arc::new(Inventory::from_scan(initial.devices));
        tracing::info!(mode = ?args.sysfs.mode, resources = ?inventory.advertise(), "initial inventory");

        let programmer = Arc::new(CommandProgrammer::new(
            args.programmer_command.clone(),
            args.bitstream_dir.clone(),
        ));
        let machine = StateMachine::new(programmer, args.reprogram_timeout());
        let allocator = Arc::new(Allocator::new(args.sysfs.mode, inventory.clone(), machine));

        let (pending_pods, pod_watcher) = if args.enable_k8s {
            (
                Some(Arc::new(PendingPods::new())),
                Some(Arc::new(PodWatcher::new(
                    args.kubeconfig.clone(),
                    args.node_name.clone(),
                ))),
            )
        } else {
            tracing::warn!("pod watcher disabled, orchestrated requests cannot resolve their function");
            (None, None)
        };

        let plugin_manager = Arc::new(DevicePluginManager::new(
            args.device_plugin_dir.clone(),
            args.kubelet_socket(),
            allocator.clone(),
            pending_pods.clone(),
        ));
        let lease_reconciler = Arc::new(LeaseReconciler::new(
            args.kubelet_checkpoint.clone(),
            inventory.clone(),
            args.lease_grace(),
        ));

        let services = ApplicationServices {
            scanner,
            inventory,
            allocator,
            plugin_manager,
            lease_reconciler,
            pending_pods,
            pod_watcher,
        };
        Ok(Application::new(services, self.daemon_args))
    }
}
