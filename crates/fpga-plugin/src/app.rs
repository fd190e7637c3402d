use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::allocator::Allocator;
use crate::config::DaemonArgs;
use crate::device_plugin::DevicePluginManager;
use crate::inventory::Inventory;
use crate::lease_reconciler::LeaseReconciler;
use crate::pod_lookup::PendingPods;
use crate::pod_lookup::PodWatcher;
use crate::scanner::Scanner;

/// Long-lived components shared by the daemon tasks.
pub struct ApplicationServices {
    pub scanner: Arc<Scanner>,
    pub inventory: Arc<Inventory>,
    pub allocator: Arc<Allocator>,
    pub plugin_manager: Arc<DevicePluginManager>,
    pub lease_reconciler: Arc<LeaseReconciler>,
    /// `None` when the pod watcher is disabled
    pub pending_pods: Option<Arc<PendingPods>>,
    pub pod_watcher: Option<Arc<PodWatcher>>,
}

pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);
        tasks.wait_for_completion().await?;

        tracing::info!("Application run completed");
        Ok(())
    }
}

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn spawn_all_tasks(&mut self, app: &Application) {
        let scan_task = self.spawn_scan_task(app);
        self.tasks.push(scan_task);

        let plugin_task = self.spawn_device_plugin_task(app);
        self.tasks.push(plugin_task);

        let lease_task = self.spawn_lease_reconciler_task(app);
        self.tasks.push(lease_task);

        if let (Some(pod_watcher), Some(pending)) = (
            app.services().pod_watcher.clone(),
            app.services().pending_pods.clone(),
        ) {
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                tracing::info!("Starting pending pod watcher task");
                if let Err(e) = pod_watcher.run(&pending, token).await {
                    tracing::error!("Pending pod watcher failed: {e:?}");
                } else {
                    tracing::info!("Pending pod watcher completed");
                }
            }));
        }
    }

    /// Wait for a shutdown signal or for any task to stop on its own
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        let finished = tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                None
            }
            (result, index, _remaining) = futures::future::select_all(&mut self.tasks) => {
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                } else {
                    tracing::warn!("Task completed unexpectedly");
                }
                Some(index)
            }
        };
        // a finished handle must not be awaited again
        if let Some(index) = finished {
            self.tasks.swap_remove(index);
        }

        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        let tasks = std::mem::take(&mut self.tasks);
        tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_scan_task(&self, app: &Application) -> JoinHandle<()> {
        let scanner = app.services().scanner.clone();
        let inventory = app.services().inventory.clone();
        let period = app.daemon_args().scan_interval();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting inventory scan task");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let scanner = scanner.clone();
                let outcome = match tokio::task::spawn_blocking(move || scanner.scan()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("Scan task panicked: {e}");
                        continue;
                    }
                };
                for error in &outcome.errors {
                    tracing::warn!("scan: {error}");
                }
                if inventory.apply_scan(outcome.devices) {
                    tracing::info!(resources = ?inventory.advertise(), "inventory changed");
                }
            }
            tracing::info!("Inventory scan task completed");
        })
    }

    fn spawn_device_plugin_task(&self, app: &Application) -> JoinHandle<()> {
        let manager = app.services().plugin_manager.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            manager.run(token).await;
            tracing::info!("Device plugin manager completed");
        })
    }

    fn spawn_lease_reconciler_task(&self, app: &Application) -> JoinHandle<()> {
        let reconciler = app.services().lease_reconciler.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            reconciler.run(token).await;
            tracing::info!("Lease reconciler completed");
        })
    }
}
