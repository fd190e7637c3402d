//! Feeds the shared mapping table from disk and from the cluster.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use api_types::parse_collection;
use api_types::AcceleratorFunction;
use api_types::MappingEntry;
use api_types::MappingSource;
use api_types::SharedMappingTable;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::Api;
use kube::ResourceExt;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::kube_client;

use crate::errors::AdmissionError;

/// YAML stream of `AcceleratorFunction` documents on disk.
pub struct FileMappingSource {
    path: PathBuf,
    table: Arc<SharedMappingTable>,
}

impl FileMappingSource {
    pub fn new(path: impl Into<PathBuf>, table: Arc<SharedMappingTable>) -> Self {
        Self {
            path: path.into(),
            table,
        }
    }

    /// Reads the file and swaps in its entries. Returns the number loaded.
    pub fn load(&self) -> Result<usize, Report<AdmissionError>> {
        let content = std::fs::read_to_string(&self.path).change_context_lazy(|| {
            AdmissionError::MappingUnreadable {
                path: self.path.display().to_string(),
            }
        })?;
        let parsed = parse_collection(&content);
        let loaded = parsed.entries.len();
        if parsed.skipped > 0 {
            warn!(skipped = parsed.skipped, path = %self.path.display(), "malformed mapping entries skipped");
        }
        self.table.replace_source(MappingSource::File, parsed.entries);
        Ok(loaded)
    }

    /// Reloads on every change of the file. A failed reload keeps the
    /// previous snapshot.
    #[tracing::instrument(skip(self, cancellation_token), fields(path = %self.path.display()))]
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<(), Report<AdmissionError>> {
        let (fs_tx, mut fs_rx) = mpsc::channel(10);
        let _watcher = self.setup_filesystem_watcher(fs_tx)?;
        info!("Watching mapping file");

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Mapping file watcher shutdown requested");
                    break;
                }
                Some(event) = fs_rx.recv() => {
                    debug!(kind = ?event.kind, "mapping file changed");
                    match self.load() {
                        Ok(loaded) => info!(loaded, "mapping file reloaded"),
                        Err(e) => error!("Failed to reload mapping file, keeping previous table: {e:?}"),
                    }
                }
            }
        }
        Ok(())
    }

    fn setup_filesystem_watcher(
        &self,
        fs_tx: mpsc::Sender<Event>,
    ) -> Result<RecommendedWatcher, Report<AdmissionError>> {
        let (tx, rx) = std_mpsc::channel();
        let watch_error = || AdmissionError::WatchFailed {
            message: format!("cannot watch {}", self.path.display()),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!("Filesystem watch error: {:?}", e),
            },
            notify::Config::default(),
        )
        .change_context_lazy(watch_error)?;

        // ConfigMap mounts swap a symlinked directory, so watch the parent
        let dir = self
            .path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .change_context_lazy(watch_error)?;

        tokio::task::spawn_blocking(move || {
            while let Ok(event) = rx.recv() {
                if event.kind.is_access() {
                    continue;
                }
                if fs_tx.blocking_send(event).is_err() {
                    break;
                }
            }
        });

        Ok(watcher)
    }
}

/// `AcceleratorFunction` custom resources in the cluster.
pub struct ClusterMappingSource {
    kubeconfig: Option<PathBuf>,
    namespace: Option<String>,
    table: Arc<SharedMappingTable>,
}

impl ClusterMappingSource {
    pub fn new(
        kubeconfig: Option<PathBuf>,
        namespace: Option<String>,
        table: Arc<SharedMappingTable>,
    ) -> Self {
        Self {
            kubeconfig,
            namespace,
            table,
        }
    }

    #[tracing::instrument(skip(self, cancellation_token), fields(namespace = ?self.namespace))]
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<(), Report<AdmissionError>> {
        info!("Starting AcceleratorFunction watcher");
        let client = kube_client::connect(self.kubeconfig.as_deref())
            .await
            .change_context(AdmissionError::ConnectionFailed {
                message: "cannot reach the Kubernetes API".to_string(),
            })?;
        let api: Api<AcceleratorFunction> = match &self.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("AcceleratorFunction watcher shutdown requested");
                    break;
                }
                result = self.watch_functions(api.clone()) => {
                    match result {
                        Ok(()) => warn!("AcceleratorFunction watch ended unexpectedly, restarting..."),
                        Err(e) => {
                            error!("AcceleratorFunction watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn watch_functions(&self, api: Api<AcceleratorFunction>) -> Result<(), Report<AdmissionError>> {
        let mut known = ClusterEntries::default();
        let mut stream = watcher(api, watcher::Config::default()).boxed();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| {
                Report::new(AdmissionError::WatchFailed {
                    message: format!("Watch stream error: {e}"),
                })
            })?;
            if known.apply(event) {
                self.table.replace_source(MappingSource::Cluster, known.entries());
                info!(entries = known.len(), "cluster mappings updated");
            }
        }
        Ok(())
    }
}

/// Valid entries seen through the watch, keyed by `namespace/name`.
#[derive(Debug, Default)]
struct ClusterEntries {
    entries: BTreeMap<String, MappingEntry>,
}

impl ClusterEntries {
    /// Applies one watch event; true when the entry set changed.
    fn apply(&mut self, event: watcher::Event<AcceleratorFunction>) -> bool {
        match event {
            watcher::Event::Applied(function) => {
                let key = object_key(&function);
                match to_entry(&function) {
                    Some(entry) => self.entries.insert(key, entry.clone()) != Some(entry),
                    None => self.entries.remove(&key).is_some(),
                }
            }
            watcher::Event::Deleted(function) => {
                self.entries.remove(&object_key(&function)).is_some()
            }
            watcher::Event::Restarted(functions) => {
                self.entries = functions
                    .iter()
                    .filter_map(|function| Some((object_key(function), to_entry(function)?)))
                    .collect();
                true
            }
        }
    }

    fn entries(&self) -> Vec<MappingEntry> {
        self.entries.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn object_key(function: &AcceleratorFunction) -> String {
    format!(
        "{}/{}",
        function.namespace().unwrap_or_default(),
        function.name_any()
    )
}

fn to_entry(function: &AcceleratorFunction) -> Option<MappingEntry> {
    let label = function.name_any();
    match MappingEntry::from_spec(&label, &function.spec) {
        Ok(entry) => Some(match function.namespace() {
            Some(namespace) => entry.in_namespace(namespace),
            None => entry,
        }),
        Err(e) => {
            warn!(%label, "skipping malformed AcceleratorFunction: {e}");
            None
        }
    }
}
