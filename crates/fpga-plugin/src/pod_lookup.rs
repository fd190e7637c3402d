//! Pending-pod function lookup.
//!
//! Kubelet's `Allocate` call carries device ids but no pod identity, so the
//! function annotation written at admission is recovered here: the daemon
//! watches pods scheduled to this node that are still `Pending`, and an
//! allocation for a resource is attributed to the oldest such pod that still
//! has an unserved request for it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use api_types::naming::strip_namespace;
use api_types::ResourceName;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::watcher;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::kube_client;

#[derive(Debug, thiserror::Error)]
pub enum PodWatchError {
    #[error("Failed to connect to Kubernetes API")]
    ConnectionFailed,
    #[error("Failed to watch pods: {message}")]
    WatchFailed { message: String },
}

#[derive(Debug, Clone, PartialEq)]
struct PendingPod {
    namespace: String,
    name: String,
    created: Option<Time>,
    annotations: BTreeMap<String, String>,
    /// Qualified resource name -> units requested by all containers.
    requests: BTreeMap<String, u64>,
    /// Units already handed out through `resolve`.
    served: BTreeMap<String, u64>,
}

impl PendingPod {
    fn from_pod(pod: &Pod) -> Option<(String, Self)> {
        let uid = pod.metadata.uid.clone()?;
        let requests = fpga_requests(pod);
        if requests.is_empty() {
            return None;
        }
        Some((
            uid,
            Self {
                namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                name: pod.metadata.name.clone().unwrap_or_default(),
                created: pod.metadata.creation_timestamp.clone(),
                annotations: pod.metadata.annotations.clone().unwrap_or_default(),
                requests,
                served: BTreeMap::new(),
            },
        ))
    }

    fn unserved(&self, resource: &str) -> u64 {
        let requested = self.requests.get(resource).copied().unwrap_or(0);
        requested.saturating_sub(self.served.get(resource).copied().unwrap_or(0))
    }
}

/// Sums `fpga.intel.com/*` limits (falling back to requests) over containers.
fn fpga_requests(pod: &Pod) -> BTreeMap<String, u64> {
    let mut totals = BTreeMap::new();
    let Some(spec) = &pod.spec else {
        return totals;
    };
    for container in &spec.containers {
        let Some(resources) = &container.resources else {
            continue;
        };
        let quantities = resources
            .limits
            .as_ref()
            .or(resources.requests.as_ref());
        for (name, quantity) in quantities.into_iter().flatten() {
            if strip_namespace(name).is_none() {
                continue;
            }
            match quantity.0.parse::<u64>() {
                Ok(units) => *totals.entry(name.clone()).or_insert(0) += units,
                Err(_) => warn!(resource = %name, quantity = %quantity.0, "non-integer fpga quantity"),
            }
        }
    }
    totals
}

/// Cache of pods on this node waiting for their devices.
#[derive(Debug, Default)]
pub struct PendingPods {
    pods: Mutex<HashMap<String, PendingPod>>,
}

impl PendingPods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Adds or refreshes a pod. Pods without fpga requests are ignored.
    pub fn upsert(&self, pod: &Pod) {
        let Some((uid, pending)) = PendingPod::from_pod(pod) else {
            return;
        };
        let mut pods = self.lock();
        match pods.get_mut(&uid) {
            // keep what was already served
            Some(existing) => {
                existing.annotations = pending.annotations;
                existing.requests = pending.requests;
            }
            None => {
                debug!(pod = %format!("{}/{}", pending.namespace, pending.name), "pending fpga pod");
                pods.insert(uid, pending);
            }
        }
    }

    pub fn remove(&self, pod: &Pod) {
        if let Some(uid) = &pod.metadata.uid {
            self.lock().remove(uid);
        }
    }

    /// Replaces the cache after a watch restart, keeping served counters of
    /// pods that are still pending.
    pub fn replace_all(&self, pods: &[Pod]) {
        let mut fresh: HashMap<String, PendingPod> =
            pods.iter().filter_map(PendingPod::from_pod).collect();
        let mut current = self.lock();
        for (uid, pending) in fresh.iter_mut() {
            if let Some(previous) = current.get(uid) {
                pending.served = previous.served.clone();
            }
        }
        *current = fresh;
    }

    /// Annotations of the oldest pod with an unserved request for `resource`,
    /// marking `count` units as served.
    pub fn resolve(&self, resource: &ResourceName, count: usize) -> Option<BTreeMap<String, String>> {
        let key = resource.qualified();
        let mut pods = self.lock();
        let pod = Self::oldest_mut(&mut pods, &key)?;
        *pod.served.entry(key).or_insert(0) += count as u64;
        info!(pod = %format!("{}/{}", pod.namespace, pod.name), %resource, "allocation attributed to pending pod");
        Some(pod.annotations.clone())
    }

    /// Like [`Self::resolve`] but without marking anything served.
    pub fn peek(&self, resource: &ResourceName) -> Option<BTreeMap<String, String>> {
        let key = resource.qualified();
        let mut pods = self.lock();
        Self::oldest_mut(&mut pods, &key).map(|pod| pod.annotations.clone())
    }

    fn oldest_mut<'a>(
        pods: &'a mut HashMap<String, PendingPod>,
        resource: &str,
    ) -> Option<&'a mut PendingPod> {
        pods.values_mut()
            .filter(|pod| pod.unserved(resource) > 0)
            .min_by(|a, b| {
                (&a.created, &a.namespace, &a.name).cmp(&(&b.created, &b.namespace, &b.name))
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingPod>> {
        self.pods.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps [`PendingPods`] in sync with the API server.
pub struct PodWatcher {
    kubeconfig: Option<PathBuf>,
    node_name: String,
}

impl PodWatcher {
    pub fn new(kubeconfig: Option<PathBuf>, node_name: String) -> Self {
        Self {
            kubeconfig,
            node_name,
        }
    }

    #[tracing::instrument(skip(self, pending, cancellation_token), fields(node_name = %self.node_name))]
    pub async fn run(
        &self,
        pending: &PendingPods,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<PodWatchError>> {
        info!("Starting pending pod watcher");
        let client = kube_client::connect(self.kubeconfig.as_deref())
            .await
            .change_context(PodWatchError::ConnectionFailed)?;
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pending pod watcher shutdown requested");
                    break;
                }
                result = self.watch_pods(&client, pending) => {
                    match result {
                        Ok(()) => {
                            warn!("Pod watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Pod watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn watch_pods(
        &self,
        client: &Client,
        pending: &PendingPods,
    ) -> Result<(), Report<PodWatchError>> {
        let api: Api<Pod> = Api::all(client.clone());
        let config = watcher::Config::default().fields(&format!(
            "spec.nodeName={},status.phase=Pending",
            self.node_name
        ));

        let mut stream = watcher(api, config).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Applied(pod)) => pending.upsert(&pod),
                Ok(watcher::Event::Deleted(pod)) => pending.remove(&pod),
                Ok(watcher::Event::Restarted(pods)) => {
                    pending.replace_all(&pods);
                    debug!(pending = pending.len(), "pending pod cache resynced");
                }
                Err(e) => {
                    return Err(Report::new(PodWatchError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }
        Ok(())
    }
}
