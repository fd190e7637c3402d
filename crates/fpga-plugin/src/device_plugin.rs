#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use api::device_plugin_server::DevicePlugin;
use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateResponse;
use api::ContainerPreferredAllocationResponse;
use api::DevicePluginOptions;
use api::DeviceSpec;
use api::Empty;
use api::ListAndWatchResponse;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use api::RegisterRequest;
use api_types::LogicalFunctionId;
use api_types::ResourceName;
use api_types::FUNCTION_ANNOTATION;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::allocator::AllocationError;
use crate::allocator::AllocationGrant;
use crate::allocator::AllocationRequest;
use crate::allocator::Allocator;
use crate::pod_lookup::PendingPods;
use crate::scanner::RegionId;

pub const KUBELET_API_VERSION: &str = "v1beta1";
const HEALTHY: &str = "Healthy";

/// Device plugin errors
#[derive(Debug, derive_more::Display)]
pub enum DevicePluginError {
    #[display("Failed to serve {resource} on {path}")]
    Serve { resource: String, path: String },
    #[display("Failed to register {resource} with kubelet")]
    Registration { resource: String },
}

impl core::error::Error for DevicePluginError {}

/// Maps allocation failures onto the status kubelet reports to the user.
pub fn status_for(error: &AllocationError) -> Status {
    let message = error.to_string();
    match error {
        AllocationError::InsufficientResources { .. } => Status::resource_exhausted(message),
        AllocationError::MissingFunction { .. } | AllocationError::InvalidFunction { .. } => {
            Status::invalid_argument(message)
        }
        AllocationError::ResourceMismatch { .. } | AllocationError::UnknownResource { .. } => {
            Status::failed_precondition(message)
        }
        AllocationError::ReprogramTimeout { .. } => Status::deadline_exceeded(message),
        AllocationError::ReprogramFailed { .. } | AllocationError::Aborted => {
            Status::internal(message)
        }
    }
}

/// One kubelet device plugin endpoint, serving a single resource name.
pub struct FpgaDevicePlugin {
    resource: ResourceName,
    /// socket file name inside the device plugin directory
    endpoint: String,
    allocator: Arc<Allocator>,
    pending: Option<Arc<PendingPods>>,
    options: DevicePluginOptions,
}

impl FpgaDevicePlugin {
    pub fn new(
        resource: ResourceName,
        allocator: Arc<Allocator>,
        pending: Option<Arc<PendingPods>>,
    ) -> Arc<Self> {
        let endpoint = format!("intel-fpga-{}.sock", resource.short_name());
        Arc::new(Self {
            resource,
            endpoint,
            allocator,
            pending,
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: true,
            },
        })
    }

    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    pub fn socket_path(&self, socket_dir: &Path) -> PathBuf {
        socket_dir.join(&self.endpoint)
    }

    /// Binds the plugin socket and serves until `cancellation_token` fires.
    pub async fn start(
        self: &Arc<Self>,
        socket_dir: &Path,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<DevicePluginError>> {
        let socket_path = self.socket_path(socket_dir);
        let serve_error = || DevicePluginError::Serve {
            resource: self.resource.qualified(),
            path: socket_path.display().to_string(),
        };
        info!(resource = %self.resource, "start device plugin server: {}", socket_path.display());

        // clean up old socket file if it exists
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).change_context_lazy(serve_error)?;
        }
        let listener = UnixListener::bind(&socket_path).change_context_lazy(serve_error)?;

        let service = DevicePluginService::new(Arc::clone(self), cancellation_token.clone());
        let resource = self.resource.clone();
        let shutdown = {
            let resource = resource.clone();
            async move {
                cancellation_token.cancelled().await;
                info!(%resource, "shutting down gRPC server");
            }
        };
        tokio::spawn(async move {
            let served = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown,
                )
                .await;
            if let Err(e) = served {
                error!(%resource, "device plugin server failed: {e}");
            }
        });
        Ok(())
    }

    /// Announces the plugin socket to kubelet.
    pub async fn register_with_kubelet(
        &self,
        kubelet_socket: &Path,
    ) -> Result<(), Report<DevicePluginError>> {
        info!(resource = %self.resource, "registering device plugin with kubelet: {}", kubelet_socket.display());
        let registration_error = || DevicePluginError::Registration {
            resource: self.resource.qualified(),
        };

        let channel = create_uds_channel(kubelet_socket)
            .await
            .change_context_lazy(registration_error)?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: KUBELET_API_VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource.qualified(),
            options: Some(self.options),
        };
        client
            .register(Request::new(request))
            .await
            .change_context_lazy(registration_error)?;

        info!(resource = %self.resource, "successfully registered device plugin with kubelet");
        Ok(())
    }

    /// Healthy devices of this resource, as kubelet sees them.
    fn device_list(&self) -> Vec<api::Device> {
        self.allocator
            .inventory()
            .snapshot()
            .devices(&self.resource)
            .iter()
            .map(|id| api::Device {
                id: id.to_string(),
                health: HEALTHY.to_string(),
                topology: None,
            })
            .collect()
    }

    fn function_hint(&self) -> Option<LogicalFunctionId> {
        match &self.resource {
            ResourceName::Preprogrammed(function) => Some(function.clone()),
            ResourceName::Orchestrated(_) => self
                .pending
                .as_ref()?
                .peek(&self.resource)?
                .get(FUNCTION_ANNOTATION)
                .and_then(|value| LogicalFunctionId::parse(value).ok()),
        }
    }

    async fn allocate_container(
        &self,
        device_ids: Vec<String>,
    ) -> Result<AllocationGrant, AllocationError> {
        let preferred: Vec<RegionId> = device_ids.into_iter().map(RegionId::new).collect();
        let annotations = match (&self.pending, self.resource.is_orchestrated()) {
            (Some(pending), true) => pending
                .resolve(&self.resource, preferred.len())
                .unwrap_or_else(|| {
                    warn!(resource = %self.resource, "no pending pod found for allocation");
                    BTreeMap::new()
                }),
            _ => BTreeMap::new(),
        };

        let request = AllocationRequest {
            resource: self.resource.clone(),
            count: preferred.len(),
            annotations,
            preferred,
        };
        self.allocator.allocate(request).await
    }
}

pub(crate) fn container_response(grant: &AllocationGrant) -> ContainerAllocateResponse {
    let devices = grant
        .regions
        .iter()
        .map(|region| {
            let path = region.device_node.display().to_string();
            DeviceSpec {
                container_path: path.clone(),
                host_path: path,
                permissions: "rw".to_string(),
            }
        })
        .collect();

    ContainerAllocateResponse {
        envs: grant.envs(),
        mounts: Vec::new(),
        devices,
        annotations: HashMap::from([(
            FUNCTION_ANNOTATION.to_string(),
            grant.function.to_string(),
        )]),
        cdi_devices: Vec::new(),
    }
}

/// Unix domain socket client connection
async fn create_uds_channel(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    // the URL is a placeholder, the connector dials the socket
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move { UnixStream::connect(socket_path).await.map(TokioIo::new) }
        }))
        .await
}

/// DevicePlugin service implementation
pub struct DevicePluginService {
    device_plugin: Arc<FpgaDevicePlugin>,
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(device_plugin: Arc<FpgaDevicePlugin>, cancellation_token: CancellationToken) -> Self {
        Self {
            device_plugin,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(self.device_plugin.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Streams the device list, resending it whenever inventory health changes.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(resource = %self.device_plugin.resource, "starting to watch device list");

        let (tx, rx) = mpsc::channel(4);
        let plugin = Arc::clone(&self.device_plugin);
        let mut changes = plugin.allocator.inventory().subscribe();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut last_sent: Option<Vec<api::Device>> = None;
            loop {
                let devices = plugin.device_list();
                if last_sent.as_ref() != Some(&devices) {
                    debug!(resource = %plugin.resource, healthy = devices.len(), "sending device list");
                    let response = ListAndWatchResponse {
                        devices: devices.clone(),
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        break;
                    }
                    last_sent = Some(devices);
                }

                select! {
                    _ = cancellation_token.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!(resource = %plugin.resource, "device watch task stopped");
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        let function = self.device_plugin.function_hint();

        let container_responses = req
            .container_requests
            .into_iter()
            .map(|container| {
                let available: Vec<RegionId> = container
                    .available_device_i_ds
                    .into_iter()
                    .map(RegionId::new)
                    .collect();
                let must_include: Vec<RegionId> = container
                    .must_include_device_i_ds
                    .into_iter()
                    .map(RegionId::new)
                    .collect();
                let size = usize::try_from(container.allocation_size).unwrap_or(0);
                let picked = self.device_plugin.allocator.preferred_allocation(
                    &available,
                    &must_include,
                    size,
                    function.as_ref(),
                );
                ContainerPreferredAllocationResponse {
                    device_i_ds: picked.iter().map(ToString::to_string).collect(),
                }
            })
            .collect();

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    /// Grants every container of the request or none of them.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        let inventory = self.device_plugin.allocator.inventory();
        let mut grants: Vec<AllocationGrant> = Vec::new();

        for container_req in req.container_requests {
            info!(
                resource = %self.device_plugin.resource,
                "allocating devices to container, device IDs: {:?}",
                container_req.devices_ids
            );
            match self
                .device_plugin
                .allocate_container(container_req.devices_ids)
                .await
            {
                Ok(grant) => grants.push(grant),
                Err(e) => {
                    error!(resource = %self.device_plugin.resource, "allocation failed: {e}");
                    for grant in &grants {
                        inventory.release(grant.region_ids());
                    }
                    return Err(status_for(&e));
                }
            }
        }

        Ok(Response::new(AllocateResponse {
            container_responses: grants.iter().map(container_response).collect(),
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

/// Runs one plugin endpoint per advertised resource name.
///
/// Endpoints are started as names appear. A name that loses every healthy
/// region keeps its endpoint, which then lists no devices. When kubelet
/// restarts it wipes the plugin directory; a missing socket triggers a
/// restart and a fresh registration.
pub struct DevicePluginManager {
    socket_dir: PathBuf,
    kubelet_socket: PathBuf,
    allocator: Arc<Allocator>,
    pending: Option<Arc<PendingPods>>,
}

struct RunningPlugin {
    plugin: Arc<FpgaDevicePlugin>,
    token: CancellationToken,
}

impl DevicePluginManager {
    pub fn new(
        socket_dir: PathBuf,
        kubelet_socket: PathBuf,
        allocator: Arc<Allocator>,
        pending: Option<Arc<PendingPods>>,
    ) -> Self {
        Self {
            socket_dir,
            kubelet_socket,
            allocator,
            pending,
        }
    }

    #[tracing::instrument(skip(self, cancellation_token), fields(socket_dir = %self.socket_dir.display()))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting device plugin manager");
        let mut running: HashMap<ResourceName, RunningPlugin> = HashMap::new();
        let mut changes = self.allocator.inventory().subscribe();
        let mut socket_check = interval(Duration::from_secs(5));
        socket_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.sync(&mut running, &cancellation_token).await;

            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Device plugin manager shutdown requested");
                    break;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = socket_check.tick() => {}
            }
        }

        for plugin in running.values() {
            plugin.token.cancel();
        }
    }

    async fn sync(
        &self,
        running: &mut HashMap<ResourceName, RunningPlugin>,
        cancellation_token: &CancellationToken,
    ) {
        for resource in self.allocator.inventory().advertise().into_keys() {
            if running.contains_key(&resource) {
                continue;
            }
            let plugin = FpgaDevicePlugin::new(
                resource.clone(),
                Arc::clone(&self.allocator),
                self.pending.clone(),
            );
            if let Some(started) = self.launch(plugin, cancellation_token).await {
                running.insert(resource, started);
            }
        }

        let lost: Vec<ResourceName> = running
            .iter()
            .filter(|(_, running)| !running.plugin.socket_path(&self.socket_dir).exists())
            .map(|(resource, _)| resource.clone())
            .collect();
        for resource in lost {
            let Some(stale) = running.remove(&resource) else {
                continue;
            };
            warn!(%resource, "device plugin socket disappeared, re-registering");
            stale.token.cancel();
            if let Some(started) = self.launch(stale.plugin, cancellation_token).await {
                running.insert(resource, started);
            }
        }
    }

    async fn launch(
        &self,
        plugin: Arc<FpgaDevicePlugin>,
        cancellation_token: &CancellationToken,
    ) -> Option<RunningPlugin> {
        let token = cancellation_token.child_token();
        if let Err(e) = plugin.start(&self.socket_dir, token.clone()).await {
            error!("Failed to start device plugin: {e:?}");
            return None;
        }
        if let Err(e) = plugin.register_with_kubelet(&self.kubelet_socket).await {
            // kubelet may not be up yet; the socket check retries later
            error!("Failed to register device plugin with kubelet: {e:?}");
            token.cancel();
            let _ = std::fs::remove_file(plugin.socket_path(&self.socket_dir));
            return None;
        }
        Some(RunningPlugin { plugin, token })
    }
}

#[cfg(test)]
mod tests {
    use api::device_plugin_client::DevicePluginClient;
    use api::ContainerAllocateRequest;
    use api::ContainerPreferredAllocationRequest;
    use api_types::FunctionId;
    use api_types::InterfaceId;
    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use tonic::Code;

    use super::*;
    use crate::config::PluginMode;
    use crate::inventory::Inventory;
    use crate::inventory::RegionPhase;
    use crate::reprogram::tests::function;
    use crate::reprogram::tests::FakeProgrammer;
    use crate::reprogram::tests::NLB3;
    use crate::reprogram::StateMachine;
    use crate::scanner::tests::ARRIA10;
    use crate::scanner::tests::NLB0;
    use crate::scanner::Discovered;
    use crate::scanner::ScannedRegion;

    fn region(id: &str, loaded: Option<&str>, healthy: bool) -> Discovered {
        Discovered::Region(ScannedRegion {
            id: RegionId::new(id),
            interface_id: InterfaceId::parse(ARRIA10).unwrap(),
            loaded: loaded.map(|f| FunctionId::parse(f).unwrap()),
            healthy,
            device_node: PathBuf::from(format!("/dev/{id}")),
        })
    }

    fn arria10() -> ResourceName {
        ResourceName::orchestrated(InterfaceId::parse(ARRIA10).unwrap())
    }

    fn service(devices: Vec<Discovered>, pending: Option<Arc<PendingPods>>) -> DevicePluginService {
        service_with(devices, pending, FakeProgrammer::default())
    }

    fn service_with(
        devices: Vec<Discovered>,
        pending: Option<Arc<PendingPods>>,
        programmer: FakeProgrammer,
    ) -> DevicePluginService {
        let allocator = Arc::new(Allocator::new(
            PluginMode::Region,
            Arc::new(Inventory::from_scan(devices)),
            StateMachine::new(Arc::new(programmer), Duration::from_secs(5)),
        ));
        DevicePluginService::new(
            FpgaDevicePlugin::new(arria10(), allocator, pending),
            CancellationToken::new(),
        )
    }

    fn pending_pod(function: &LogicalFunctionId, units: usize) -> Arc<PendingPods> {
        let pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "job",
                "namespace": "default",
                "uid": "uid-1",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "annotations": { FUNCTION_ANNOTATION: function.to_string() },
            },
            "spec": {
                "containers": [{
                    "name": "main",
                    "resources": { "limits": { arria10().qualified(): units.to_string() } },
                }],
            },
        }))
        .unwrap();
        let pending = Arc::new(PendingPods::new());
        pending.upsert(&pod);
        pending
    }

    fn allocate_request(ids: &[&str]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: ids.iter().map(ToString::to_string).collect(),
            }],
        })
    }

    #[test]
    fn status_codes_follow_error_kind() {
        let insufficient = AllocationError::InsufficientResources {
            resource: "r".to_string(),
            requested: 2,
            available: 1,
        };
        assert_eq!(status_for(&insufficient).code(), Code::ResourceExhausted);
        let timeout = AllocationError::ReprogramTimeout {
            region: RegionId::new("port.0"),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(status_for(&timeout).code(), Code::DeadlineExceeded);
        let missing = AllocationError::MissingFunction {
            resource: "r".to_string(),
        };
        assert_eq!(status_for(&missing).code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn allocate_uses_pending_pod_function() {
        let service = service(
            vec![region("port.0", Some(NLB0), true)],
            Some(pending_pod(&function(NLB3), 1)),
        );

        let response = service
            .allocate(allocate_request(&["port.0"]))
            .await
            .unwrap()
            .into_inner();

        let container = &response.container_responses[0];
        assert_eq!(container.devices[0].host_path, "/dev/port.0");
        assert_eq!(container.envs["FPGA_AFU_1"], NLB3);
        assert_eq!(
            container.annotations[FUNCTION_ANNOTATION],
            function(NLB3).to_string()
        );
    }

    #[tokio::test]
    async fn allocate_without_function_is_rejected() {
        let service = service(vec![region("port.0", None, true)], None);

        let status = service
            .allocate(allocate_request(&["port.0"]))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn failed_container_releases_earlier_containers() {
        let service = service(
            vec![region("port.0", None, true)],
            Some(pending_pod(&function(NLB0), 2)),
        );
        let request = Request::new(AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["port.0".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["port.1".to_string()],
                },
            ],
        });

        let status = service.allocate(request).await.unwrap_err();

        assert_eq!(status.code(), Code::ResourceExhausted);
        let inventory = service.device_plugin.allocator.inventory();
        assert!(!inventory.get(&RegionId::new("port.0")).unwrap().state().assigned);
    }

    #[tokio::test]
    async fn list_and_watch_follows_health() {
        let service = service(
            vec![region("port.0", None, true), region("port.1", None, true)],
            None,
        );
        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.devices.len(), 2);

        service
            .device_plugin
            .allocator
            .inventory()
            .apply_scan(vec![region("port.0", None, false), region("port.1", None, true)]);

        let second = stream.next().await.unwrap().unwrap();
        let ids: Vec<&str> = second.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["port.1"]);
    }

    #[test_log::test(tokio::test)]
    async fn list_and_watch_is_not_held_up_by_reprogramming() {
        let service = Arc::new(service_with(
            vec![region("port.0", None, true), region("port.1", None, true)],
            Some(pending_pod(&function(NLB3), 1)),
            FakeProgrammer {
                delay: Some(Duration::from_millis(300)),
                ..Default::default()
            },
        ));
        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        stream.next().await.unwrap().unwrap();

        let allocation = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.allocate(allocate_request(&["port.0"])).await })
        };
        let inventory = service.device_plugin.allocator.inventory().clone();
        let slot = inventory.get(&RegionId::new("port.0")).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !matches!(slot.phase(), RegionPhase::Programming(_)) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        inventory.apply_scan(vec![region("port.0", None, true), region("port.1", None, false)]);
        let update = tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .expect("update must not wait for the reprogram")
            .unwrap()
            .unwrap();
        let ids: Vec<&str> = update.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["port.0"]);
        assert!(!allocation.is_finished());

        allocation.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn preferred_allocation_picks_loaded_region() {
        let service = service(
            vec![
                region("port.0", None, true),
                region("port.1", Some(NLB3), true),
            ],
            Some(pending_pod(&function(NLB3), 1)),
        );
        let request = Request::new(PreferredAllocationRequest {
            container_requests: vec![ContainerPreferredAllocationRequest {
                available_device_i_ds: vec!["port.0".to_string(), "port.1".to_string()],
                must_include_device_i_ds: Vec::new(),
                allocation_size: 1,
            }],
        });

        let response = service
            .get_preferred_allocation(request)
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            response.container_responses[0].device_i_ds,
            vec!["port.1".to_string()]
        );
    }

    #[tokio::test]
    async fn serves_over_unix_socket() {
        let dir = TempDir::new().unwrap();
        let service = service(vec![region("port.0", None, true)], None);
        let plugin = Arc::clone(&service.device_plugin);
        let token = CancellationToken::new();

        plugin.start(dir.path(), token.clone()).await.unwrap();
        let channel = create_uds_channel(&plugin.socket_path(dir.path()))
            .await
            .unwrap();
        let mut client = DevicePluginClient::new(channel);

        let options = client
            .get_device_plugin_options(Empty {})
            .await
            .unwrap()
            .into_inner();
        assert!(options.get_preferred_allocation_available);
        token.cancel();
    }
}
