// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The device plugin gRPC service.

use crate::api::v1beta1::device_plugin_server::DevicePlugin;
use crate::api::v1beta1::{
    AllocateRequest, AllocateResponse, CdiDevice, ContainerAllocateResponse,
    ContainerPreferredAllocationResponse, Device, DevicePluginOptions, Empty,
    ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use crate::config::PluginConfig;
use crate::inventory::Inventory;
use crate::policy::Debounce;
use crate::registration::plugin_options;
use async_trait::async_trait;
use cdi::{DescriptorConfig, Registry, qualified_name};
use interface_manager::{LinkEvent, LinkEvents};
use net::{Health, InterfaceName, NetworkDevice, ResourceName};
use pool::{DevicePool, PoolError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, trace, warn};

/// Pod annotation listing the devices handed to a container.
pub const DEVICES_ANNOTATION: &str = "networking.k8s.io/netdevices";

/// Pending `ListAndWatch` responses per watcher.
const WATCH_BACKLOG: usize = 4;

type WatchSender = mpsc::Sender<Result<ListAndWatchResponse, Status>>;

pub struct DevicePluginService<I> {
    shared: Arc<Shared<I>>,
    cancel: CancellationToken,
}

struct Shared<I> {
    inventory: Arc<I>,
    pool: Arc<DevicePool>,
    registry: Registry,
    descriptors: DescriptorConfig,
    resource: ResourceName,
    resync: Duration,
    debounce: Debounce,
}

enum Wake {
    Stop,
    Tick,
    Link(Option<LinkEvent>),
}

async fn next_event(events: &mut Option<LinkEvents>) -> Option<LinkEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn invalid_id(id: &str, reason: impl std::fmt::Display) -> Status {
    Status::invalid_argument(format!("invalid device id '{id}': {reason}"))
}

fn parse_ids(ids: &[String]) -> Result<Vec<InterfaceName>, Status> {
    ids.iter()
        .map(|id| InterfaceName::new(id.as_str()).map_err(|e| invalid_id(id, e)))
        .collect()
}

impl<I: Inventory> Shared<I> {
    /// Write the descriptor of `device`, recording its file name in `keep`.
    fn publish(&self, device: &NetworkDevice, keep: &mut BTreeSet<String>) -> bool {
        match self.registry.publish(device, &self.descriptors) {
            Ok(descriptor) => {
                keep.insert(descriptor.file_name);
                true
            }
            Err(e) => {
                warn!("Not advertising {}: {e}", device.name);
                false
            }
        }
    }

    /// One refresh cycle: put devices whose containers are gone back into service, rescan,
    /// publish the descriptors and compute the device list to advertise.
    ///
    /// Returns `None`, leaving the pool and the descriptors as they were, if the host could not
    /// be scanned.
    async fn refresh(&self) -> Option<Vec<Device>> {
        let away = self.pool.away();
        let mut reclaimed = Vec::new();
        for stray in self.inventory.strays(&away).await {
            match self.inventory.reclaim(&stray).await {
                Ok(name) => {
                    info!("{stray} came back from a container as {name}");
                    reclaimed.push(name);
                }
                Err(e) => warn!("Failed to reclaim {stray}: {e}"),
            }
        }
        self.pool.release(&reclaimed);

        let scanned = match self.inventory.scan().await {
            Ok(scanned) => scanned,
            Err(e) => {
                warn!("Failed to scan the host, keeping the previous inventory: {e}");
                return None;
            }
        };

        let mut keep = BTreeSet::new();
        let mut advertised = Vec::with_capacity(scanned.len());
        let mut inventory = Vec::with_capacity(scanned.len());
        for device in scanned {
            if self.publish(&device, &mut keep) {
                advertised.push(device.clone());
                inventory.push(device);
            } else {
                // without a descriptor the device cannot be handed out this cycle
                inventory.push(NetworkDevice {
                    health: Health::Unhealthy,
                    ..device
                });
            }
        }
        self.pool.refresh(&inventory);

        // devices living in containers stay advertised
        let present: BTreeSet<InterfaceName> = inventory.iter().map(|d| d.name.clone()).collect();
        for device in self.pool.assigned() {
            if !present.contains(&device.name) && self.publish(&device, &mut keep) {
                advertised.push(device);
            }
        }

        if let Err(e) = self.registry.prune(&keep) {
            warn!("Failed to prune stale descriptors: {e}");
        }
        Some(
            advertised
                .iter()
                .map(|device| Device {
                    id: device.name.to_string(),
                    health: device.health.to_string(),
                    topology: None,
                })
                .collect(),
        )
    }

    async fn watch(self: Arc<Self>, tx: WatchSender, cancel: CancellationToken) {
        let mut events = match self.inventory.subscribe().await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("No link change notifications, relying on the resync tick: {e}");
                None
            }
        };
        loop {
            if let Some(devices) = self.refresh().await {
                debug!("Advertising {} devices", devices.len());
                if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                    debug!("Watcher went away");
                    return;
                }
            }
            let wake = tokio::select! {
                () = cancel.cancelled() => Wake::Stop,
                () = tx.closed() => Wake::Stop,
                () = tokio::time::sleep(self.resync) => Wake::Tick,
                event = next_event(&mut events) => Wake::Link(event),
            };
            match wake {
                Wake::Stop => {
                    debug!("Stopping ListAndWatch");
                    return;
                }
                Wake::Tick => trace!("Resync tick"),
                Wake::Link(Some(event)) => {
                    trace!("Link {} changed", event.index);
                    if let Some(pending) = events.as_mut() {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            _ = self.debounce.settle(pending) => {}
                        }
                    }
                }
                Wake::Link(None) => {
                    warn!("Link change notifications stopped, relying on the resync tick");
                    events = None;
                }
            }
        }
    }

    fn container_response(&self, devices: &[NetworkDevice]) -> ContainerAllocateResponse {
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        ContainerAllocateResponse {
            cdi_devices: devices
                .iter()
                .map(|d| CdiDevice {
                    name: qualified_name(&self.resource, &d.name),
                })
                .collect(),
            annotations: [(DEVICES_ANNOTATION.to_string(), names.join(","))]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }
}

impl<I: Inventory> DevicePluginService<I> {
    /// The service of one serving attempt.  `cancel` stops every stream it opened.
    pub fn new(
        inventory: Arc<I>,
        pool: Arc<DevicePool>,
        config: &PluginConfig,
        cancel: CancellationToken,
    ) -> DevicePluginService<I> {
        DevicePluginService {
            shared: Arc::new(Shared {
                inventory,
                pool,
                registry: Registry::new(&config.cdi_dir, config.resource_name.clone()),
                descriptors: config.descriptor_config(),
                resource: config.resource_name.clone(),
                resync: config.resync_interval,
                debounce: config.debounce,
            }),
            cancel,
        }
    }

    /// Run one refresh cycle and return the device list it would advertise, or `None` if the
    /// host could not be scanned.
    pub async fn refresh(&self) -> Option<Vec<Device>> {
        self.shared.refresh().await
    }
}

#[async_trait]
impl<I: Inventory> DevicePlugin for DevicePluginService<I> {
    type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options()))
    }

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        info!("Kubelet opened ListAndWatch");
        let (tx, rx) = mpsc::channel(WATCH_BACKLOG);
        let shared = self.shared.clone();
        tokio::spawn(shared.watch(tx, self.cancel.child_token()));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let request = request.into_inner();
        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for container in &request.container_requests {
            let candidates = parse_ids(&container.available_device_ids)?;
            let must_include = parse_ids(&container.must_include_device_ids)?;
            let size = usize::try_from(container.allocation_size).map_err(|_| {
                Status::invalid_argument(format!(
                    "invalid allocation size {}",
                    container.allocation_size
                ))
            })?;
            let preferred = self.shared.pool.preferred(&candidates, &must_include, size);
            container_responses.push(ContainerPreferredAllocationResponse {
                device_ids: preferred.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        let mut counts = Vec::with_capacity(request.container_requests.len());
        let mut requested = Vec::new();
        for container in &request.container_requests {
            let ids = parse_ids(&container.devices_ids)?;
            counts.push(ids.len());
            requested.extend(ids);
        }

        let taken = self
            .shared
            .pool
            .take_requested(&requested)
            .map_err(|e: PoolError| Status::resource_exhausted(e.to_string()))?;
        info!(
            "Allocated {}",
            taken
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut remaining = taken.as_slice();
        let mut container_responses = Vec::with_capacity(counts.len());
        for count in counts {
            let (devices, rest) = remaining.split_at(count.min(remaining.len()));
            container_responses.push(self.shared.container_response(devices));
            remaining = rest;
        }
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod test {
    use crate::api::v1beta1::device_plugin_server::DevicePlugin;
    use crate::api::v1beta1::{
        AllocateRequest, ContainerAllocateRequest, ContainerPreferredAllocationRequest, Empty,
        PreferredAllocationRequest,
    };
    use crate::config::{PluginConfig, PluginConfigBuilder};
    use crate::policy::Debounce;
    use crate::server::{DEVICES_ANNOTATION, DevicePluginService};
    use cdi::Registry;
    use interface_manager::fake::{FakeKernel, FakeLinks, FakeOp};
    use interface_manager::{LinkError, LinkOps, ScanPolicy, Scanner};
    use net::{InterfaceName, ResourceName};
    use pool::DevicePool;
    use pretty_assertions::assert_eq;
    use regex::Regex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;
    use tonic::{Code, Request};
    use tracing_test::traced_test;

    struct Fixture {
        kernel: FakeKernel,
        pool: Arc<DevicePool>,
        service: DevicePluginService<Scanner<FakeLinks>>,
        config: PluginConfig,
        cancel: CancellationToken,
        _cdi: tempfile::TempDir,
    }

    fn fixture(pattern: &str) -> Fixture {
        let kernel = FakeKernel::new();
        kernel.add_loopback(FakeKernel::HOST);
        let eth0 = kernel.add_link(FakeKernel::HOST, "eth0", true);
        kernel.set_default_route(FakeKernel::HOST, eth0);
        kernel.add_link(FakeKernel::HOST, "eth1", true);
        kernel.add_link(FakeKernel::HOST, "eth2", true);
        kernel.add_link(FakeKernel::HOST, "eth3", false);

        let cdi = tempfile::tempdir().unwrap();
        let config = PluginConfigBuilder::default()
            .cdi_dir(cdi.path())
            .scan_policy(ScanPolicy::new(Some(Regex::new(pattern).unwrap())))
            .resync_interval(Duration::from_secs(3600))
            .debounce(Debounce::new(Duration::from_millis(10)))
            .build()
            .unwrap();
        let scanner = Scanner::new(kernel.handle(FakeKernel::HOST), config.scan_policy.clone());
        let pool = Arc::new(DevicePool::new());
        let cancel = CancellationToken::new();
        let service = DevicePluginService::new(
            Arc::new(scanner),
            pool.clone(),
            &config,
            cancel.clone(),
        );
        Fixture {
            kernel,
            pool,
            service,
            config,
            cancel,
            _cdi: cdi,
        }
    }

    fn allocate_request(containers: &[&[&str]]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: containers
                .iter()
                .map(|ids| ContainerAllocateRequest {
                    devices_ids: ids.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        })
    }

    #[tokio::test]
    #[traced_test]
    async fn refresh_advertises_and_publishes() {
        let f = fixture("eth[123]");
        let devices = f.service.refresh().await.unwrap();
        let listed: Vec<(&str, &str)> = devices
            .iter()
            .map(|d| (d.id.as_str(), d.health.as_str()))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("eth1", "Healthy"),
                ("eth2", "Healthy"),
                ("eth3", "Unhealthy")
            ]
        );
        let registry = Registry::new(&f.config.cdi_dir, ResourceName::default());
        assert_eq!(registry.list().unwrap().len(), 3);
        assert_eq!(f.pool.available().len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn vanished_devices_lose_their_descriptor() {
        let f = fixture("eth[123]");
        f.service.refresh().await.unwrap();
        let eth3 = f
            .kernel
            .handle(FakeKernel::HOST)
            .links()
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.name.as_str() == "eth3")
            .unwrap()
            .index;
        f.kernel.delete_link(eth3);
        assert_eq!(f.service.refresh().await.unwrap().len(), 2);
        let registry = Registry::new(&f.config.cdi_dir, ResourceName::default());
        let names = registry.list().unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.contains("_eth3-")));
    }

    #[tokio::test]
    #[traced_test]
    async fn allocation_hands_out_cdi_devices() {
        let f = fixture("eth[12]");
        f.service.refresh().await.unwrap();
        let response = f
            .service
            .allocate(allocate_request(&[&["eth2"]]))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.container_responses.len(), 1);
        let container = &response.container_responses[0];
        assert_eq!(
            container.cdi_devices[0].name,
            "networking.k8s.io/netdevice=eth2"
        );
        assert_eq!(container.annotations[DEVICES_ANNOTATION], "eth2");
        assert_eq!(f.pool.available().len(), 1);
        assert_eq!(f.pool.available()[0].name.as_str(), "eth1");
    }

    #[tokio::test]
    #[traced_test]
    async fn exhaustion_takes_nothing() {
        let f = fixture("eth[12]");
        f.service.refresh().await.unwrap();
        f.service
            .allocate(allocate_request(&[&["eth1"]]))
            .await
            .unwrap();
        let status = f
            .service
            .allocate(allocate_request(&[&["a"], &["b"]]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::ResourceExhausted);
        assert_eq!(f.pool.available().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn unavailable_ids_fall_back_to_pool_order() {
        let f = fixture("eth[12]");
        f.service.refresh().await.unwrap();
        let response = f
            .service
            .allocate(allocate_request(&[&["eth9"], &["eth1"]]))
            .await
            .unwrap()
            .into_inner();
        let names: Vec<&str> = response
            .container_responses
            .iter()
            .map(|c| c.annotations[DEVICES_ANNOTATION].as_str())
            .collect();
        assert_eq!(names, vec!["eth1", "eth2"]);
        assert!(f.pool.available().is_empty());
    }

    #[tokio::test]
    async fn malformed_ids_are_invalid_arguments() {
        let f = fixture("eth[12]");
        f.service.refresh().await.unwrap();
        let status = f
            .service
            .allocate(allocate_request(&[&["not/a/name"]]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(f.pool.available().len(), 2);
    }

    #[tokio::test]
    async fn preferred_allocation_is_advisory() {
        let f = fixture("eth[12]");
        f.service.refresh().await.unwrap();
        let response = f
            .service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest {
                container_requests: vec![ContainerPreferredAllocationRequest {
                    available_device_ids: vec!["eth2".into(), "eth1".into()],
                    must_include_device_ids: vec!["eth2".into()],
                    allocation_size: 2,
                }],
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.container_responses[0].device_ids,
            vec!["eth2", "eth1"]
        );
        assert_eq!(f.pool.available().len(), 2);
    }

    #[tokio::test]
    async fn options() {
        let f = fixture("eth[12]");
        let options = f
            .service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(!options.pre_start_required);
        assert!(options.get_preferred_allocation_available);
    }

    #[tokio::test]
    #[traced_test]
    async fn container_exit_returns_the_device() {
        let f = fixture("eth[12]");
        f.service.refresh().await.unwrap();
        f.service
            .allocate(allocate_request(&[&["eth1"]]))
            .await
            .unwrap();

        // the container takes the link and renames it
        let container = f.kernel.add_namespace();
        let host = f.kernel.handle(FakeKernel::HOST);
        let eth1 = host
            .link(&InterfaceName::new("eth1").unwrap().into())
            .await
            .unwrap();
        host.set_admin_state(eth1.index, false).await.unwrap();
        host.set_alias(eth1.index, "eth1").await.unwrap();
        host.move_to(eth1.index, &container).await.unwrap();
        let inside = f.kernel.handle(container);
        inside
            .rename(eth1.index, &InterfaceName::new("net1").unwrap())
            .await
            .unwrap();

        // still advertised while away, and not allocatable
        let ids: Vec<String> = f
            .service
            .refresh()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["eth2", "eth1"]);
        assert_eq!(f.pool.available().len(), 1);
        assert_eq!(f.pool.away().len(), 1);

        // the container dies: the link comes back down, as net1
        f.kernel.remove_namespace(container);
        f.service.refresh().await.unwrap();
        let eth1 = host
            .link(&InterfaceName::new("eth1").unwrap().into())
            .await
            .unwrap();
        assert!(eth1.up);
        let available: Vec<String> = f
            .pool
            .available()
            .iter()
            .map(|d| d.name.to_string())
            .collect();
        assert_eq!(available, vec!["eth1", "eth2"]);
        assert!(f.pool.assigned().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_scan_between_take_and_refresh_keeps_the_assignment() {
        let f = fixture("eth[12]");
        f.service.refresh().await.unwrap();
        f.service
            .allocate(allocate_request(&[&["eth1"]]))
            .await
            .unwrap();

        // the container has not started, eth1 is still on the host
        f.kernel.fail_next(FakeOp::DefaultRoute, LinkError::Netlink("boom".to_string()));
        assert!(f.service.refresh().await.is_none());
        assert!(logs_contain("keeping the previous inventory"));
        assert!(f.pool.away().is_empty());

        f.service.refresh().await.unwrap();
        let status = f
            .service
            .allocate(allocate_request(&[&["eth1", "eth2"]]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::ResourceExhausted);
        let response = f
            .service
            .allocate(allocate_request(&[&["eth1"]]))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.container_responses[0].annotations[DEVICES_ANNOTATION],
            "eth2"
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn devices_without_a_descriptor_are_withheld() {
        let f = fixture("eth[12]");
        // descriptors cannot be written below a regular file
        std::fs::remove_dir_all(&f.config.cdi_dir).unwrap();
        std::fs::write(&f.config.cdi_dir, b"").unwrap();

        assert!(f.service.refresh().await.unwrap().is_empty());
        assert!(f.pool.available().is_empty());
        let status = f
            .service
            .allocate(allocate_request(&[&["eth1"]]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::ResourceExhausted);

        std::fs::remove_file(&f.config.cdi_dir).unwrap();
        std::fs::create_dir(&f.config.cdi_dir).unwrap();
        assert_eq!(f.service.refresh().await.unwrap().len(), 2);
        assert_eq!(f.pool.available().len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn list_and_watch_follows_link_changes() {
        let f = fixture("eth[123]");
        let mut stream = f
            .service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.devices.len(), 3);

        let eth3 = f
            .kernel
            .handle(FakeKernel::HOST)
            .link(&InterfaceName::new("eth3").unwrap().into())
            .await
            .unwrap();
        f.kernel.update(eth3.index, |link| link.up = true);
        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(second.devices.iter().all(|d| d.health == "Healthy"));

        f.cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
