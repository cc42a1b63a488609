// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Registration with the kubelet, both ways: the `Register` call we make, and the plugin
//! watcher callbacks the kubelet makes on our socket.

use crate::api::pluginregistration::registration_server::Registration;
use crate::api::pluginregistration::{
    DEVICE_PLUGIN, InfoRequest, PluginInfo, RegistrationStatus, RegistrationStatusResponse,
};
use crate::api::v1beta1::registration_client::RegistrationClient;
use crate::api::v1beta1::{DevicePluginOptions, RegisterRequest, VERSION};
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use net::ResourceName;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Request, Response, Status};
use tower::service_fn;
use tracing::{debug, info, warn};

/// Whether the kubelet currently knows about us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationSession {
    pub registered: bool,
    pub last_error: Option<String>,
}

impl RegistrationSession {
    #[must_use]
    pub fn registered() -> RegistrationSession {
        RegistrationSession {
            registered: true,
            last_error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> RegistrationSession {
        RegistrationSession {
            registered: false,
            last_error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("failed to serve on {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("registration with {0} timed out")]
    Timeout(PathBuf),
    #[error("registration request failed: {0}")]
    Rpc(Box<Status>),
    #[error("registration rejected: {0}")]
    Rejected(String),
}

impl From<Status> for RegistrationError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::InvalidArgument
            | Code::FailedPrecondition
            | Code::AlreadyExists
            | Code::PermissionDenied
            | Code::Unimplemented => RegistrationError::Rejected(status.message().to_string()),
            _ => RegistrationError::Rpc(Box::new(status)),
        }
    }
}

/// Open a gRPC channel over the unix socket at `path`.
pub async fn connect(path: &Path) -> Result<Channel, tonic::transport::Error> {
    let path = path.to_path_buf();
    // the authority is ignored: every connection goes to the socket
    Endpoint::from_static("http://localhost")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
}

/// The `Register` request advertising `resource` on the socket named `endpoint`.
#[must_use]
pub fn register_request(resource: &ResourceName, endpoint: &str) -> RegisterRequest {
    RegisterRequest {
        version: VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource.to_string(),
        options: Some(plugin_options()),
    }
}

pub(crate) fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: true,
    }
}

/// Make one registration attempt with the kubelet listening on `kubelet_socket`.
pub async fn register(
    kubelet_socket: &Path,
    request: RegisterRequest,
    timeout: Duration,
) -> Result<(), RegistrationError> {
    let attempt = async {
        let channel = connect(kubelet_socket)
            .await
            .map_err(|source| RegistrationError::Connect {
                path: kubelet_socket.to_path_buf(),
                source,
            })?;
        debug!(
            "Registering {} on {}",
            request.resource_name, request.endpoint
        );
        RegistrationClient::new(channel).register(request).await?;
        Ok::<(), RegistrationError>(())
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| RegistrationError::Timeout(kubelet_socket.to_path_buf()))?
}

/// Plugin watcher registration service, served on the plugin socket.
pub struct PluginRegistrationService {
    info: PluginInfo,
    session: Arc<watch::Sender<RegistrationSession>>,
}

impl PluginRegistrationService {
    #[must_use]
    pub fn new(
        resource: &ResourceName,
        endpoint: &Path,
        session: Arc<watch::Sender<RegistrationSession>>,
    ) -> PluginRegistrationService {
        PluginRegistrationService {
            info: PluginInfo {
                r#type: DEVICE_PLUGIN.to_string(),
                name: resource.to_string(),
                endpoint: endpoint.display().to_string(),
                supported_versions: vec![VERSION.to_string()],
            },
            session,
        }
    }
}

#[async_trait]
impl Registration for PluginRegistrationService {
    async fn get_info(
        &self,
        _request: Request<InfoRequest>,
    ) -> Result<Response<PluginInfo>, Status> {
        Ok(Response::new(self.info.clone()))
    }

    async fn notify_registration_status(
        &self,
        request: Request<RegistrationStatus>,
    ) -> Result<Response<RegistrationStatusResponse>, Status> {
        let status = request.into_inner();
        let session = if status.plugin_registered {
            info!("Kubelet confirmed the registration of {}", self.info.name);
            RegistrationSession::registered()
        } else {
            warn!(
                "Kubelet rejected the registration of {}: {}",
                self.info.name, status.error
            );
            RegistrationSession::failed(status.error)
        };
        self.session.send_replace(session);
        Ok(Response::new(RegistrationStatusResponse {}))
    }
}

#[cfg(test)]
mod test {
    use crate::api::pluginregistration::registration_server::Registration;
    use crate::api::pluginregistration::{InfoRequest, RegistrationStatus};
    use crate::registration::{
        PluginRegistrationService, RegistrationError, RegistrationSession, register,
        register_request,
    };
    use net::ResourceName;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tonic::{Request, Status};
    use tracing_test::traced_test;

    #[test]
    fn request_advertises_the_resource() {
        let request = register_request(&ResourceName::default(), "netdevice.sock");
        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "netdevice.sock");
        assert_eq!(request.resource_name, "networking.k8s.io/netdevice");
        let options = request.options.unwrap();
        assert!(!options.pre_start_required);
        assert!(options.get_preferred_allocation_available);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            RegistrationError::from(Status::invalid_argument("duplicate")),
            RegistrationError::Rejected(m) if m == "duplicate"
        ));
        assert!(matches!(
            RegistrationError::from(Status::unavailable("later")),
            RegistrationError::Rpc(_)
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_kubelet_fails_the_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let result = register(
            &dir.path().join("kubelet.sock"),
            register_request(&ResourceName::default(), "netdevice.sock"),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(RegistrationError::Connect { .. })));
    }

    #[tokio::test]
    #[traced_test]
    async fn plugin_watcher_callbacks_update_the_session() {
        let (session, mut watcher) = watch::channel(RegistrationSession::default());
        let service = PluginRegistrationService::new(
            &ResourceName::default(),
            Path::new("/var/lib/kubelet/device-plugins/netdevice.sock"),
            Arc::new(session),
        );

        let info = service
            .get_info(Request::new(InfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.r#type, "DevicePlugin");
        assert_eq!(info.name, "networking.k8s.io/netdevice");
        assert_eq!(
            info.endpoint,
            "/var/lib/kubelet/device-plugins/netdevice.sock"
        );
        assert_eq!(info.supported_versions, vec!["v1beta1"]);

        service
            .notify_registration_status(Request::new(RegistrationStatus {
                plugin_registered: true,
                error: String::new(),
            }))
            .await
            .unwrap();
        assert_eq!(*watcher.borrow_and_update(), RegistrationSession::registered());

        service
            .notify_registration_status(Request::new(RegistrationStatus {
                plugin_registered: false,
                error: "resource name clash".to_string(),
            }))
            .await
            .unwrap();
        assert!(watcher.has_changed().unwrap());
        assert_eq!(
            *watcher.borrow(),
            RegistrationSession::failed("resource name clash")
        );
        assert!(logs_contain("rejected"));
    }
}
