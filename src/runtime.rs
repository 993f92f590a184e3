use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions, RestartContainerOptions};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

// =============================================================================
// Runtime Gateway Interface
// =============================================================================

/// One row of the runtime's container list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectInfo {
    pub restart_count: i64,
    /// Empty when the container defines no healthcheck.
    pub health: String,
    pub created_at: DateTime<Utc>,
}

impl InspectInfo {
    /// Time since the container was created; zero if the clocks disagree.
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub full: String,
}

impl RuntimeVersion {
    /// Digits-only rendering for use as a metric value: release part only,
    /// separators dropped (`24.0.7` -> `2407`, `18.09.1-ce` -> `18091`).
    pub fn numeric(&self) -> String {
        let release = self
            .full
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let digits: String = release.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            "0".to_string()
        } else {
            digits
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("runtime {op} call failed: {source}")]
    Runtime {
        op: &'static str,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("runtime {op} call timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("malformed runtime response: {0}")]
    Malformed(String),
}

/// The operations the health engine needs from a container runtime.
pub trait RuntimeGateway: Send + Sync + 'static {
    fn list_all_containers(
        &self,
    ) -> impl Future<Output = Result<Vec<ContainerSummary>, GatewayError>> + Send;

    fn inspect(
        &self,
        id: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<InspectInfo, GatewayError>> + Send;

    /// Restart with `grace_seconds` for a clean stop before the kill.
    fn restart(
        &self,
        id: &str,
        grace_seconds: u32,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    fn version(&self) -> impl Future<Output = Result<RuntimeVersion, GatewayError>> + Send;
}

// =============================================================================
// Docker Engine Client
// =============================================================================

const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerGateway {
    docker: Docker,
}

impl DockerGateway {
    pub fn connect(socket: &str) -> Result<Self, GatewayError> {
        let docker =
            Docker::connect_with_socket(socket, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|source| GatewayError::Runtime {
                    op: "connect",
                    source,
                })?;
        Ok(Self { docker })
    }
}

impl RuntimeGateway for DockerGateway {
    async fn list_all_containers(&self) -> Result<Vec<ContainerSummary>, GatewayError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|source| GatewayError::Runtime { op: "list", source })?;

        let mut summaries = Vec::with_capacity(containers.len());
        for container in containers {
            // Docker prefixes names with '/'
            let name = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string());

            let (Some(id), Some(name)) = (container.id, name) else {
                warn!("Skipping container summary without id or name");
                continue;
            };

            summaries.push(ContainerSummary {
                id,
                name,
                image: container.image.unwrap_or_default(),
                state: container.state.unwrap_or_default(),
            });
        }

        debug!(count = summaries.len(), "Listed containers");
        Ok(summaries)
    }

    async fn inspect(&self, id: &str, timeout: Duration) -> Result<InspectInfo, GatewayError> {
        let response = tokio::time::timeout(
            timeout,
            self.docker
                .inspect_container(id, None::<InspectContainerOptions>),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            op: "inspect",
            timeout,
        })?
        .map_err(|source| GatewayError::Runtime {
            op: "inspect",
            source,
        })?;

        let health = response
            .state
            .as_ref()
            .and_then(|state| state.health.as_ref())
            .and_then(|health| health.status.as_ref())
            .map(|status| status.to_string())
            .unwrap_or_default();

        let created = response
            .created
            .as_deref()
            .ok_or_else(|| GatewayError::Malformed(format!("container {id} has no creation time")))?;
        let created_at = DateTime::parse_from_rfc3339(created)
            .map_err(|e| {
                GatewayError::Malformed(format!("container {id} creation time {created:?}: {e}"))
            })?
            .with_timezone(&Utc);

        Ok(InspectInfo {
            restart_count: response.restart_count.unwrap_or_default(),
            health,
            created_at,
        })
    }

    async fn restart(&self, id: &str, grace_seconds: u32) -> Result<(), GatewayError> {
        let options = RestartContainerOptions {
            t: grace_seconds as isize,
        };

        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(|source| GatewayError::Runtime {
                op: "restart",
                source,
            })
    }

    async fn version(&self) -> Result<RuntimeVersion, GatewayError> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|source| GatewayError::Runtime {
                op: "version",
                source,
            })?;

        let full = version
            .version
            .ok_or_else(|| GatewayError::Malformed("version response has no version".into()))?;
        Ok(RuntimeVersion { full })
    }
}

// =============================================================================
// Scripted Gateway (tests)
// =============================================================================
