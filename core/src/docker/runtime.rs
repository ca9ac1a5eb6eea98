//! Docker runtime adapter using bollard.

use std::collections::HashMap;
use std::time::Duration;

use bollard::query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::errors::RuntimeError;
use super::models::{ContainerEvent, ContainerPorts};
use crate::config::MachineEnv;
use crate::ports::{ContainerRuntime, EventFeed};

/// Timeout for ordinary API requests, in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// The event stream is long-lived; only a broken transport should end it.
const EVENT_STREAM_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Buffered events between the reader task and the reconciler.
const EVENT_BUFFER: usize = 64;

/// Container runtime backed by the Docker daemon of a docker-machine VM.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    events: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the daemon described by `env` and verify it answers.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The client cannot be built from the address or TLS files
    /// - The ping to verify connectivity fails
    pub async fn connect(env: &MachineEnv) -> Result<Self, RuntimeError> {
        let docker = build_client(env)?;

        docker
            .ping()
            .await
            .map_err(|source| RuntimeError::Unreachable {
                machine: env.machine_name.clone(),
                source,
            })?;

        info!(machine = %env.machine_name, host = %env.docker_host, "Connected to Docker");
        Ok(Self::with_client(docker))
    }

    /// Wrap a pre-configured bollard client.
    pub fn with_client(docker: Docker) -> Self {
        let events = docker.clone().with_timeout(EVENT_STREAM_TIMEOUT);
        Self { docker, events }
    }

    async fn inspect(&self, container: &str) -> Result<ContainerPorts, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::from_request(container, e))?;
        Ok(ContainerPorts::from(&inspect))
    }
}

fn build_client(env: &MachineEnv) -> Result<Docker, RuntimeError> {
    let client_error = |source| RuntimeError::Client {
        host: env.docker_host.clone(),
        source,
    };

    if env.tls_verify {
        let [ca, cert, key] = env.tls_files();
        Docker::connect_with_ssl(
            &env.docker_host,
            &key,
            &cert,
            &ca,
            REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(client_error)
    } else {
        Docker::connect_with_http(
            &env.docker_host,
            REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(client_error)
    }
}

fn lifecycle_filters() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("type".to_string(), vec!["container".to_string()]),
        (
            "event".to_string(),
            vec!["start".to_string(), "stop".to_string()],
        ),
    ])
}

impl ContainerRuntime for DockerRuntime {
    async fn running_containers(&self) -> Result<Vec<ContainerPorts>, RuntimeError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::default()))
            .await
            .map_err(RuntimeError::Transport)?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id.as_deref() else {
                continue;
            };
            match self.inspect(id).await {
                Ok(ports) => containers.push(ports),
                Err(e) if e.is_transport() => return Err(e),
                // Stopped between list and inspect.
                Err(e) => warn!(container = %id, error = %e, "Skipping container"),
            }
        }

        debug!(count = containers.len(), "Listed running containers");
        Ok(containers)
    }

    async fn container_ports(&self, container: &str) -> Result<ContainerPorts, RuntimeError> {
        self.inspect(container).await
    }

    fn subscribe(&self) -> EventFeed {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let docker = self.events.clone();

        tokio::spawn(async move {
            let options = EventsOptions {
                filters: Some(lifecycle_filters()),
                ..Default::default()
            };
            let mut stream = docker.events(Some(options));

            loop {
                let item = match stream.next().await {
                    Some(Ok(message)) => ContainerEvent::try_from(message),
                    Some(Err(e)) => Err(RuntimeError::from_stream(e)),
                    None => Err(RuntimeError::StreamClosed),
                };
                let fatal = matches!(&item, Err(e) if e.is_transport());

                if tx.send(item).await.is_err() {
                    debug!("Event feed dropped, stopping reader");
                    break;
                }
                if fatal {
                    break;
                }
            }
        });

        rx
    }
}
