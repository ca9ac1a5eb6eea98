//! Container data as seen by the tunnel manager.

use std::collections::BTreeSet;

use bollard::models::{ContainerInspectResponse, EventMessage, PortMap};

use super::errors::RuntimeError;

/// A container and the TCP ports it publishes on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPorts {
    pub name: String,
    /// Host ports, ascending and without duplicates.
    pub ports: Vec<u16>,
}

impl ContainerPorts {
    pub fn new(name: impl Into<String>, ports: impl IntoIterator<Item = u16>) -> Self {
        let ports: BTreeSet<u16> = ports.into_iter().collect();
        Self {
            name: name.into(),
            ports: ports.into_iter().collect(),
        }
    }
}

impl From<&ContainerInspectResponse> for ContainerPorts {
    fn from(inspect: &ContainerInspectResponse) -> Self {
        let name = inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/'))
            .or(inspect.id.as_deref())
            .unwrap_or_default();
        Self::new(name, published_ports(inspect))
    }
}

/// Lifecycle transitions the manager reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Other(String),
}

impl From<&str> for ContainerAction {
    fn from(action: &str) -> Self {
        match action {
            "start" => ContainerAction::Start,
            "stop" => ContainerAction::Stop,
            other => ContainerAction::Other(other.to_string()),
        }
    }
}

/// A container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub action: ContainerAction,
    /// Container name, without the leading slash.
    pub container: String,
}

impl ContainerEvent {
    pub fn new(action: ContainerAction, container: impl Into<String>) -> Self {
        Self {
            action,
            container: container.into(),
        }
    }
}

impl TryFrom<EventMessage> for ContainerEvent {
    type Error = RuntimeError;

    fn try_from(message: EventMessage) -> Result<Self, Self::Error> {
        let action = message
            .action
            .ok_or_else(|| RuntimeError::MalformedEvent("event without action".to_string()))?;

        let actor = message.actor.ok_or_else(|| {
            RuntimeError::MalformedEvent(format!("'{}' event without actor", action))
        })?;

        let container = actor
            .attributes
            .as_ref()
            .and_then(|attrs| attrs.get("name"))
            .filter(|name| !name.is_empty())
            .cloned()
            .ok_or_else(|| {
                RuntimeError::MalformedEvent(format!(
                    "'{}' event for {} without container name",
                    action,
                    actor.id.as_deref().unwrap_or("unknown actor")
                ))
            })?;

        Ok(Self::new(ContainerAction::from(action.as_str()), container))
    }
}

/// Host ports bound for TCP container ports.
///
/// Uses the live bindings of a running container and falls back to the configured
/// bindings once the container has stopped.
pub fn published_ports(inspect: &ContainerInspectResponse) -> Vec<u16> {
    let live = inspect
        .network_settings
        .as_ref()
        .and_then(|settings| settings.ports.as_ref());
    let configured = inspect
        .host_config
        .as_ref()
        .and_then(|config| config.port_bindings.as_ref());

    let ports = live.map(tcp_host_ports).unwrap_or_default();
    if !ports.is_empty() {
        return ports;
    }
    configured.map(tcp_host_ports).unwrap_or_default()
}

fn tcp_host_ports(map: &PortMap) -> Vec<u16> {
    let ports: BTreeSet<u16> = map
        .iter()
        .filter(|(key, _)| key.ends_with("/tcp"))
        .filter_map(|(_, bindings)| bindings.as_ref())
        .flatten()
        .filter_map(|binding| binding.host_port.as_deref())
        .filter_map(|port| port.trim().parse::<u16>().ok())
        .filter(|port| *port != 0)
        .collect();
    ports.into_iter().collect()
}
