//! Errors raised at the container runtime boundary.

use thiserror::Error;

/// Errors that can occur while talking to the Docker daemon on the remote machine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The client could not be constructed (bad address or TLS material).
    #[error("Cannot create Docker client for {host}: {source}")]
    Client {
        host: String,
        #[source]
        source: bollard::errors::Error,
    },

    /// The daemon did not answer the initial ping.
    #[error("Docker on machine '{machine}' is unreachable: {source}")]
    Unreachable {
        machine: String,
        #[source]
        source: bollard::errors::Error,
    },

    /// The connection broke while a request or the event stream was in flight.
    #[error("Lost connection to Docker: {0}")]
    Transport(#[source] bollard::errors::Error),

    /// The event stream ended.
    #[error("Docker event stream closed")]
    StreamClosed,

    /// The container does not exist (any more).
    #[error("No such container: {0}")]
    NotFound(String),

    /// The daemon answered with an error status.
    #[error("Docker API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// An event did not carry the fields needed to act on it.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
}

impl RuntimeError {
    /// Classify an error returned by a request about `container`.
    pub fn from_request(container: &str, err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound(container.to_string()),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Api {
                status: status_code,
                message,
            },
            other => RuntimeError::Transport(other),
        }
    }

    /// Classify an error read from the event stream. Undecodable events are not a
    /// lost connection.
    pub fn from_stream(err: bollard::errors::Error) -> Self {
        match err {
            decode @ (bollard::errors::Error::JsonDataError { .. }
            | bollard::errors::Error::JsonSerdeError { .. }) => {
                RuntimeError::MalformedEvent(decode.to_string())
            }
            other => RuntimeError::Transport(other),
        }
    }

    /// True when the remote endpoint should be considered gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RuntimeError::Unreachable { .. }
                | RuntimeError::Transport(_)
                | RuntimeError::StreamClosed
        )
    }

    /// Remediation shown to the user for fatal failures.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            RuntimeError::Client { .. } => Some(
                "Check DOCKER_HOST and DOCKER_CERT_PATH, or run `docker-machine regenerate-certs <name>`",
            ),
            RuntimeError::Unreachable { .. } | RuntimeError::Transport(_) => Some(
                "Make sure the machine is running (`docker-machine start <name>`) and re-run `eval $(docker-machine env <name>)`",
            ),
            RuntimeError::StreamClosed => {
                Some("The machine was probably stopped; restart it and run `portbridge restart`")
            }
            _ => None,
        }
    }
}
