use std::io;

use thiserror::Error;

use crate::cm::CmEventKind;
use crate::config::ConfigError;
use crate::peer::ConnId;
use crate::rdma::cq::WcStatus;

/// Errors surfaced by the echo service.
#[derive(Debug, Error)]
pub enum Error {
    /// A provider call failed.
    #[error("{op} failed: {source}")]
    Provider {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The transport context is already bound to another device.
    #[error("transport context is bound to device {bound}, cannot serve {requested}")]
    DeviceMismatch { bound: String, requested: String },

    /// The endpoint has not been bound to an RDMA device yet.
    #[error("endpoint is not bound to an RDMA device")]
    NoDevice,

    /// A connection manager event arrived outside the expected transitions.
    #[error("unexpected CM event {event:?} in state {state}")]
    UnexpectedEvent {
        event: CmEventKind,
        state: &'static str,
    },

    /// A connection manager event refers to an endpoint nobody tracks.
    #[error("CM event for an untracked endpoint")]
    UnknownEndpoint,

    /// The connection has already been destroyed.
    #[error("connection {0} has been destroyed")]
    Destroyed(ConnId),

    /// A work completion carried an error status.
    #[error("work completion failed: {0}")]
    Completion(#[from] WcStatus),

    /// Failed to load the configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attach the name of the failed provider call to an I/O error.
pub(crate) trait ProviderResultExt<T> {
    fn during(self, op: &'static str) -> Result<T>;
}

impl<T> ProviderResultExt<T> for io::Result<T> {
    #[inline]
    fn during(self, op: &'static str) -> Result<T> {
        self.map_err(|source| Error::Provider { op, source })
    }
}
