use serde::{Deserialize, Serialize};

/// Connection manager event types.
///
/// Discriminants follow `enum rdma_cm_event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CmEventKind {
    AddressResolved = 0,
    AddressError = 1,
    RouteResolved = 2,
    RouteError = 3,
    ConnectRequest = 4,
    ConnectResponse = 5,
    ConnectError = 6,
    Unreachable = 7,
    Rejected = 8,
    Established = 9,
    Disconnected = 10,
    DeviceRemoval = 11,
    MulticastJoin = 12,
    MulticastError = 13,
    AddressChange = 14,
    TimewaitExit = 15,
}

impl TryFrom<u32> for CmEventKind {
    type Error = u32;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        use CmEventKind::*;

        Ok(match n {
            0 => AddressResolved,
            1 => AddressError,
            2 => RouteResolved,
            3 => RouteError,
            4 => ConnectRequest,
            5 => ConnectResponse,
            6 => ConnectError,
            7 => Unreachable,
            8 => Rejected,
            9 => Established,
            10 => Disconnected,
            11 => DeviceRemoval,
            12 => MulticastJoin,
            13 => MulticastError,
            14 => AddressChange,
            15 => TimewaitExit,
            n => return Err(n),
        })
    }
}

/// A connection manager event, copied out of the provider's event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmEvent<Id> {
    pub kind: CmEventKind,

    /// The endpoint this event is about. For a connect request this is the
    /// newly surfaced endpoint, not the listening one.
    pub id: Id,

    /// The listening endpoint that surfaced `id`, for connect requests.
    pub listen_id: Option<Id>,

    /// Provider status code; zero on success.
    pub status: i32,
}

impl<Id> CmEvent<Id> {
    pub fn new(kind: CmEventKind, id: Id) -> Self {
        Self {
            kind,
            id,
            listen_id: None,
            status: 0,
        }
    }
}

/// Connection parameters for connect and accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnParam {
    /// Outstanding RDMA read and atomic operations this side accepts.
    pub responder_resources: u8,

    /// Outstanding RDMA read and atomic operations this side issues.
    pub initiator_depth: u8,

    /// Transport retries on timeout.
    pub retry_count: u8,

    /// Retries after a receiver-not-ready NAK. 7 retries forever.
    pub rnr_retry_count: u8,
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 7,
            rnr_retry_count: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_from_raw() {
        assert_eq!(CmEventKind::try_from(4), Ok(CmEventKind::ConnectRequest));
        assert_eq!(CmEventKind::try_from(10), Ok(CmEventKind::Disconnected));
        assert_eq!(CmEventKind::try_from(15), Ok(CmEventKind::TimewaitExit));
        assert_eq!(CmEventKind::try_from(16), Err(16));
    }
}
