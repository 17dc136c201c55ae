use std::{fmt, net::IpAddr};

use uuid::Uuid;

/// Per-request details threaded through the relay purely for logging and
/// tracing; nothing here changes how a request is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    pub connection_id: Uuid,
    pub ip: IpAddr,
}

impl RequestContext {
    pub fn new(connection_id: Uuid, ip: IpAddr) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            connection_id,
            ip,
        }
    }

    /// Derives a context for one element of a batch, keeping the connection.
    pub fn child(&self) -> Self {
        Self::new(self.connection_id, self.ip)
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Request ID: {}] [Connection ID: {}]",
            self.request_id, self.connection_id
        )
    }
}
