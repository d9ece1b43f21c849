use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Command attempted while the link is not `Ready`
    #[error("link is not ready")]
    LinkNotReady,
    /// Another request is still in flight
    #[error("request {0} is still in flight")]
    Busy(u16),
    /// No ACK within the deadline; peripheral state is unknown
    #[error("no ACK for request {0}")]
    Timeout(u16),
    /// Link went down while waiting; peripheral state is unknown
    #[error("link dropped while waiting for request {0}")]
    LinkDropped(u16),
    #[error("payload of {len} bytes exceeds write capacity of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("characteristic lookup incomplete (data: {data}, config: {config})")]
    DiscoveryIncomplete { data: bool, config: bool },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<uwb_proto::EncodeError> for Error {
    fn from(e: uwb_proto::EncodeError) -> Self {
        match e {
            uwb_proto::EncodeError::PayloadTooLarge { len, max } => Error::PayloadTooLarge { len, max },
            uwb_proto::EncodeError::ValueTooLong { len, .. } => Error::PayloadTooLarge {
                len,
                max: uwb_proto::tlv::MAX_VALUE_LEN,
            },
        }
    }
}
