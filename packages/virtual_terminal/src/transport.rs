use termdeck_protocol::ClientMessage;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Outbound side of the multiplexed connection.
pub trait Transport {
    fn send(&mut self, msg: ClientMessage) -> Result<(), ClientError>;
}

impl Transport for mpsc::UnboundedSender<ClientMessage> {
    fn send(&mut self, msg: ClientMessage) -> Result<(), ClientError> {
        mpsc::UnboundedSender::send(self, msg).map_err(|_| ClientError::Disconnected)
    }
}
