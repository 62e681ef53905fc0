use ssh_encoding::Decode;

use crate::Error;

/// `CHANNEL_OPEN_CONFIRMATION` body (RFC 4254 §5.1).
#[derive(Debug)]
pub(crate) struct ChannelOpenConfirmation {
    pub recipient_channel: u32,
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    pub fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        Ok(ChannelOpenConfirmation {
            recipient_channel: u32::decode(r)?,
            sender_channel: u32::decode(r)?,
            initial_window_size: u32::decode(r)?,
            maximum_packet_size: u32::decode(r)?,
        })
    }
}

/// The head of a server-initiated `CHANNEL_OPEN`. Parsed only far enough to
/// refuse it.
#[derive(Debug)]
pub(crate) struct OpenChannelMessage {
    pub typ: String,
    pub sender: u32,
}

impl OpenChannelMessage {
    pub fn parse(r: &mut &[u8]) -> Result<Self, Error> {
        Ok(OpenChannelMessage {
            typ: String::decode(r)?,
            sender: u32::decode(r)?,
        })
    }
}
