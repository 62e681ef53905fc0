#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An asynchronous SSH2 client session engine, based on tokio, meant to be
//! embedded behind a terminal front-end.
//!
//! The entry point is the [`client`] module: implement [`client::Handler`]
//! (host key policy and unsolicited events), then call [`client::connect`].
//! The returned [`client::Handle`] authenticates the user and opens
//! [`Channel`]s; a channel carries the interactive shell, and bytes flow
//! through [`Channel::data`] and [`Channel::wait`].
//!
//! The engine covers the transport layer (RFC 4253 binary packets,
//! curve25519-sha256 key exchange, AES-CTR + HMAC-SHA2 record protection,
//! re-keying), user authentication (RFC 4252 password and public key) and
//! channel multiplexing with flow-control windows (RFC 4254). It does not
//! interpret terminal escape sequences and it does not render anything:
//! presentation belongs to the caller.
//!
//! # Internal details of the event loop
//!
//! Data sent to the remote side is buffered, because it needs to be
//! encrypted first, and encryption works on buffers, and for many
//! algorithms, not in place. A spawned session task keeps waiting for
//! incoming packets and for commands from the [`client::Handle`], fills the
//! outgoing buffer, then flushes it to the socket and starts again. All
//! writes are serialized through that task, which is what keeps the
//! per-direction sequence numbers strictly increasing.

use std::convert::TryFrom;
use std::fmt::{Debug, Display, Formatter};

use ssh_encoding::{Decode, Encode};
use thiserror::Error;

macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {{
        use byteorder::{BigEndian, ByteOrder};
        let i0 = $buffer.len();
        $buffer.extend(b"\0\0\0\0");
        let x = $x;
        let i1 = $buffer.len();
        #[allow(clippy::indexing_slicing)] // length checked
        BigEndian::write_u32(&mut $buffer[i0..], (i1 - i0 - 4) as u32);
        x
    }};
}

pub(crate) use push_packet;

#[cfg(test)]
mod tests;

pub mod auth;
/// Cipher names and the record layer.
pub mod cipher;
/// Key exchange algorithm names.
pub mod kex;
/// MAC algorithm names.
pub mod mac;

mod helpers;
mod msg;
mod negotiation;
mod parsing;
mod session;
mod sshbuffer;

pub use negotiation::{Names, Preferred};
pub use sshbuffer::SshId;

mod channels;
pub use channels::{Channel, ChannelMsg, TerminalSize};

/// Client side of this library.
pub mod client;
/// Host key trust stores.
pub mod trust;

/// The category of a negotiated algorithm.
#[derive(Debug)]
pub enum AlgorithmKind {
    Kex,
    Key,
    Cipher,
    Compression,
    Mac,
}

#[derive(Debug, Error)]
pub enum Error {
    /// A frame declared a length the engine refuses to buffer.
    #[error("Malformed frame, declared packet length {0}")]
    MalformedFrame(usize),

    /// No common algorithm found during key exchange.
    #[error("No common {kind:?} algorithm - ours: {ours:?}, theirs: {theirs:?}")]
    NoCommonAlgorithm {
        kind: AlgorithmKind,
        ours: Vec<String>,
        theirs: Vec<String>,
    },

    /// The server host key was not accepted by the trust policy.
    #[error("Server host key not trusted")]
    HostKeyUntrusted,

    /// Invalid packet authentication code.
    #[error("Packet integrity check failed")]
    IntegrityFailure,

    /// A packet sequence number was not the next expected value.
    #[error("Packet sequence number out of order")]
    OutOfOrder,

    /// Every allowed method or attempt has been consumed without success.
    #[error("Authentication methods exhausted")]
    AuthenticationExhausted,

    /// Server refused to open a channel.
    #[error("Channel refused by the server ({0:?})")]
    ChannelRefused(ChannelOpenFailure),

    /// Connection or key exchange timeout.
    #[error("Timeout")]
    Timeout,

    /// Connection closed by the remote side.
    #[error("Transport closed")]
    TransportClosed,

    /// Unspecified problem with the beginning of key exchange.
    #[error("Key exchange init failed")]
    KexInit,

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// Unknown algorithm name.
    #[error("Unknown algorithm")]
    UnknownAlgo,

    /// Invalid SSH version string.
    #[error("Invalid SSH version string")]
    Version,

    /// The server provided a wrong signature.
    #[error("Wrong server signature")]
    WrongServerSig,

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// The client is not yet authenticated.
    #[error("Not yet authenticated")]
    NotAuthenticated,

    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// Disconnected by the peer.
    #[error("Disconnected")]
    Disconnect,

    #[error("Channel send error")]
    SendError,

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Elapsed(#[from] tokio::time::error::Elapsed),

    #[error("Signature: {0}")]
    Signature(#[from] signature::Error),

    #[error("SshKey: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("SshEncoding: {0}")]
    SshEncoding(#[from] ssh_encoding::Error),
}

/// The number of bytes read/written, and the number of seconds before a key
/// re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_read_limit: usize,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    /// Create a new `Limits`, checking that the given bounds cannot lead to
    /// nonce reuse.
    pub fn new(write_limit: usize, read_limit: usize, time_limit: std::time::Duration) -> Limits {
        assert!(write_limit <= 1 << 30 && read_limit <= 1 << 30);
        Limits {
            rekey_write_limit: write_limit,
            rekey_read_limit: read_limit,
            rekey_time_limit: time_limit,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 GiB
            rekey_read_limit: 1 << 30,  // 1 GiB
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

pub use auth::{AuthResult, MethodKind, MethodSet};

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl TryFrom<u32> for Disconnect {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::HostNotAllowedToConnect,
            2 => Self::ProtocolError,
            3 => Self::KeyExchangeFailed,
            4 => Self::Reserved,
            5 => Self::MACError,
            6 => Self::CompressionError,
            7 => Self::ServiceNotAvailable,
            8 => Self::ProtocolVersionNotSupported,
            9 => Self::HostKeyNotVerifiable,
            10 => Self::ConnectionLost,
            11 => Self::ByApplication,
            12 => Self::TooManyConnections,
            13 => Self::AuthCancelledByUser,
            14 => Self::NoMoreAuthMethodsAvailable,
            15 => Self::IllegalUserName,
            _ => return Err(crate::Error::Inconsistent),
        })
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(u32);

impl Decode for ChannelId {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, Self::Error> {
        Ok(Self(u32::decode(reader)?))
    }
}

impl Encode for ChannelId {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.0.encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.0.encode(writer)
    }
}

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The parameters of a channel.
#[derive(Debug)]
pub(crate) struct ChannelParams {
    pub recipient_channel: u32,
    pub sender_channel: ChannelId,
    pub recipient_window_size: u32,
    pub sender_window_size: u32,
    pub recipient_maximum_packet_size: u32,
    pub sender_maximum_packet_size: u32,
    /// Has the other side confirmed the channel?
    pub confirmed: bool,
    /// (buffer, extended stream #, data offset in buffer)
    pub pending_data: std::collections::VecDeque<(Vec<u8>, Option<u32>, usize)>,
    pub pending_eof: bool,
    pub pending_close: bool,
}

impl ChannelParams {
    /// A channel we just asked the server to open: confirmed later, with
    /// the recipient side still unknown.
    pub fn new(sender_channel: ChannelId, window_size: u32, maximum_packet_size: u32) -> Self {
        ChannelParams {
            recipient_channel: 0,
            sender_channel,
            sender_window_size: window_size,
            recipient_window_size: 0,
            sender_maximum_packet_size: maximum_packet_size,
            recipient_maximum_packet_size: 0,
            confirmed: false,
            pending_data: std::collections::VecDeque::new(),
            pending_eof: false,
            pending_close: false,
        }
    }

    pub fn confirm(&mut self, c: &parsing::ChannelOpenConfirmation) {
        self.recipient_channel = c.sender_channel; // "sender" is the sender of the confirmation
        self.recipient_window_size = c.initial_window_size;
        self.recipient_maximum_packet_size = c.maximum_packet_size;
        self.confirmed = true;
    }
}
