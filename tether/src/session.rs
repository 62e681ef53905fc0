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
//

//! Session state shared between the handshake and the event loop: the
//! channel arena, the cleartext write queue and the re-key bookkeeping.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::mem::replace;
use std::num::Wrapping;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};
use ssh_encoding::Encode;

use crate::cipher::OpeningKey;
use crate::sshbuffer::PacketWriter;
use crate::{auth, cipher, msg, negotiation, ChannelId, ChannelParams, Disconnect, Limits};

/// Everything that only exists once the first key exchange has finished.
#[derive(Debug)]
pub(crate) struct Encrypted {
    pub state: EncryptedState,

    // Only None for the moment a re-exchange takes it out with mem::replace.
    pub exchange: Option<Exchange>,
    pub session_id: Vec<u8>,
    pub channels: HashMap<ChannelId, ChannelParams>,
    pub last_channel_id: Wrapping<u32>,
    /// Cleartext packets queued for the next flush, each behind its own
    /// length prefix. Held back entirely while a re-exchange runs.
    pub outgoing: Vec<u8>,
    pub flushed: usize,
    pub last_rekey: Instant,
    pub rekey_wanted: bool,
}

#[derive(Debug)]
pub(crate) enum EncryptedState {
    WaitingAuthServiceRequest { sent: bool, accepted: bool },
    WaitingAuthRequest,
    Authenticated,
}

pub(crate) struct CommonSession<Config> {
    pub auth_user: String,
    pub config: Config,
    pub encrypted: Option<Encrypted>,
    pub auth_method: Option<auth::Method>,
    pub packet_writer: PacketWriter,
    pub opening_cipher: Box<dyn OpeningKey + Send>,
    pub disconnected: bool,
}

impl<C> Debug for CommonSession<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommonSession")
            .field("auth_user", &self.auth_user)
            .field("encrypted", &self.encrypted)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}

impl<C> CommonSession<C> {
    /// Install the keys of a finished exchange. On the initial exchange this
    /// creates the encrypted state; on a re-exchange it swaps the ciphers in
    /// place and everything else (channels, session id) survives.
    pub fn newkeys(&mut self, newkeys: NewKeys) {
        if let Some(ref mut enc) = self.encrypted {
            enc.exchange = Some(newkeys.exchange);
            enc.last_rekey = Instant::now();
        }
        self.install_ciphers(newkeys.cipher);
    }

    pub fn encrypted(&mut self, state: EncryptedState, newkeys: NewKeys) {
        self.encrypted = Some(Encrypted {
            exchange: Some(newkeys.exchange),
            session_id: newkeys.session_id,
            state,
            channels: HashMap::new(),
            last_channel_id: Wrapping(1),
            outgoing: Vec::new(),
            flushed: 0,
            last_rekey: Instant::now(),
            rekey_wanted: false,
        });
        self.install_ciphers(newkeys.cipher);
    }

    fn install_ciphers(&mut self, pair: cipher::CipherPair) {
        self.opening_cipher = pair.opening;
        self.packet_writer.set_cipher(pair.sealing);
    }

    /// Queue a `DISCONNECT` message; the first call wins.
    pub fn disconnect(
        &mut self,
        reason: Disconnect,
        description: &str,
        language_tag: &str,
    ) -> Result<(), crate::Error> {
        if replace(&mut self.disconnected, true) {
            return Ok(());
        }
        // Before the first kex finishes the message goes straight into the
        // cleartext writer; after it, through the sealed queue.
        let buf = match self.encrypted {
            Some(ref mut enc) => &mut enc.outgoing,
            None => &mut self.packet_writer.buffer().buffer,
        };
        push_packet!(buf, {
            msg::DISCONNECT.encode(buf)?;
            (reason as u32).encode(buf)?;
            description.encode(buf)?;
            language_tag.encode(buf)?;
        });
        Ok(())
    }
}

impl Encrypted {
    /// Queue a one-recipient message (EOF, CLOSE, CHANNEL_SUCCESS, ...).
    pub fn byte(&mut self, channel: ChannelId, msg: u8) -> Result<(), crate::Error> {
        let Some(params) = self.channels.get(&channel) else {
            return Ok(());
        };
        let recipient = params.recipient_channel;
        push_packet!(self.outgoing, {
            self.outgoing.push(msg);
            recipient.encode(&mut self.outgoing)?;
        });
        Ok(())
    }

    pub fn eof(&mut self, channel: ChannelId) -> Result<(), crate::Error> {
        if self.has_pending_data(channel) {
            // Goes out once the queued data has drained.
            if let Some(c) = self.channels.get_mut(&channel) {
                c.pending_eof = true;
            }
            return Ok(());
        }
        self.byte(channel, msg::CHANNEL_EOF)
    }

    pub fn close(&mut self, channel: ChannelId) -> Result<(), crate::Error> {
        if self.has_pending_data(channel) {
            if let Some(c) = self.channels.get_mut(&channel) {
                c.pending_close = true;
            }
            return Ok(());
        }
        self.byte(channel, msg::CHANNEL_CLOSE)?;
        self.channels.remove(&channel);
        Ok(())
    }

    /// Refuse a server-initiated `CHANNEL_OPEN` outright.
    pub fn refuse_channel_open(&mut self, remote_id: u32) -> Result<(), crate::Error> {
        push_packet!(self.outgoing, {
            self.outgoing.push(msg::CHANNEL_OPEN_FAILURE);
            remote_id.encode(&mut self.outgoing)?;
            (msg::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED as u32).encode(&mut self.outgoing)?;
            "open administratively prohibited".encode(&mut self.outgoing)?;
            "".encode(&mut self.outgoing)?;
        });
        Ok(())
    }

    /// Debit our receive window for `data` and, once it has fallen below
    /// half of `target`, queue a `CHANNEL_WINDOW_ADJUST` restoring it.
    pub fn adjust_window_size(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        target: u32,
    ) -> Result<(), crate::Error> {
        let Some(params) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        // Data past the advertised window is ignored, not debited.
        // https://tools.ietf.org/html/rfc4254#section-5.2
        let consumed = data.len() as u32;
        if consumed <= params.sender_window_size {
            params.sender_window_size -= consumed;
        }
        if params.sender_window_size >= target / 2 {
            return Ok(());
        }
        let grant = target - params.sender_window_size;
        trace!("replenishing window of {} by {grant}", params.sender_channel);
        params.sender_window_size = target;
        let recipient = params.recipient_channel;
        push_packet!(self.outgoing, {
            self.outgoing.push(msg::CHANNEL_WINDOW_ADJUST);
            recipient.encode(&mut self.outgoing)?;
            grant.encode(&mut self.outgoing)?;
        });
        Ok(())
    }

    /// Send data on a confirmed channel; `ext` selects an extended stream.
    /// Whatever exceeds the remote window is queued. While a re-exchange
    /// runs, new data queues behind data already held back so that nothing
    /// overtakes.
    pub fn data(
        &mut self,
        channel: ChannelId,
        ext: Option<u32>,
        buf: Vec<u8>,
        is_rekeying: bool,
    ) -> Result<(), crate::Error> {
        let Some(params) = self.channels.get_mut(&channel) else {
            debug!("data for unknown channel {channel:?}");
            return Ok(());
        };
        if !params.confirmed {
            return Err(crate::Error::WrongChannel);
        }
        if is_rekeying && !params.pending_data.is_empty() {
            params.pending_data.push_back((buf, ext, 0));
            return Ok(());
        }
        let sent = Self::push_data(&mut self.outgoing, params, &buf, ext, 0)?;
        if sent < buf.len() {
            params.pending_data.push_back((buf, ext, sent));
        }
        Ok(())
    }

    /// Write as much of `buf[offset..]` as the remote window allows,
    /// splitting at the negotiated maximum packet size. Returns how many
    /// bytes were consumed.
    fn push_data(
        out: &mut Vec<u8>,
        channel: &mut ChannelParams,
        buf: &[u8],
        ext: Option<u32>,
        offset: usize,
    ) -> Result<usize, crate::Error> {
        let window = channel.recipient_window_size as usize;
        let end = buf.len().min(offset + window);
        let mut chunk_start = offset;
        while chunk_start < end {
            let chunk_end =
                end.min(chunk_start + channel.recipient_maximum_packet_size as usize);
            #[allow(clippy::indexing_slicing)] // bounded by end <= buf.len()
            let chunk = &buf[chunk_start..chunk_end];
            push_packet!(out, {
                out.push(if ext.is_some() {
                    msg::CHANNEL_EXTENDED_DATA
                } else {
                    msg::CHANNEL_DATA
                });
                channel.recipient_channel.encode(out)?;
                if let Some(code) = ext {
                    code.encode(out)?;
                }
                chunk.encode(out)?;
            });
            channel.recipient_window_size -= chunk.len() as u32;
            chunk_start = chunk_end;
        }
        Ok(end - offset)
    }

    /// Drain a channel's queue into the write buffer as far as the window
    /// allows; the flag says whether the queue emptied.
    fn drain_pending(
        out: &mut Vec<u8>,
        channel: &mut ChannelParams,
    ) -> Result<(usize, bool), crate::Error> {
        let mut wrote = 0;
        while let Some((buf, ext, offset)) = channel.pending_data.pop_front() {
            let n = Self::push_data(out, channel, &buf, ext, offset)?;
            wrote += n;
            if offset + n < buf.len() {
                channel.pending_data.push_front((buf, ext, offset + n));
                return Ok((wrote, false));
            }
        }
        Ok((wrote, true))
    }

    /// Resume a channel stalled on its window, then deliver a deferred
    /// EOF/CLOSE if the queue fully drained. Returns the number of bytes
    /// unqueued.
    pub fn flush_pending(&mut self, channel: ChannelId) -> Result<usize, crate::Error> {
        let Some(params) = self.channels.get_mut(&channel) else {
            return Ok(0);
        };
        let (wrote, drained) = Self::drain_pending(&mut self.outgoing, params)?;
        let (send_eof, send_close) = if drained {
            (
                replace(&mut params.pending_eof, false),
                replace(&mut params.pending_close, false),
            )
        } else {
            (false, false)
        };
        if send_eof {
            self.byte(channel, msg::CHANNEL_EOF)?;
        }
        if send_close {
            self.byte(channel, msg::CHANNEL_CLOSE)?;
            self.channels.remove(&channel);
        }
        Ok(wrote)
    }

    /// After a re-exchange, release the data every channel held back.
    pub fn flush_all_pending(&mut self) -> Result<(), crate::Error> {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.flush_pending(id)?;
        }
        Ok(())
    }

    pub fn has_pending_data(&self, channel: ChannelId) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|c| !c.pending_data.is_empty())
    }

    /// Seal the queued cleartext packets and say whether the re-keying
    /// thresholds have been crossed.
    pub fn flush(
        &mut self,
        limits: &Limits,
        writer: &mut PacketWriter,
    ) -> Result<bool, crate::Error> {
        while self.flushed < self.outgoing.len() {
            #[allow(clippy::indexing_slicing)] // the cursor stays on packet bounds
            let len = BigEndian::read_u32(&self.outgoing[self.flushed..]) as usize;
            let start = self.flushed + 4;
            #[allow(clippy::indexing_slicing)]
            writer.packet_raw(&self.outgoing[start..start + len]);
            self.flushed = start + len;
        }
        self.flushed = 0;
        self.outgoing.clear();

        Ok(replace(&mut self.rekey_wanted, false)
            || writer.buffer().bytes >= limits.rekey_write_limit
            || self.last_rekey.elapsed() >= limits.rekey_time_limit)
    }

    /// Allocate a local channel id; the counter wraps on very long sessions,
    /// so ids still in use are skipped.
    pub fn new_channel(&mut self, window_size: u32, maxpacket: u32) -> ChannelId {
        loop {
            self.last_channel_id += Wrapping(1);
            let id = ChannelId(self.last_channel_id.0);
            if self.channels.contains_key(&id) {
                continue;
            }
            self.channels
                .insert(id, ChannelParams::new(id, window_size, maxpacket));
            return id;
        }
    }
}

/// The inputs of the exchange hash, collected as the handshake progresses.
#[derive(Debug, Default, Clone)]
pub struct Exchange {
    pub client_id: Vec<u8>,
    pub server_id: Vec<u8>,
    pub client_kex_init: Vec<u8>,
    pub server_kex_init: Vec<u8>,
    pub client_ephemeral: Vec<u8>,
    pub server_ephemeral: Vec<u8>,
}

impl Exchange {
    pub fn new(client_id: &[u8], server_id: &[u8]) -> Self {
        Exchange {
            client_id: client_id.to_vec(),
            server_id: server_id.to_vec(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub(crate) struct NewKeys {
    pub exchange: Exchange,
    pub names: negotiation::Names,
    pub cipher: cipher::CipherPair,
    pub session_id: Vec<u8>,
}
