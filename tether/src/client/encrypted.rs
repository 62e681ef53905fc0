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
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use ssh_encoding::{Decode, Encode};

use crate::client::{Handler, Reply, Session};
use crate::helpers::{EncodedExt, NameList};
use crate::parsing::{ChannelOpenConfirmation, OpenChannelMessage};
use crate::session::{Encrypted, EncryptedState};
use crate::sshbuffer::IncomingSshPacket;
use crate::{auth, msg, ChannelId, ChannelMsg, ChannelOpenFailure, MethodSet};

/// Decode one field, folding the encoding error into [`crate::Error`].
fn field<T>(r: &mut &[u8]) -> Result<T, crate::Error>
where
    T: Decode<Error = ssh_encoding::Error>,
{
    Ok(T::decode(r)?)
}

impl Session {
    /// Forward an event to the channel's handle, if it still exists.
    fn deliver(&self, channel: ChannelId, msg: ChannelMsg) {
        if let Some(chan) = self.channels.get(&channel) {
            let _ = chan.send(msg);
        }
    }

    pub(crate) async fn client_read_encrypted<H: Handler>(
        &mut self,
        client: &mut H,
        pkt: &IncomingSshPacket,
    ) -> Result<(), H::Error> {
        let buf: &[u8] = &pkt.buffer;
        #[allow(clippy::indexing_slicing)] // length checked
        {
            trace!(
                "client_read_encrypted, buf = {:?}",
                &buf[..buf.len().min(20)]
            );
        }

        match buf.first() {
            Some(&msg::DISCONNECT) => {
                let mut r = buf.get(1..).unwrap_or(&[]);
                let reason: u32 = field(&mut r)?;
                let description = String::decode(&mut r).unwrap_or_default();
                info!("server disconnected: {reason} {description:?}");
                return Err(crate::Error::Disconnect.into());
            }
            Some(&msg::IGNORE) | Some(&msg::DEBUG) | Some(&msg::UNIMPLEMENTED) => {
                return Ok(());
            }
            _ => {}
        }

        let mut is_authenticated = false;
        if let Some(ref mut enc) = self.common.encrypted {
            match enc.state {
                EncryptedState::WaitingAuthServiceRequest {
                    ref mut accepted, ..
                } => {
                    if buf.first() != Some(&msg::SERVICE_ACCEPT) {
                        debug!("unknown message while waiting for service accept: {buf:?}");
                        return Err(crate::Error::Inconsistent.into());
                    }
                    let mut r = buf.get(1..).unwrap_or(&[]);
                    let service: String = field(&mut r)?;
                    if service == "ssh-userauth" {
                        debug!("ssh-userauth service accepted");
                        *accepted = true;
                        match self.common.auth_method {
                            Some(ref meth) => {
                                if enc.write_auth_request(&self.common.auth_user, meth)? {
                                    enc.state = EncryptedState::WaitingAuthRequest
                                }
                            }
                            None => debug!("no auth method"),
                        }
                    }
                }
                EncryptedState::WaitingAuthRequest => {
                    let mut r = buf.get(1..).unwrap_or(&[]);
                    match buf.first() {
                        Some(&msg::USERAUTH_SUCCESS) => {
                            debug!("userauth_success");
                            enc.state = EncryptedState::Authenticated;
                            self.sender
                                .send(Reply::AuthSuccess)
                                .map_err(|_| crate::Error::SendError)?;
                            return Ok(());
                        }
                        Some(&msg::USERAUTH_BANNER) => {
                            let banner: String = field(&mut r)?;
                            return client.auth_banner(&banner).await;
                        }
                        Some(&msg::USERAUTH_FAILURE) => {
                            let methods: NameList = field(&mut r)?;
                            let partial_success = field::<u8>(&mut r)? != 0;
                            debug!(
                                "userauth_failure, remaining: {methods:?}, partial: {partial_success:?}"
                            );
                            self.common.auth_method = None;
                            self.sender
                                .send(Reply::AuthFailure {
                                    remaining_methods: MethodSet::from(&methods),
                                    partial_success,
                                })
                                .map_err(|_| crate::Error::SendError)?;
                        }
                        Some(&msg::USERAUTH_PK_OK) => {
                            debug!("userauth_pk_ok");
                            // The key was accepted; send the signed request.
                            match self.common.auth_method.take() {
                                Some(auth_method @ auth::Method::PublicKey { .. }) => {
                                    enc.client_send_signature(
                                        &self.common.auth_user,
                                        &auth_method,
                                    )?;
                                }
                                _ => return Err(crate::Error::Inconsistent.into()),
                            }
                        }
                        _ => {
                            debug!("unknown message during authentication: {buf:?}");
                            return Err(crate::Error::Inconsistent.into());
                        }
                    }
                }
                EncryptedState::Authenticated => is_authenticated = true,
            }
        }
        if is_authenticated {
            self.client_read_authenticated(client, buf).await
        } else {
            Ok(())
        }
    }

    async fn client_read_authenticated<H: Handler>(
        &mut self,
        client: &mut H,
        buf: &[u8],
    ) -> Result<(), H::Error> {
        let mut body = buf.get(1..).unwrap_or(&[]);
        let r = &mut body;
        match buf.first() {
            Some(&msg::CHANNEL_OPEN_CONFIRMATION) => {
                debug!("channel_open_confirmation");
                let msg = ChannelOpenConfirmation::parse(r)?;
                let local_id = ChannelId(msg.recipient_channel);

                {
                    let Some(ref mut enc) = self.common.encrypted else {
                        return Err(crate::Error::Inconsistent.into());
                    };
                    match enc.channels.get_mut(&local_id) {
                        Some(parameters) => parameters.confirm(&msg),
                        // A confirmation for a channel we never requested
                        // ends the session.
                        None => return Err(crate::Error::Inconsistent.into()),
                    }
                }

                if self.channels.contains_key(&local_id) {
                    self.deliver(
                        local_id,
                        ChannelMsg::Open {
                            id: local_id,
                            max_packet_size: msg.maximum_packet_size,
                            window_size: msg.initial_window_size,
                        },
                    );
                } else {
                    error!("no channel for id {local_id:?}");
                }
                Ok(())
            }
            Some(&msg::CHANNEL_CLOSE) => {
                debug!("channel_close");
                let channel_num: ChannelId = field(r)?;
                if let Some(ref mut enc) = self.common.encrypted {
                    // Our own CHANNEL_CLOSE must go out at this point or the
                    // server will not release the channel.
                    enc.close(channel_num)?;
                }
                if let Some(chan) = self.channels.remove(&channel_num) {
                    let _ = chan.send(ChannelMsg::Close);
                }
                Ok(())
            }
            Some(&msg::CHANNEL_EOF) => {
                debug!("channel_eof");
                let channel_num: ChannelId = field(r)?;
                self.deliver(channel_num, ChannelMsg::Eof);
                Ok(())
            }
            Some(&msg::CHANNEL_OPEN_FAILURE) => {
                debug!("channel_open_failure");
                let channel_num: ChannelId = field(r)?;
                let reason_code =
                    ChannelOpenFailure::from_u32(field(r)?).unwrap_or(ChannelOpenFailure::Unknown);
                let descr: String = field(r)?;
                debug!("channel open failure: {descr:?}");
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.channels.remove(&channel_num);
                }
                if let Some(sender) = self.channels.remove(&channel_num) {
                    let _ = sender.send(ChannelMsg::OpenFailure(reason_code));
                }
                Ok(())
            }
            Some(&msg::CHANNEL_DATA) => {
                trace!("channel_data");
                let channel_num: ChannelId = field(r)?;
                let data: Bytes = field(r)?;
                self.replenish_window(channel_num, &data)?;
                self.deliver(
                    channel_num,
                    ChannelMsg::Data {
                        data: data.to_vec(),
                    },
                );
                Ok(())
            }
            Some(&msg::CHANNEL_EXTENDED_DATA) => {
                debug!("channel_extended_data");
                let channel_num: ChannelId = field(r)?;
                let ext: u32 = field(r)?;
                let data: Bytes = field(r)?;
                self.replenish_window(channel_num, &data)?;
                self.deliver(
                    channel_num,
                    ChannelMsg::ExtendedData {
                        ext,
                        data: data.to_vec(),
                    },
                );
                Ok(())
            }
            Some(&msg::CHANNEL_REQUEST) => {
                let channel_num: ChannelId = field(r)?;
                let req: String = field(r)?;
                debug!("channel_request: {channel_num:?} {req:?}");
                match req.as_str() {
                    "exit-status" => {
                        field::<u8>(r)?; // should be 0.
                        let exit_status = field(r)?;
                        self.deliver(channel_num, ChannelMsg::ExitStatus { exit_status });
                        client.exit_status(channel_num, exit_status).await
                    }
                    "keepalive@openssh.com" => {
                        let wants_reply: u8 = field(r)?;
                        if wants_reply == 1 {
                            if let Some(ref mut enc) = self.common.encrypted {
                                enc.byte(channel_num, msg::CHANNEL_SUCCESS)?;
                            }
                        } else {
                            warn!("received keepalive without reply request");
                        }
                        Ok(())
                    }
                    _ => {
                        let wants_reply: u8 = field(r)?;
                        if wants_reply == 1 {
                            if let Some(ref mut enc) = self.common.encrypted {
                                enc.byte(channel_num, msg::CHANNEL_FAILURE)?;
                            }
                        }
                        info!("unknown channel request {req:?} {wants_reply:?}");
                        Ok(())
                    }
                }
            }
            Some(&msg::CHANNEL_WINDOW_ADJUST) => {
                let channel_num: ChannelId = field(r)?;
                let amount: u32 = field(r)?;
                debug!("channel_window_adjust: {channel_num} by {amount}");
                let mut new_size = 0;
                if let Some(ref mut enc) = self.common.encrypted {
                    match enc.channels.get_mut(&channel_num) {
                        Some(channel) => {
                            channel.recipient_window_size += amount;
                            new_size = channel.recipient_window_size;
                        }
                        None => return Err(crate::Error::WrongChannel.into()),
                    }
                    // Data queued during a re-key eats into the fresh window
                    // before the handle hears about it.
                    new_size -= enc.flush_pending(channel_num)? as u32;
                }
                self.deliver(channel_num, ChannelMsg::WindowAdjusted { new_size });
                Ok(())
            }
            Some(&msg::CHANNEL_SUCCESS) => {
                let channel_num: ChannelId = field(r)?;
                self.deliver(channel_num, ChannelMsg::Success);
                Ok(())
            }
            Some(&msg::CHANNEL_FAILURE) => {
                let channel_num: ChannelId = field(r)?;
                self.deliver(channel_num, ChannelMsg::Failure);
                Ok(())
            }
            Some(&msg::CHANNEL_OPEN) => {
                // A terminal client has no use for server-initiated channels.
                let msg = OpenChannelMessage::parse(r)?;
                debug!("refusing server-initiated channel: {:?}", msg.typ);
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.refuse_channel_open(msg.sender)?;
                }
                Ok(())
            }
            Some(&msg::GLOBAL_REQUEST) => {
                let req: String = field(r)?;
                let wants_reply: u8 = field(r)?;
                if let Some(ref mut enc) = self.common.encrypted {
                    if req.starts_with("keepalive") {
                        if wants_reply == 1 {
                            trace!("answering keepalive: {req:?}");
                            push_packet!(enc.outgoing, enc.outgoing.push(msg::REQUEST_SUCCESS));
                        } else {
                            warn!("received keepalive without reply request");
                        }
                    } else {
                        warn!("unhandled global request: {req:?} {wants_reply:?}");
                        if wants_reply == 1 {
                            push_packet!(enc.outgoing, enc.outgoing.push(msg::REQUEST_FAILURE));
                        }
                    }
                }
                Ok(())
            }
            m => {
                debug!("unknown message received: {:?}", m);
                Ok(())
            }
        }
    }

    /// Debit the local window for `data` and top it back up when it runs
    /// low.
    fn replenish_window(&mut self, channel: ChannelId, data: &[u8]) -> Result<(), crate::Error> {
        let target = self.common.config.window_size;
        if let Some(ref mut enc) = self.common.encrypted {
            enc.adjust_window_size(channel, data, target)?;
        }
        Ok(())
    }

    /// Record the user and method for the next authentication attempt, and
    /// send the `ssh-userauth` service request if it has not gone out yet.
    /// The `USERAUTH_REQUEST` itself is written now if the service is already
    /// accepted, or from the `SERVICE_ACCEPT` handler otherwise.
    pub(crate) fn write_auth_request_if_needed(
        &mut self,
        user: &str,
        meth: auth::Method,
    ) -> Result<bool, crate::Error> {
        let mut is_waiting = false;
        if let Some(ref mut enc) = self.common.encrypted {
            is_waiting = match enc.state {
                EncryptedState::WaitingAuthRequest => true,
                EncryptedState::WaitingAuthServiceRequest {
                    accepted,
                    ref mut sent,
                } => {
                    if !*sent {
                        debug!("sending ssh-userauth service request");
                        self.common.packet_writer.packet(|w| {
                            msg::SERVICE_REQUEST.encode(w)?;
                            "ssh-userauth".encode(w)?;
                            Ok(())
                        })?;
                        *sent = true
                    }
                    accepted
                }
                EncryptedState::Authenticated => false,
            };
            debug!("write_auth_request_if_needed: is_waiting = {is_waiting:?}");
            if is_waiting {
                enc.write_auth_request(user, &meth)?;
                enc.state = EncryptedState::WaitingAuthRequest;
            }
        }
        self.common.auth_user.clear();
        self.common.auth_user.push_str(user);
        self.common.auth_method = Some(meth);
        Ok(is_waiting)
    }
}

impl Encrypted {
    fn write_auth_request(
        &mut self,
        user: &str,
        auth_method: &auth::Method,
    ) -> Result<bool, crate::Error> {
        // The server is waiting for our USERAUTH_REQUEST.
        push_packet!(self.outgoing, {
            let w = &mut self.outgoing;
            w.push(msg::USERAUTH_REQUEST);
            user.encode(w)?;
            "ssh-connection".encode(w)?;

            match *auth_method {
                auth::Method::None => {
                    "none".encode(w)?;
                }
                auth::Method::Password { ref password } => {
                    "password".encode(w)?;
                    w.push(0);
                    password.encode(w)?;
                }
                auth::Method::PublicKey { ref key } => {
                    "publickey".encode(w)?;
                    w.push(0); // unsigned: first ask whether the key is acceptable

                    debug!("write_auth_request: key - {:?}", key.algorithm());
                    key.algorithm().as_str().encode(w)?;
                    key.public_key().to_bytes()?.encode(w)?;
                }
            }
        });
        Ok(true)
    }

    /// `string(session_id)` followed by the `USERAUTH_REQUEST` body with the
    /// signed flag set; the signature covers the whole buffer, the packet
    /// starts at the returned offset.
    fn client_make_to_sign(
        &mut self,
        user: &str,
        key: &ssh_key::PrivateKey,
        buffer: &mut Vec<u8>,
    ) -> Result<usize, crate::Error> {
        buffer.clear();
        self.session_id.as_slice().encode(buffer)?;

        let i0 = buffer.len();
        buffer.push(msg::USERAUTH_REQUEST);
        user.encode(buffer)?;
        "ssh-connection".encode(buffer)?;
        "publickey".encode(buffer)?;
        buffer.push(1);
        key.algorithm().as_str().encode(buffer)?;
        key.public_key().to_bytes()?.encode(buffer)?;
        Ok(i0)
    }

    fn client_send_signature(
        &mut self,
        user: &str,
        method: &auth::Method,
    ) -> Result<(), crate::Error> {
        if let auth::Method::PublicKey { ref key } = method {
            let mut buffer = Vec::new();
            let i0 = self.client_make_to_sign(user, key, &mut buffer)?;
            let signature: ssh_key::Signature =
                signature::Signer::try_sign(key.as_ref(), &buffer)?;
            let sig = signature.encoded()?;
            push_packet!(self.outgoing, {
                #[allow(clippy::indexing_slicing)] // offset written above
                self.outgoing.extend(&buffer[i0..]);
                sig.as_slice().encode(&mut self.outgoing)?;
            })
        }
        Ok(())
    }
}
