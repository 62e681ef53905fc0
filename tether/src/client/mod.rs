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

//! The client session engine.
//!
//! Implement [`Handler`] (at least the host key policy), then call
//! [`connect`]. The returned [`Handle`] runs authentication and opens
//! channels while a spawned task drives the protocol:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::client::{self, Config, Handler};
//!
//! struct Client;
//!
//! #[async_trait::async_trait]
//! impl Handler for Client {
//!     type Error = tether::Error;
//!
//!     async fn check_server_key(
//!         &mut self,
//!         server_public_key: &ssh_key::PublicKey,
//!     ) -> Result<bool, Self::Error> {
//!         // Fail-closed by default; consult a trust store here.
//!         Ok(false)
//!     }
//! }
//!
//! # async fn run() -> Result<(), tether::Error> {
//! let config = Arc::new(Config::default());
//! let mut session = client::connect(config, ("example.org", 22), Client).await?;
//! let auth = session.authenticate_password("user", "password").await?;
//! if auth.success() {
//!     let mut channel = session.channel_open_session().await?;
//!     channel.request_shell(true).await?;
//! }
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::num::Wrapping;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use ssh_encoding::Encode;
use ssh_key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::pin;
use tokio::sync::mpsc::{
    channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender,
};
use tokio::task::JoinHandle;

use crate::auth::{AuthFlow, AuthResult, Method};
use crate::cipher::{self, OpeningKey};
use crate::session::{CommonSession, Encrypted, EncryptedState};
use crate::sshbuffer::{read_ssh_id, IncomingSshPacket, PacketOrdering, PacketWriter, SSHBuffer};
use crate::{
    msg, Channel, ChannelId, ChannelMsg, Disconnect, Error, Limits, MethodSet, Preferred, SshId,
    TerminalSize,
};

mod encrypted;
mod kex;

use kex::{ClientKex, KexCause, KexProgress};

/// The configuration of a client.
#[derive(Debug)]
pub struct Config {
    /// The client ID string sent at the beginning of the protocol.
    pub client_id: SshId,
    /// Lists of preferred algorithms.
    pub preferred: Preferred,
    /// The initial receive window size of a channel.
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Byte and time thresholds after which a key re-exchange is started.
    pub limits: Limits,
    /// Time allowed for the version exchange and the first key exchange.
    /// `None` waits forever; on expiry the connection fails with
    /// [`Error::Timeout`].
    pub handshake_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            client_id: SshId::Standard(format!(
                "SSH-2.0-{}_{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
            preferred: Preferred::DEFAULT,
            window_size: 2097152,
            maximum_packet_size: 32768,
            limits: Limits::default(),
            handshake_timeout: None,
        }
    }
}

/// A client handler. Note that messages can be received from the server at
/// any time during a session.
#[async_trait]
pub trait Handler: Sized + Send {
    type Error: From<crate::Error> + Send + Debug;

    /// Called on the server's host key, during the first key exchange and
    /// again on every re-exchange. The connection fails closed with
    /// [`Error::HostKeyUntrusted`] unless this returns `Ok(true)`; consult a
    /// [trust store][crate::trust] here, and only learn keys on an explicit
    /// user decision.
    #[allow(unused_variables)]
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    /// Called when the server sends a banner during authentication.
    #[allow(unused_variables)]
    async fn auth_banner(&mut self, banner: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called upon receiving the exit status of a remote program.
    #[allow(unused_variables)]
    async fn exit_status(
        &mut self,
        channel: ChannelId,
        exit_status: u32,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[doc(hidden)]
#[derive(Debug)]
pub enum Msg {
    Authenticate {
        user: String,
        method: Method,
    },
    ChannelOpenSession {
        sender: UnboundedSender<ChannelMsg>,
    },
    Channel(ChannelId, ChannelMsg),
    Rekey,
    Disconnect {
        reason: Disconnect,
        description: String,
    },
}

impl From<(ChannelId, ChannelMsg)> for Msg {
    fn from((id, msg): (ChannelId, ChannelMsg)) -> Self {
        Msg::Channel(id, msg)
    }
}

#[derive(Debug)]
pub(crate) enum Reply {
    AuthSuccess,
    AuthFailure {
        remaining_methods: MethodSet,
        partial_success: bool,
    },
}

/// Handle to a session, used to authenticate, open channels and disconnect.
/// Dropping all handles (and channels) closes the session.
///
/// The handle is also a future: awaiting it joins the session task and
/// yields the error that ended the session, if any.
pub struct Handle<H: Handler> {
    sender: Sender<Msg>,
    receiver: UnboundedReceiver<Reply>,
    join: JoinHandle<Result<(), H::Error>>,
    authenticated: bool,
}

impl<H: Handler> Debug for Handle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl<H: Handler> Future for Handle<H> {
    type Output = Result<(), H::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.join).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_error)) => Poll::Ready(Err(Error::Join(join_error).into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<H: Handler> Handle<H> {
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Attempt the `none` method, mostly useful to learn the methods the
    /// server actually allows.
    pub async fn authenticate_none(&mut self, user: impl Into<String>) -> Result<AuthResult, Error> {
        self.authenticate_method(user.into(), Method::None).await
    }

    /// Perform password-based SSH authentication.
    pub async fn authenticate_password(
        &mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<AuthResult, Error> {
        self.authenticate_method(
            user.into(),
            Method::Password {
                password: password.into(),
            },
        )
        .await
    }

    /// Perform public key-based SSH authentication.
    pub async fn authenticate_publickey(
        &mut self,
        user: impl Into<String>,
        key: Arc<ssh_key::PrivateKey>,
    ) -> Result<AuthResult, Error> {
        self.authenticate_method(user.into(), Method::PublicKey { key })
            .await
    }

    /// Try an ordered list of credentials until the server accepts one,
    /// skipping credentials whose method the server no longer offers. Once
    /// `attempt_limit` attempts or all usable credentials have been consumed
    /// the session is disconnected and this fails with
    /// [`Error::AuthenticationExhausted`].
    pub async fn authenticate(
        &mut self,
        user: impl Into<String>,
        credentials: impl IntoIterator<Item = Method>,
        attempt_limit: usize,
    ) -> Result<(), Error> {
        let user = user.into();
        let mut flow = AuthFlow::new(credentials, attempt_limit);
        loop {
            let Some(method) = flow.next() else {
                // A session that ran out of credentials must not linger
                // half-open.
                let _ = self
                    .disconnect(
                        Disconnect::NoMoreAuthMethodsAvailable,
                        "no more authentication methods available",
                    )
                    .await;
                return Err(Error::AuthenticationExhausted);
            };
            match self.authenticate_method(user.clone(), method).await? {
                AuthResult::Success => return Ok(()),
                AuthResult::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    if partial_success {
                        debug!("partial success, continuing with {remaining_methods:?}");
                    }
                    flow.on_failure(remaining_methods);
                }
            }
        }
    }

    async fn authenticate_method(&mut self, user: String, method: Method) -> Result<AuthResult, Error> {
        self.sender
            .send(Msg::Authenticate { user, method })
            .await
            .map_err(|_| Error::SendError)?;
        loop {
            match self.receiver.recv().await {
                Some(Reply::AuthSuccess) => {
                    self.authenticated = true;
                    return Ok(AuthResult::Success);
                }
                Some(Reply::AuthFailure {
                    remaining_methods,
                    partial_success,
                }) => {
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    })
                }
                None => return Err(Error::TransportClosed),
            }
        }
    }

    /// Request a session channel (the most basic type of
    /// channel). This function returns `Ok(..)` immediately if the
    /// connection is authenticated, but the channel only becomes
    /// usable when it's confirmed by the server.
    pub async fn channel_open_session(&mut self) -> Result<Channel<Msg>, Error> {
        if !self.authenticated {
            return Err(Error::NotAuthenticated);
        }
        let (sender, mut receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenSession { sender })
            .await
            .map_err(|_| Error::SendError)?;
        loop {
            match receiver.recv().await {
                Some(ChannelMsg::Open {
                    id,
                    max_packet_size,
                    window_size,
                }) => {
                    return Ok(Channel {
                        id,
                        sender: self.sender.clone(),
                        receiver,
                        max_packet_size,
                        window_size,
                    })
                }
                Some(ChannelMsg::OpenFailure(reason)) => {
                    return Err(Error::ChannelRefused(reason))
                }
                Some(msg) => debug!("msg before channel open: {msg:?}"),
                None => return Err(Error::TransportClosed),
            }
        }
    }

    /// Ask the session task to start a key re-exchange.
    pub async fn rekey(&self) -> Result<(), Error> {
        self.sender.send(Msg::Rekey).await.map_err(|_| Error::SendError)
    }

    /// Send a disconnect message and close down the session.
    pub async fn disconnect(&self, reason: Disconnect, description: &str) -> Result<(), Error> {
        self.sender
            .send(Msg::Disconnect {
                reason,
                description: description.into(),
            })
            .await
            .map_err(|_| Error::SendError)
    }
}

/// Connect to a server at the given address and perform the handshake: the
/// version exchange and the initial key exchange, including the host key
/// check. [`Config::handshake_timeout`] bounds the whole of it.
pub async fn connect<H: Handler + 'static, A: ToSocketAddrs + Send>(
    config: Arc<Config>,
    addrs: A,
    handler: H,
) -> Result<Handle<H>, H::Error> {
    let socket = match config.handshake_timeout {
        Some(t) => tokio::time::timeout(t, TcpStream::connect(addrs))
            .await
            .map_err(|_| crate::Error::Timeout)?
            .map_err(crate::Error::from)?,
        None => TcpStream::connect(addrs).await.map_err(crate::Error::from)?,
    };
    socket.set_nodelay(true).map_err(crate::Error::from)?;
    connect_stream(config, socket, handler).await
}

/// Connect over an already established stream, for callers with their own
/// transport (proxies, unix sockets, tests over an in-memory duplex).
pub async fn connect_stream<H, R>(
    config: Arc<Config>,
    stream: R,
    handler: H,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match config.handshake_timeout {
        Some(t) => tokio::time::timeout(t, handshake(config, stream, handler))
            .await
            .map_err(|_| crate::Error::Timeout)?,
        None => handshake(config, stream, handler).await,
    }
}

async fn handshake<H, R>(
    config: Arc<Config>,
    mut stream: R,
    mut handler: H,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Version exchange.
    let mut our_id = Vec::new();
    config.client_id.write(&mut our_id);
    stream.write_all(&our_id).await.map_err(crate::Error::from)?;
    let server_sshid = read_ssh_id(&mut stream).await?;
    debug!("server id: {:?}", String::from_utf8_lossy(&server_sshid));

    let mut common = CommonSession {
        auth_user: String::new(),
        config: config.clone(),
        encrypted: None,
        auth_method: None,
        packet_writer: PacketWriter::clear(),
        opening_cipher: cipher::clear_opening_key(),
        disconnected: false,
    };
    let mut ordering = PacketOrdering::new();
    let mut read_buffer = SSHBuffer::new();

    // Initial key exchange.
    let mut first_kex = ClientKex::new(
        config.clone(),
        &config.client_id,
        &server_sshid,
        KexCause::Initial,
    );
    first_kex.kexinit(&mut common.packet_writer)?;
    flush(&mut stream, common.packet_writer.buffer()).await?;

    let mut kex = Some(first_kex);
    let newkeys = loop {
        let n = cipher::read(&mut stream, &mut read_buffer, &mut *common.opening_cipher).await?;
        let seqn = read_buffer.seqn - Wrapping(1);
        ordering.check(seqn)?;
        #[allow(clippy::indexing_slicing)] // length checked in read
        let pkt = IncomingSshPacket {
            buffer: read_buffer.buffer[cipher::PACKET_LENGTH_LEN + cipher::PADDING_LENGTH_LEN..n]
                .to_vec(),
            seqn,
        };
        match pkt.buffer.first() {
            Some(&msg::IGNORE) | Some(&msg::DEBUG) => continue,
            Some(&msg::DISCONNECT) => return Err(crate::Error::Disconnect.into()),
            _ => {}
        }
        let Some(k) = kex.take() else {
            return Err(crate::Error::Inconsistent.into());
        };
        match k.step(&pkt, &mut common.packet_writer)? {
            KexProgress::NeedsReply { kex: k } => kex = Some(k),
            KexProgress::Done {
                newkeys,
                server_host_key,
            } => {
                if !handler.check_server_key(&server_host_key).await? {
                    return Err(crate::Error::HostKeyUntrusted.into());
                }
                break newkeys;
            }
        }
        flush(&mut stream, common.packet_writer.buffer()).await?;
    };
    flush(&mut stream, common.packet_writer.buffer()).await?;

    common.packet_writer.buffer().bytes = 0;
    read_buffer.bytes = 0;
    common.encrypted(
        EncryptedState::WaitingAuthServiceRequest {
            sent: false,
            accepted: false,
        },
        newkeys,
    );

    let (handle_sender, session_receiver) = channel(10);
    let (session_sender, handle_receiver) = unbounded_channel();

    let session = Session {
        common,
        receiver: session_receiver,
        sender: session_sender,
        channels: HashMap::new(),
        ordering,
        kex: None,
        server_sshid,
    };
    // Keep the join handle: awaiting the Handle surfaces the error that
    // ended the session, not just a closed channel.
    let join = tokio::spawn(async move {
        let result = session.run(stream, read_buffer, handler).await;
        if let Err(ref e) = result {
            error!("session exited with error: {e:?}");
        }
        result
    });

    Ok(Handle {
        sender: handle_sender,
        receiver: handle_receiver,
        join,
        authenticated: false,
    })
}

async fn flush<W: AsyncWrite + Unpin>(stream: &mut W, buffer: &mut SSHBuffer) -> Result<(), Error> {
    if !buffer.buffer.is_empty() {
        stream.write_all(&buffer.buffer).await?;
        buffer.buffer.clear();
    }
    Ok(())
}

/// One packet read, together with everything the read borrows; the future
/// persists across `select!` iterations so a cancelled branch never loses
/// partial frames.
async fn start_reading<R: AsyncRead + Unpin>(
    mut stream_read: R,
    mut buffer: SSHBuffer,
    mut cipher: Box<dyn OpeningKey + Send>,
) -> (
    Result<usize, Error>,
    R,
    SSHBuffer,
    Box<dyn OpeningKey + Send>,
) {
    let result = cipher::read(&mut stream_read, &mut buffer, &mut *cipher).await;
    (result, stream_read, buffer, cipher)
}

pub(crate) struct Session {
    common: CommonSession<Arc<Config>>,
    receiver: Receiver<Msg>,
    sender: UnboundedSender<Reply>,
    channels: HashMap<ChannelId, UnboundedSender<ChannelMsg>>,
    ordering: PacketOrdering,
    kex: Option<ClientKex>,
    server_sshid: Vec<u8>,
}

impl Session {
    async fn run<H, R>(
        mut self,
        stream: R,
        read_buffer: SSHBuffer,
        mut handler: H,
    ) -> Result<(), H::Error>
    where
        H: Handler,
        R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (stream_read, mut stream_write) = tokio::io::split(stream);

        // The opening key travels with the reading future and is swapped
        // back in while a packet is being processed.
        let mut opening_cipher = cipher::clear_opening_key();
        std::mem::swap(&mut opening_cipher, &mut self.common.opening_cipher);

        let reading = start_reading(stream_read, read_buffer, opening_cipher);
        pin!(reading);

        let result: Result<(), H::Error> = loop {
            tokio::select! {
                r = &mut reading => {
                    let (result, stream_read, mut buffer, mut opening_cipher) = r;
                    std::mem::swap(&mut opening_cipher, &mut self.common.opening_cipher);
                    let n = match result {
                        Ok(n) => n,
                        Err(e) => break Err(e.into()),
                    };
                    let seqn = buffer.seqn - Wrapping(1);
                    if let Err(e) = self.ordering.check(seqn) {
                        break Err(e.into());
                    }
                    #[allow(clippy::indexing_slicing)] // length checked in read
                    let mut pkt = IncomingSshPacket {
                        buffer: buffer.buffer
                            [cipher::PACKET_LENGTH_LEN + cipher::PADDING_LENGTH_LEN..n]
                            .to_vec(),
                        seqn,
                    };
                    let was_rekeying = self.kex.is_some();
                    if let Err(e) = self.handle_packet(&mut pkt, &mut handler).await {
                        break Err(e);
                    }
                    if self.kex.is_none() {
                        if was_rekeying {
                            // New keys just went in, restart the read counter.
                            buffer.bytes = 0;
                        } else if buffer.bytes >= self.common.config.limits.rekey_read_limit {
                            if let Some(ref mut enc) = self.common.encrypted {
                                debug!("rekeying: read limit reached");
                                enc.rekey_wanted = true;
                            }
                        }
                    }
                    std::mem::swap(&mut opening_cipher, &mut self.common.opening_cipher);
                    reading.set(start_reading(stream_read, buffer, opening_cipher));
                }
                msg = self.receiver.recv(), if self.kex.is_none() && !self.common.disconnected => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = self.handle_msg(msg) {
                                break Err(e.into());
                            }
                        }
                        None => {
                            debug!("all handles dropped, closing down");
                            if let Err(e) =
                                self.common.disconnect(Disconnect::ByApplication, "", "")
                            {
                                break Err(e.into());
                            }
                        }
                    }
                }
            }

            // Seal the cleartext queue (held back while re-keying), decide
            // whether the limits ask for a re-exchange, and write out. A
            // queued DISCONNECT still has to be sealed, so only the
            // re-exchange is skipped on the way down.
            if self.kex.is_none() {
                let rekey = match self.common.encrypted.as_mut() {
                    Some(enc) => {
                        match enc.flush(&self.common.config.limits, &mut self.common.packet_writer)
                        {
                            Ok(r) => r,
                            Err(e) => break Err(e.into()),
                        }
                    }
                    None => false,
                };
                if rekey && !self.common.disconnected {
                    if let Err(e) = self.initiate_rekey() {
                        break Err(e.into());
                    }
                }
            }
            if let Err(e) = flush(&mut stream_write, self.common.packet_writer.buffer()).await {
                break Err(e.into());
            }
            if self.common.disconnected {
                break Ok(());
            }
        };
        debug!("session loop finished");
        result
    }

    async fn handle_packet<H: Handler>(
        &mut self,
        pkt: &mut IncomingSshPacket,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        let first = *pkt.buffer.first().unwrap_or(&0);
        // Non-kex packets the server sent before it entered the re-exchange
        // are still processed normally.
        if (self.kex.is_some() || first == msg::KEXINIT) && msg::is_kex_msg(first) {
            self.handle_kex_packet(pkt, handler).await
        } else {
            self.client_read_encrypted(handler, pkt).await
        }
    }

    async fn handle_kex_packet<H: Handler>(
        &mut self,
        pkt: &mut IncomingSshPacket,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        let kex = match self.kex.take() {
            Some(kex) => kex,
            None => {
                // Server-initiated re-exchange.
                debug!("server requested a re-exchange");
                let mut kex = self.rekey_machine()?;
                kex.kexinit(&mut self.common.packet_writer)?;
                kex
            }
        };
        match kex.step(pkt, &mut self.common.packet_writer)? {
            KexProgress::NeedsReply { kex } => self.kex = Some(kex),
            KexProgress::Done {
                newkeys,
                server_host_key,
            } => {
                if !handler.check_server_key(&server_host_key).await? {
                    return Err(crate::Error::HostKeyUntrusted.into());
                }
                self.common.packet_writer.buffer().bytes = 0;
                self.common.newkeys(newkeys);
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.flush_all_pending()?;
                }
                debug!("re-exchange complete");
            }
        }
        Ok(())
    }

    fn initiate_rekey(&mut self) -> Result<(), Error> {
        debug!("starting re-exchange");
        let mut kex = self.rekey_machine()?;
        kex.kexinit(&mut self.common.packet_writer)?;
        self.kex = Some(kex);
        Ok(())
    }

    fn rekey_machine(&mut self) -> Result<ClientKex, Error> {
        let Some(session_id) = self
            .common
            .encrypted
            .as_ref()
            .map(|enc| enc.session_id.clone())
        else {
            return Err(Error::Inconsistent);
        };
        Ok(ClientKex::new(
            self.common.config.clone(),
            &self.common.config.client_id,
            &self.server_sshid,
            KexCause::Rekey { session_id },
        ))
    }

    fn handle_msg(&mut self, msg: Msg) -> Result<(), Error> {
        match msg {
            Msg::Authenticate { user, method } => {
                self.write_auth_request_if_needed(&user, method)?;
            }
            Msg::ChannelOpenSession { sender } => {
                let window_size = self.common.config.window_size;
                let maximum_packet_size = self.common.config.maximum_packet_size;
                let Some(ref mut enc) = self.common.encrypted else {
                    return Err(Error::Inconsistent);
                };
                let id = enc.new_channel(window_size, maximum_packet_size);
                push_packet!(enc.outgoing, {
                    enc.outgoing.push(msg::CHANNEL_OPEN);
                    "session".encode(&mut enc.outgoing)?;
                    id.encode(&mut enc.outgoing)?;
                    window_size.encode(&mut enc.outgoing)?;
                    maximum_packet_size.encode(&mut enc.outgoing)?;
                });
                self.channels.insert(id, sender);
            }
            Msg::Channel(id, msg) => self.handle_channel_msg(id, msg)?,
            Msg::Rekey => {
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.rekey_wanted = true;
                }
            }
            Msg::Disconnect {
                reason,
                description,
            } => {
                self.common.disconnect(reason, &description, "")?;
            }
        }
        Ok(())
    }

    fn handle_channel_msg(&mut self, id: ChannelId, msg: ChannelMsg) -> Result<(), Error> {
        let is_rekeying = self.kex.is_some();
        let Some(ref mut enc) = self.common.encrypted else {
            return Err(Error::Inconsistent);
        };
        match msg {
            ChannelMsg::Data { data } => enc.data(id, None, data, is_rekeying)?,
            ChannelMsg::ExtendedData { data, ext } => {
                enc.data(id, Some(ext), data, is_rekeying)?
            }
            ChannelMsg::Eof => enc.eof(id)?,
            ChannelMsg::Close => enc.close(id)?,
            ChannelMsg::RequestPty {
                want_reply,
                term,
                size,
            } => {
                Self::channel_request(enc, id, "pty-req", want_reply, |w| {
                    term.encode(w)?;
                    encode_terminal_size(&size, w)?;
                    // Terminal modes: TTY_OP_END only.
                    [0u8].as_slice().encode(w)?;
                    Ok(())
                })?;
            }
            ChannelMsg::RequestShell { want_reply } => {
                Self::channel_request(enc, id, "shell", want_reply, |_| Ok(()))?;
            }
            ChannelMsg::Exec {
                want_reply,
                command,
            } => {
                Self::channel_request(enc, id, "exec", want_reply, |w| {
                    command.as_slice().encode(w)?;
                    Ok(())
                })?;
            }
            ChannelMsg::RequestSubsystem { want_reply, name } => {
                Self::channel_request(enc, id, "subsystem", want_reply, |w| {
                    name.encode(w)?;
                    Ok(())
                })?;
            }
            ChannelMsg::WindowChange { size } => {
                Self::channel_request(enc, id, "window-change", false, |w| {
                    encode_terminal_size(&size, w)
                })?;
            }
            msg => {
                debug!("not an outgoing channel message: {msg:?}");
            }
        }
        Ok(())
    }

    fn channel_request<F>(
        enc: &mut Encrypted,
        id: ChannelId,
        name: &str,
        want_reply: bool,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), Error>,
    {
        let Some(channel) = enc.channels.get(&id) else {
            return Err(Error::WrongChannel);
        };
        let recipient = channel.recipient_channel;
        push_packet!(enc.outgoing, {
            enc.outgoing.push(msg::CHANNEL_REQUEST);
            recipient.encode(&mut enc.outgoing)?;
            name.encode(&mut enc.outgoing)?;
            enc.outgoing.push(want_reply as u8);
            f(&mut enc.outgoing)?;
        });
        Ok(())
    }
}

/// RFC 4254 §6.2 geometry: columns, rows, then pixel dimensions.
fn encode_terminal_size(size: &TerminalSize, w: &mut Vec<u8>) -> Result<(), Error> {
    size.cols.encode(w)?;
    size.rows.encode(w)?;
    size.pixel_width.encode(w)?;
    size.pixel_height.encode(w)?;
    Ok(())
}
