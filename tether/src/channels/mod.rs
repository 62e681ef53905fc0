use log::debug;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::{ChannelId, ChannelOpenFailure, Error};

/// Terminal geometry, in character cells and (optionally) pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

/// Events delivered to a [`Channel`] handle, and the requests it can queue.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChannelMsg {
    Open {
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
    },
    Data {
        data: Vec<u8>,
    },
    ExtendedData {
        data: Vec<u8>,
        ext: u32,
    },
    Eof,
    /// Queued by the handle only.
    RequestPty {
        want_reply: bool,
        term: String,
        size: TerminalSize,
    },
    /// Queued by the handle only.
    RequestShell {
        want_reply: bool,
    },
    /// Queued by the handle only.
    Exec {
        want_reply: bool,
        command: Vec<u8>,
    },
    /// Queued by the handle only.
    RequestSubsystem {
        want_reply: bool,
        name: String,
    },
    /// Queued by the handle only.
    WindowChange {
        size: TerminalSize,
    },
    /// Delivered by the session only.
    ExitStatus {
        exit_status: u32,
    },
    /// Delivered by the session only.
    WindowAdjusted {
        new_size: u32,
    },
    /// Delivered by the session only.
    Success,
    /// Delivered by the session only.
    Failure,
    /// Delivered by the session only.
    Close,
    OpenFailure(ChannelOpenFailure),
}

/// One confirmed channel, detached from the session it runs over.
///
/// The handle tracks the remote window on its own, so writes can block for
/// window space without holding anything of the session. `M` is the message
/// type of the owning session's command queue.
pub struct Channel<M: From<(ChannelId, ChannelMsg)>> {
    pub(crate) id: ChannelId,
    pub(crate) sender: Sender<M>,
    pub(crate) receiver: UnboundedReceiver<ChannelMsg>,
    pub(crate) max_packet_size: u32,
    pub(crate) window_size: u32,
}

impl<M: From<(ChannelId, ChannelMsg)>> std::fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl<M: From<(ChannelId, ChannelMsg)> + Send + 'static> Channel<M> {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// How much a single write may carry right now: the remaining window,
    /// capped at the negotiated maximum packet size.
    pub fn writable_packet_size(&self) -> usize {
        self.max_packet_size.min(self.window_size) as usize
    }

    /// Request a pseudo-terminal of type `term` with the given geometry.
    pub async fn request_pty(
        &mut self,
        want_reply: bool,
        term: &str,
        size: TerminalSize,
    ) -> Result<(), Error> {
        let term = term.to_string();
        self.send_msg(ChannelMsg::RequestPty {
            want_reply,
            term,
            size,
        })
        .await
    }

    /// Request a remote shell.
    pub async fn request_shell(&mut self, want_reply: bool) -> Result<(), Error> {
        self.send_msg(ChannelMsg::RequestShell { want_reply }).await
    }

    /// Run a remote command. The server hands it to the user's shell, so
    /// this also covers scp-style tunneling over standard input.
    pub async fn exec(
        &mut self,
        want_reply: bool,
        command: impl Into<Vec<u8>>,
    ) -> Result<(), Error> {
        let command = command.into();
        self.send_msg(ChannelMsg::Exec {
            want_reply,
            command,
        })
        .await
    }

    /// Request the start of a subsystem with the given name.
    pub async fn request_subsystem(
        &mut self,
        want_reply: bool,
        name: impl Into<String>,
    ) -> Result<(), Error> {
        let name = name.into();
        self.send_msg(ChannelMsg::RequestSubsystem { want_reply, name })
            .await
    }

    /// Inform the server that our terminal geometry changed.
    pub async fn window_change(&mut self, size: TerminalSize) -> Result<(), Error> {
        self.send_msg(ChannelMsg::WindowChange { size }).await
    }

    /// Stream `data` to the channel, blocking whenever the remote window
    /// is exhausted.
    pub async fn data<R>(&mut self, data: R) -> Result<(), Error>
    where
        R: tokio::io::AsyncReadExt + Unpin,
    {
        self.send_data(None, data).await
    }

    /// Stream `data` to an extended stream of the channel.
    pub async fn extended_data<R>(&mut self, ext: u32, data: R) -> Result<(), Error>
    where
        R: tokio::io::AsyncReadExt + Unpin,
    {
        self.send_data(Some(ext), data).await
    }

    async fn send_data<R>(&mut self, ext: Option<u32>, mut data: R) -> Result<(), Error>
    where
        R: tokio::io::AsyncReadExt + Unpin,
    {
        loop {
            self.reserve_window().await?;
            let sendable = self.writable_packet_size();
            let mut chunk = vec![0; sendable];
            let read = data.read(&mut chunk).await?;
            chunk.truncate(read);
            self.window_size -= read as u32;
            self.send_data_packet(ext, chunk).await?;
            if read == 0 {
                return Ok(());
            }
        }
    }

    /// Park until the remote side restores some window. A session that
    /// goes away while we are parked fails the send instead of leaving
    /// it stuck.
    async fn reserve_window(&mut self) -> Result<(), Error> {
        while self.window_size == 0 {
            match self.receiver.recv().await {
                Some(ChannelMsg::WindowAdjusted { new_size }) => {
                    debug!("window adjusted to {new_size}");
                    self.window_size = new_size;
                }
                Some(msg) => {
                    debug!("dropping channel msg while waiting for window: {msg:?}");
                }
                None => return Err(Error::TransportClosed),
            }
        }
        Ok(())
    }

    async fn send_data_packet(&mut self, ext: Option<u32>, data: Vec<u8>) -> Result<(), Error> {
        let msg = match ext {
            Some(ext) => ChannelMsg::ExtendedData { ext, data },
            None => ChannelMsg::Data { data },
        };
        self.send_msg(msg).await
    }

    /// Half-close the channel in the sending direction.
    pub async fn eof(&mut self) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Eof).await
    }

    /// Wait for the next event on this channel. `None` means the session
    /// is gone.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        let msg = self.receiver.recv().await?;
        if let ChannelMsg::WindowAdjusted { new_size } = msg {
            self.window_size = new_size;
        }
        Some(msg)
    }

    async fn send_msg(&self, msg: ChannelMsg) -> Result<(), Error> {
        let command = (self.id, msg).into();
        self.sender.send(command).await.map_err(|_| Error::SendError)
    }

    /// Request that the channel be closed.
    pub async fn close(&self) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Close).await
    }
}
