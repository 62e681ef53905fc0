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

use std::num::Wrapping;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cipher::SealingKey;
use crate::Error;

/// The SSH client/server identification string.
#[derive(Debug)]
pub enum SshId {
    /// When sending the id, append RFC standard `\r\n`. Example: `SshId::Standard("SSH-2.0-acme")`
    Standard(String),
    /// When sending the id, use this buffer as it is and do not append additional line terminators.
    Raw(String),
}

impl SshId {
    pub(crate) fn as_kex_hash_bytes(&self) -> &[u8] {
        match self {
            Self::Standard(s) => s.as_bytes(),
            Self::Raw(s) => s.trim_end_matches(|c| c == '\n' || c == '\r').as_bytes(),
        }
    }

    pub(crate) fn write(&self, buffer: &mut Vec<u8>) {
        match self {
            Self::Standard(s) => buffer.extend(format!("{}\r\n", s).as_bytes()),
            Self::Raw(s) => buffer.extend(s.as_bytes()),
        }
    }
}

#[test]
fn test_ssh_id() {
    let mut buffer = Vec::new();
    SshId::Standard("SSH-2.0-acme".to_string()).write(&mut buffer);
    assert_eq!(&buffer[..], b"SSH-2.0-acme\r\n");

    let mut buffer = Vec::new();
    SshId::Raw("SSH-2.0-raw\n".to_string()).write(&mut buffer);
    assert_eq!(&buffer[..], b"SSH-2.0-raw\n");

    assert_eq!(
        SshId::Standard("SSH-2.0-acme".to_string()).as_kex_hash_bytes(),
        b"SSH-2.0-acme"
    );
    assert_eq!(
        SshId::Raw("SSH-2.0-raw\n".to_string()).as_kex_hash_bytes(),
        b"SSH-2.0-raw"
    );
}

#[derive(Debug, Default)]
pub struct SSHBuffer {
    pub buffer: Vec<u8>,
    pub len: usize, // next packet length.
    pub bytes: usize,
    // Sequence numbers are on 32 bits and wrap.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    pub seqn: Wrapping<u32>,
}

impl SSHBuffer {
    pub fn new() -> Self {
        SSHBuffer {
            buffer: Vec::new(),
            len: 0,
            bytes: 0,
            seqn: Wrapping(0),
        }
    }

    pub fn send_ssh_id(&mut self, id: &SshId) {
        id.write(&mut self.buffer);
    }
}

/// One decrypted incoming frame, together with the sequence number it was
/// received under.
pub(crate) struct IncomingSshPacket {
    pub buffer: Vec<u8>,
    pub seqn: Wrapping<u32>,
}

/// Tracks the next expected receive sequence number. Any skew between the
/// record layer's counter and this one invalidates the session.
#[derive(Debug, Default)]
pub(crate) struct PacketOrdering {
    expected: Wrapping<u32>,
}

impl PacketOrdering {
    pub fn new() -> Self {
        Self {
            expected: Wrapping(0),
        }
    }

    pub fn check(&mut self, seqn: Wrapping<u32>) -> Result<(), Error> {
        if seqn != self.expected {
            return Err(Error::OutOfOrder);
        }
        self.expected += Wrapping(1);
        Ok(())
    }
}

/// Seals outgoing packets into a write buffer under the current
/// local-to-remote cipher.
pub(crate) struct PacketWriter {
    cipher: Box<dyn SealingKey + Send>,
    write_buffer: SSHBuffer,
}

impl PacketWriter {
    pub fn clear() -> Self {
        Self::new(crate::cipher::clear_sealing_key())
    }

    pub fn new(cipher: Box<dyn SealingKey + Send>) -> Self {
        Self {
            cipher,
            write_buffer: SSHBuffer::new(),
        }
    }

    /// Assemble a payload and seal it as one frame.
    pub fn packet<F: FnOnce(&mut Vec<u8>) -> Result<(), Error>>(
        &mut self,
        f: F,
    ) -> Result<(), Error> {
        let mut payload = Vec::new();
        f(&mut payload)?;
        self.packet_raw(&payload);
        Ok(())
    }

    pub fn packet_raw(&mut self, payload: &[u8]) {
        self.cipher.write(payload, &mut self.write_buffer);
    }

    pub fn set_cipher(&mut self, cipher: Box<dyn SealingKey + Send>) {
        self.cipher = cipher;
    }

    pub fn buffer(&mut self) -> &mut SSHBuffer {
        &mut self.write_buffer
    }
}

const MAX_ID_LINE_LEN: usize = 255;
const MAX_PRE_BANNER_LINES: usize = 100;

/// Read the remote identification line, tolerating pre-banner lines servers
/// may send before `SSH-` (RFC 4253 §4.2). Reads one byte at a time so no
/// packet data past the line terminator is consumed.
pub(crate) async fn read_ssh_id<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, Error> {
    let mut lines = 0;
    loop {
        let mut line = Vec::new();
        loop {
            let b = stream.read_u8().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::TransportClosed
                } else {
                    Error::IO(e)
                }
            })?;
            if b == b'\n' {
                break;
            }
            if line.len() >= MAX_ID_LINE_LEN {
                return Err(Error::Version);
            }
            line.push(b);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.starts_with(b"SSH-") {
            return Ok(line);
        }
        lines += 1;
        if lines >= MAX_PRE_BANNER_LINES {
            return Err(Error::Version);
        }
    }
}
