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

//! Cipher names (for [Preferred][crate::Preferred]) and the record layer:
//! sealing and opening of SSH binary packets.
use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::num::Wrapping;
use std::sync::LazyLock;

use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128BE;
use log::trace;
use ssh_encoding::Encode;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::mac::MacAlgorithm;
use crate::sshbuffer::SSHBuffer;
use crate::Error;

pub(crate) mod block;
pub(crate) mod clear;

use block::CtrCipher;
use clear::Clear;

/// A cipher the KDF can instantiate: key/nonce sizes plus constructors for
/// the two directions.
pub(crate) trait Cipher {
    fn needs_mac(&self) -> bool {
        false
    }
    fn key_len(&self) -> usize;
    fn nonce_len(&self) -> usize {
        0
    }
    fn opening_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Box<dyn OpeningKey + Send>;
    fn sealing_key(
        &self,
        key: &[u8],
        nonce: &[u8],
        mac_key: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Box<dyn SealingKey + Send>;
}

/// Plaintext, used before the first key exchange finishes.
pub const CLEAR: Name = Name("clear");
/// AES-128 in counter mode.
pub const AES_128_CTR: Name = Name("aes128-ctr");
/// AES-192 in counter mode.
pub const AES_192_CTR: Name = Name("aes192-ctr");
/// AES-256 in counter mode.
pub const AES_256_CTR: Name = Name("aes256-ctr");
/// The standard name of the plaintext cipher.
pub const NONE: Name = Name("none");

static CLEAR_CIPHER: Clear = Clear {};
static AES128: CtrCipher<Ctr128BE<Aes128>> = CtrCipher(PhantomData);
static AES192: CtrCipher<Ctr128BE<Aes192>> = CtrCipher(PhantomData);
static AES256: CtrCipher<Ctr128BE<Aes256>> = CtrCipher(PhantomData);

pub static ALL_CIPHERS: &[&Name] = &[&CLEAR, &NONE, &AES_128_CTR, &AES_192_CTR, &AES_256_CTR];

pub(crate) static CIPHERS: LazyLock<HashMap<&'static Name, &(dyn Cipher + Send + Sync)>> =
    LazyLock::new(|| {
        let entries: [(&'static Name, &(dyn Cipher + Send + Sync)); 5] = [
            (&CLEAR, &CLEAR_CIPHER),
            (&NONE, &CLEAR_CIPHER),
            (&AES_128_CTR, &AES128),
            (&AES_192_CTR, &AES192),
            (&AES_256_CTR, &AES256),
        ];
        debug_assert_eq!(entries.len(), ALL_CIPHERS.len());
        entries.into_iter().collect()
    });

/// A sealing key over the `clear` cipher, for the pre-kex phase.
pub(crate) fn clear_sealing_key() -> Box<dyn SealingKey + Send> {
    CLEAR_CIPHER.sealing_key(&[], &[], &[], &crate::mac::NONE_MAC)
}

/// An opening key over the `clear` cipher, for the pre-kex phase.
pub(crate) fn clear_opening_key() -> Box<dyn OpeningKey + Send> {
    CLEAR_CIPHER.opening_key(&[], &[], &[], &crate::mac::NONE_MAC)
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl Encode for Name {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.as_ref().encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.as_ref().encode(writer)
    }
}

impl Borrow<str> for &Name {
    fn borrow(&self) -> &str {
        self.0
    }
}

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        ALL_CIPHERS.iter().find(|n| n.0 == s).map(|n| **n).ok_or(())
    }
}

pub(crate) struct CipherPair {
    pub sealing: Box<dyn SealingKey + Send>,
    pub opening: Box<dyn OpeningKey + Send>,
}

impl Debug for CipherPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("CipherPair")
    }
}

pub(crate) trait OpeningKey {
    /// How many bytes of a fresh frame must be read before the declared
    /// length can be recovered.
    fn head_len(&self) -> usize {
        PACKET_LENGTH_LEN
    }

    fn decode_packet_length(&self, seqn: u32, head: &[u8]) -> [u8; 4];

    fn tag_len(&self) -> usize;

    fn open<'a>(&mut self, seqn: u32, ciphertext_and_tag: &'a mut [u8]) -> Result<&'a [u8], Error>;
}

pub(crate) trait SealingKey {
    fn padding_len(&self, plaintext: &[u8]) -> usize;

    fn random_padding(&self, padding_out: &mut [u8]);

    fn tag_len(&self) -> usize;

    fn seal(&mut self, seqn: u32, plaintext_in_ciphertext_out: &mut [u8], tag_out: &mut [u8]);

    /// Frame `payload` and seal it in place at the end of `buffer`. Layout
    /// per RFC 4253 §6: packet length, padding length, payload, random
    /// padding, then the integrity tag.
    fn write(&mut self, payload: &[u8], buffer: &mut SSHBuffer) {
        trace!("sealing {} bytes, seqn = {:?}", payload.len(), buffer.seqn.0);

        let padding = self.padding_len(payload);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding;
        debug_assert!(packet_length <= u32::MAX as usize && padding <= u8::MAX as usize);

        let frame_start = buffer.buffer.len();
        buffer.buffer.extend((packet_length as u32).to_be_bytes());
        buffer.buffer.push(padding as u8);
        buffer.buffer.extend(payload);

        let padding_start = buffer.buffer.len();
        buffer.buffer.resize(padding_start + padding, 0);
        #[allow(clippy::indexing_slicing)] // grown right above
        self.random_padding(&mut buffer.buffer[padding_start..]);
        let tag_start = buffer.buffer.len();
        buffer.buffer.resize(tag_start + self.tag_len(), 0);

        #[allow(clippy::indexing_slicing)] // grown right above
        let (frame, tag) = buffer.buffer[frame_start..].split_at_mut(tag_start - frame_start);
        self.seal(buffer.seqn.0, frame, tag);

        buffer.bytes += payload.len();
        // 32-bit sequence number, wrapping (RFC 4253 §6.4).
        buffer.seqn += Wrapping(1);
    }
}

fn eof_is_transport_closed(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::TransportClosed
    } else {
        Error::IO(e)
    }
}

/// Read and open one frame, buffering partial reads until a full frame is
/// available. Integrity is checked before any plaintext is exposed.
pub(crate) async fn read<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut SSHBuffer,
    cipher: &mut (dyn OpeningKey + Send),
) -> Result<usize, Error> {
    let head_len = cipher.head_len();

    if buffer.len == 0 {
        // A fresh frame: read just enough of it to learn the length.
        let mut head = vec![0; head_len];
        stream
            .read_exact(&mut head)
            .await
            .map_err(eof_is_transport_closed)?;

        let length_bytes = cipher.decode_packet_length(buffer.seqn.0, &head);
        let declared = u32::from_be_bytes(length_bytes) as usize;
        trace!(
            "frame header, seqn = {:?}, declared length = {declared}",
            buffer.seqn.0
        );
        if declared > MAXIMUM_PACKET_LEN {
            return Err(Error::MalformedFrame(declared));
        }

        buffer.buffer.clear();
        buffer.buffer.extend(&head);
        buffer.len = declared + cipher.tag_len();
    }

    buffer.buffer.resize(buffer.len + PACKET_LENGTH_LEN, 0);
    #[allow(clippy::indexing_slicing)] // resized right above
    stream
        .read_exact(&mut buffer.buffer[head_len..])
        .await
        .map_err(eof_is_transport_closed)?;

    let plaintext = cipher.open(buffer.seqn.0, &mut buffer.buffer)?;

    let padding_length = *plaintext.first().unwrap_or(&0) as usize;
    let plaintext_end = plaintext
        .len()
        .checked_sub(padding_length)
        .ok_or(Error::MalformedFrame(padding_length))?;

    // 32-bit sequence number, wrapping (RFC 4253 §6.4).
    buffer.seqn += Wrapping(1);
    buffer.len = 0;
    buffer.bytes += plaintext_end.saturating_sub(PADDING_LENGTH_LEN);

    // Strip the padding; the caller slices the payload out of the buffer.
    buffer.buffer.truncate(plaintext_end + PACKET_LENGTH_LEN);

    Ok(plaintext_end + PACKET_LENGTH_LEN)
}

pub(crate) const PACKET_LENGTH_LEN: usize = 4;
pub(crate) const PADDING_LENGTH_LEN: usize = 1;

const MAXIMUM_PACKET_LEN: usize = 256 * 1024;
