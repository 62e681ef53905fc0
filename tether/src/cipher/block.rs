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

//! Stream-cipher record protection with an HMAC tag, in the classic
//! encrypt-and-MAC layout and the OpenSSH `-etm` variant.

use std::marker::PhantomData;

use aes::cipher::{IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher};
use generic_array::GenericArray;
use rand::RngCore;

use super::{PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::mac::{Mac, MacAlgorithm};
use crate::Error;

const BLOCK_LEN: usize = 16;

// RFC 4253 §6.
const MIN_PADDING_LEN: usize = 4;

pub struct CtrCipher<C: StreamCipher + KeySizeUser + IvSizeUser>(pub PhantomData<C>);

impl<C> super::Cipher for CtrCipher<C>
where
    C: StreamCipher + KeySizeUser + IvSizeUser + KeyIvInit + Send + 'static,
{
    fn key_len(&self) -> usize {
        C::key_size()
    }

    fn nonce_len(&self) -> usize {
        C::iv_size()
    }

    fn needs_mac(&self) -> bool {
        true
    }

    fn opening_key(
        &self,
        k: &[u8],
        n: &[u8],
        m: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Box<dyn super::OpeningKey + Send> {
        Box::new(CtrHmacKey::<C>::new(k, n, m, mac))
    }

    fn sealing_key(
        &self,
        k: &[u8],
        n: &[u8],
        m: &[u8],
        mac: &dyn MacAlgorithm,
    ) -> Box<dyn super::SealingKey + Send> {
        Box::new(CtrHmacKey::<C>::new(k, n, m, mac))
    }
}

/// One direction of the record layer: a keystream position plus the MAC
/// state for that direction. The same type serves as opening and sealing
/// key; the KDF never hands the two sides the same material.
struct CtrHmacKey<C> {
    cipher: C,
    mac: Box<dyn Mac + Send>,
}

impl<C: KeyIvInit> CtrHmacKey<C> {
    fn new(key: &[u8], nonce: &[u8], mac_key: &[u8], mac: &dyn MacAlgorithm) -> Self {
        Self {
            cipher: C::new(GenericArray::from_slice(key), GenericArray::from_slice(nonce)),
            mac: mac.make_mac(mac_key),
        }
    }
}

impl<C: StreamCipher> super::OpeningKey for CtrHmacKey<C> {
    fn head_len(&self) -> usize {
        BLOCK_LEN
    }

    fn decode_packet_length(&self, _sequence_number: u32, first_block: &[u8]) -> [u8; 4] {
        let mut length = [0u8; PACKET_LENGTH_LEN];
        if self.mac.is_etm() {
            // Encrypt-then-MAC sends the length field in the clear.
            #[allow(clippy::indexing_slicing)] // the caller hands a full block
            length.copy_from_slice(&first_block[..PACKET_LENGTH_LEN]);
        } else {
            // Peeking at the length must not advance the stored keystream,
            // and the CTR types are not Clone: decrypt a bitwise copy of
            // the cipher state over a scratch block instead.
            let mut scratch = [0u8; BLOCK_LEN];
            #[allow(clippy::indexing_slicing)] // the caller hands a full block
            scratch.copy_from_slice(&first_block[..BLOCK_LEN]);
            let mut keystream: C = unsafe { std::ptr::read(&self.cipher as *const C) };
            keystream.apply_keystream(&mut scratch);
            #[allow(clippy::indexing_slicing)]
            length.copy_from_slice(&scratch[..PACKET_LENGTH_LEN]);
        }
        length
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn open<'a>(
        &mut self,
        sequence_number: u32,
        ciphertext_and_tag: &'a mut [u8],
    ) -> Result<&'a [u8], Error> {
        let boundary = ciphertext_and_tag.len() - self.mac.mac_len();
        let (body, tag) = ciphertext_and_tag.split_at_mut(boundary);

        if self.mac.is_etm() {
            // The tag covers the ciphertext: check it before the keystream
            // touches anything.
            if !self.mac.verify(sequence_number, body, tag) {
                return Err(Error::IntegrityFailure);
            }
            #[allow(clippy::indexing_slicing)] // at least one block long
            self.cipher.apply_keystream(&mut body[PACKET_LENGTH_LEN..]);
        } else {
            self.cipher.apply_keystream(body);
            if !self.mac.verify(sequence_number, body, tag) {
                return Err(Error::IntegrityFailure);
            }
        }

        #[allow(clippy::indexing_slicing)] // at least one block long
        Ok(&body[PACKET_LENGTH_LEN..])
    }
}

impl<C: StreamCipher> super::SealingKey for CtrHmacKey<C> {
    fn padding_len(&self, payload: &[u8]) -> usize {
        // Padding brings the encrypted portion to a block boundary. In the
        // classic layout that portion includes the length field; under ETM
        // it does not.
        let length_len = if self.mac.is_etm() {
            0
        } else {
            PACKET_LENGTH_LEN
        };
        let padded = length_len + PADDING_LENGTH_LEN + payload.len();
        let mut padding = BLOCK_LEN - padded % BLOCK_LEN;
        if padding < MIN_PADDING_LEN {
            padding += BLOCK_LEN;
        }
        padding
    }

    fn random_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out);
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn seal(
        &mut self,
        sequence_number: u32,
        plaintext_in_ciphertext_out: &mut [u8],
        tag_out: &mut [u8],
    ) {
        if self.mac.is_etm() {
            #[allow(clippy::indexing_slicing)] // at least one block long
            self.cipher
                .apply_keystream(&mut plaintext_in_ciphertext_out[PACKET_LENGTH_LEN..]);
            self.mac
                .compute(sequence_number, plaintext_in_ciphertext_out, tag_out);
        } else {
            self.mac
                .compute(sequence_number, plaintext_in_ciphertext_out, tag_out);
            self.cipher.apply_keystream(plaintext_in_ciphertext_out);
        }
    }
}
