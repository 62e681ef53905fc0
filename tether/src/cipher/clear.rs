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

use std::convert::TryInto;

use super::PACKET_LENGTH_LEN;
use crate::mac::MacAlgorithm;
use crate::Error;

/// The cipher of the version-exchange and first-kex phase: no encryption,
/// no MAC.
#[derive(Debug)]
pub struct Clear {}

impl super::Cipher for Clear {
    fn key_len(&self) -> usize {
        0
    }

    fn opening_key(
        &self,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Box<dyn super::OpeningKey + Send> {
        Box::new(Clear {})
    }

    fn sealing_key(
        &self,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &dyn MacAlgorithm,
    ) -> Box<dyn super::SealingKey + Send> {
        Box::new(Clear {})
    }
}

impl super::OpeningKey for Clear {
    fn decode_packet_length(&self, _seqn: u32, packet_length: &[u8]) -> [u8; 4] {
        #[allow(clippy::unwrap_used, clippy::indexing_slicing)] // length checked
        packet_length[..4].try_into().unwrap()
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn open<'a>(&mut self, _seqn: u32, ciphertext: &'a mut [u8]) -> Result<&'a [u8], Error> {
        #[allow(clippy::indexing_slicing)] // length checked
        Ok(&ciphertext[PACKET_LENGTH_LEN..])
    }
}

impl super::SealingKey for Clear {
    fn padding_len(&self, payload: &[u8]) -> usize {
        let block_size = 8;
        let padding_len = block_size
            - ((PACKET_LENGTH_LEN + super::PADDING_LENGTH_LEN + payload.len()) % block_size);
        if padding_len < PACKET_LENGTH_LEN {
            padding_len + block_size
        } else {
            padding_len
        }
    }

    fn random_padding(&self, padding_out: &mut [u8]) {
        padding_out.fill(0);
    }

    fn tag_len(&self) -> usize {
        0
    }

    fn seal(&mut self, _seqn: u32, _plaintext: &mut [u8], _tag: &mut [u8]) {}
}
