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

//! Key exchange algorithm names (for [Preferred][crate::Preferred]) and the
//! RFC 4253 key derivation shared by all of them.
mod curve25519;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::LazyLock;

use curve25519::Curve25519KexType;
use digest::Digest;
use zeroize::Zeroizing;

use crate::cipher::CIPHERS;
use crate::mac::{self, MACS};
use crate::session::Exchange;
use crate::{cipher, Error};

pub(crate) trait KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send>;
}

impl Debug for dyn KexAlgorithm + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KexAlgorithm")
    }
}

pub(crate) trait KexAlgorithm {
    /// Generate the local ephemeral, record it in `client_ephemeral` and
    /// write the DH init message into `writer`.
    fn client_dh(
        &mut self,
        client_ephemeral: &mut Vec<u8>,
        writer: &mut Vec<u8>,
    ) -> Result<(), Error>;

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error>;

    /// `key` is the server host key blob, already length-prefixed.
    fn compute_exchange_hash(&self, key: &[u8], exchange: &Exchange) -> Result<Vec<u8>, Error>;

    fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        cipher: cipher::Name,
        remote_to_local_mac: mac::Name,
        local_to_remote_mac: mac::Name,
        is_server: bool,
    ) -> Result<cipher::CipherPair, Error>;
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// `curve25519-sha256`
pub const CURVE25519: Name = Name("curve25519-sha256");
/// `curve25519-sha256@libssh.org`
pub const CURVE25519_PRE_RFC_8731: Name = Name("curve25519-sha256@libssh.org");

static CURVE25519_IMPL: Curve25519KexType = Curve25519KexType {};

pub(crate) static KEXES: LazyLock<HashMap<&'static Name, &(dyn KexType + Send + Sync)>> =
    LazyLock::new(|| {
        let entries: [(&'static Name, &(dyn KexType + Send + Sync)); 2] = [
            (&CURVE25519, &CURVE25519_IMPL),
            (&CURVE25519_PRE_RFC_8731, &CURVE25519_IMPL),
        ];
        entries.into_iter().collect()
    });

/// RFC 4253 §7.2 key derivation: stretch the shared secret and exchange
/// hash into directional cipher keys, nonces and MAC keys.
///
/// `shared_secret` is the already mpint-encoded `K`; it is absent only for
/// the degenerate test configurations that use the `clear` cipher.
pub(crate) fn compute_keys<D: Digest>(
    shared_secret: Option<&[u8]>,
    session_id: &[u8],
    exchange_hash: &[u8],
    cipher: cipher::Name,
    remote_to_local_mac: mac::Name,
    local_to_remote_mac: mac::Name,
    is_server: bool,
) -> Result<cipher::CipherPair, Error> {
    let cipher = CIPHERS.get(&cipher).ok_or(Error::UnknownAlgo)?;
    let remote_to_local_mac = MACS.get(&remote_to_local_mac).ok_or(Error::UnknownAlgo)?;
    let local_to_remote_mac = MACS.get(&local_to_remote_mac).ok_or(Error::UnknownAlgo)?;

    let compute_key = |c: u8, len: usize| -> Zeroizing<Vec<u8>> {
        let mut buffer = Zeroizing::new(Vec::new());
        let mut key = Zeroizing::new(Vec::new());

        if let Some(shared) = shared_secret {
            buffer.extend_from_slice(shared);
        }
        buffer.extend_from_slice(exchange_hash);
        buffer.push(c);
        buffer.extend_from_slice(session_id);
        key.extend_from_slice(&D::digest(&buffer));

        while key.len() < len {
            // extend.
            buffer.clear();
            if let Some(shared) = shared_secret {
                buffer.extend_from_slice(shared);
            }
            buffer.extend_from_slice(exchange_hash);
            buffer.extend_from_slice(&key);
            key.extend_from_slice(&D::digest(&buffer));
        }

        key.truncate(len);
        key
    };

    // RFC 4253 §7.2 letters, client-to-server first; a server derives with
    // the pairs swapped.
    let [iv_out, iv_in, key_out, key_in, mac_out, mac_in] = if is_server {
        [b'B', b'A', b'D', b'C', b'F', b'E']
    } else {
        [b'A', b'B', b'C', b'D', b'E', b'F']
    };

    let key = compute_key(key_out, cipher.key_len());
    let nonce = compute_key(iv_out, cipher.nonce_len());
    let mac = compute_key(mac_out, local_to_remote_mac.key_len());
    let sealing = cipher.sealing_key(&key, &nonce, &mac, *local_to_remote_mac);

    let key = compute_key(key_in, cipher.key_len());
    let nonce = compute_key(iv_in, cipher.nonce_len());
    let mac = compute_key(mac_in, remote_to_local_mac.key_len());
    let opening = cipher.opening_key(&key, &nonce, &mac, *remote_to_local_mac);

    Ok(cipher::CipherPair { sealing, opening })
}
