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
use std::borrow::Cow;

use log::debug;
use rand::RngCore;
use ssh_encoding::{Decode, Encode};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg};

use crate::cipher::CIPHERS;
use crate::helpers::NameList;
use crate::{cipher, kex, mac, msg, AlgorithmKind, Error};

/// The algorithms negotiated for one key exchange.
#[derive(Debug, Clone)]
pub struct Names {
    pub kex: kex::Name,
    pub key: Algorithm,
    pub cipher: cipher::Name,
    pub client_mac: mac::Name,
    pub server_mac: mac::Name,
    pub ignore_guessed: bool,
}

/// The algorithm lists offered in our KEXINIT, in preference order.
#[derive(Debug, Clone)]
pub struct Preferred {
    /// Preferred key exchange algorithms.
    pub kex: Cow<'static, [kex::Name]>,
    /// Preferred host key algorithms.
    pub key: Cow<'static, [Algorithm]>,
    /// Preferred symmetric ciphers.
    pub cipher: Cow<'static, [cipher::Name]>,
    /// Preferred MAC algorithms.
    pub mac: Cow<'static, [mac::Name]>,
}

const KEX_ORDER: &[kex::Name] = &[kex::CURVE25519, kex::CURVE25519_PRE_RFC_8731];

const CIPHER_ORDER: &[cipher::Name] = &[
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

const HMAC_ORDER: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

const KEY_ORDER: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

// The only supported compression scheme, in both directions.
const COMPRESSION: &[&str] = &["none"];

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: Cow::Borrowed(KEX_ORDER),
        key: Cow::Borrowed(KEY_ORDER),
        cipher: Cow::Borrowed(CIPHER_ORDER),
        mac: Cow::Borrowed(HMAC_ORDER),
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

/// Pick the first of our preferences that the peer also offers. The returned
/// flag says whether both sides ranked it first, which matters for the
/// `first_kex_packet_follows` guess.
pub(crate) fn select<S: AsRef<str> + Clone>(
    ours: &[S],
    theirs: &[&str],
    kind: AlgorithmKind,
) -> Result<(bool, S), Error> {
    for (i, candidate) in ours.iter().enumerate() {
        if let Some(j) = theirs.iter().position(|t| *t == candidate.as_ref()) {
            return Ok((i == 0 && j == 0, candidate.clone()));
        }
    }
    Err(Error::NoCommonAlgorithm {
        kind,
        ours: ours.iter().map(|x| x.as_ref().to_owned()).collect(),
        theirs: theirs.iter().map(|x| (*x).to_owned()).collect(),
    })
}

/// Decode the next name-list field and negotiate it against `ours`.
fn select_next<S: AsRef<str> + Clone>(
    r: &mut &[u8],
    ours: &[S],
    kind: AlgorithmKind,
) -> Result<(bool, S), Error> {
    let offered = String::decode(r)?;
    select(ours, &offered.split(',').collect::<Vec<_>>(), kind)
}

/// Parse the server's KEXINIT payload and negotiate each algorithm
/// category by client preference order.
pub(crate) fn read_kex(buffer: &[u8], pref: &Preferred) -> Result<Names, Error> {
    // Message byte plus the 16-byte cookie.
    let Some(mut r) = buffer.get(17..) else {
        return Err(Error::Inconsistent);
    };
    let r = &mut r;

    let (kex_first, kex) = select_next(r, &pref.kex, AlgorithmKind::Kex)?;
    let (key_first, key) = select_next(r, &pref.key, AlgorithmKind::Key)?;

    let (_, cipher) = select_next(r, &pref.cipher, AlgorithmKind::Cipher)?;
    String::decode(r)?; // cipher server-to-client, assumed symmetric

    // A cipher without integrated authentication needs a separate MAC; for
    // the others a failed MAC negotiation is tolerated.
    let need_mac = CIPHERS.get(&cipher).map(|x| x.needs_mac()).unwrap_or(false);
    let mut negotiate_mac = || match select_next(r, &pref.mac, AlgorithmKind::Mac) {
        Ok((_, m)) => Ok(m),
        Err(e) if need_mac => Err(e),
        Err(_) => Ok(mac::NONE),
    };
    let client_mac = negotiate_mac()?;
    let server_mac = negotiate_mac()?;

    select_next(r, COMPRESSION, AlgorithmKind::Compression)?;
    select_next(r, COMPRESSION, AlgorithmKind::Compression)?;

    String::decode(r)?; // languages client-to-server
    String::decode(r)?; // languages server-to-client

    let follows = u8::decode(r)? != 0;
    let names = Names {
        kex,
        key,
        cipher,
        client_mac,
        server_mac,
        // The guessed packet is dropped unless both sides guessed right.
        ignore_guessed: follows && !(kex_first && key_first),
    };
    debug!("negotiated: {names:?}");
    Ok(names)
}

/// Build our KEXINIT payload.
pub(crate) fn write_kex(prefs: &Preferred) -> Result<Vec<u8>, Error> {
    fn names<S: AsRef<str>>(list: &[S]) -> NameList {
        NameList(list.iter().map(|x| x.as_ref().to_owned()).collect())
    }

    let mut buf = Vec::new();
    buf.push(msg::KEXINIT);

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    buf.extend(&cookie);

    names(&prefs.kex).encode(&mut buf)?;
    NameList(prefs.key.iter().map(ToString::to_string).collect()).encode(&mut buf)?;

    // Symmetric preferences, each written once per direction.
    for list in [names(&prefs.cipher), names(&prefs.mac), names(COMPRESSION)] {
        list.encode(&mut buf)?;
        list.encode(&mut buf)?;
    }

    Vec::<String>::new().encode(&mut buf)?; // languages client to server
    Vec::<String>::new().encode(&mut buf)?; // languages server to client

    buf.push(0); // no guessed packet follows
    buf.extend(&[0, 0, 0, 0]); // reserved
    Ok(buf)
}
