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

//! Host key trust stores.
//!
//! A [`TrustStore`] answers one question during key exchange: is this host
//! key known for this host and port? The engine fails closed; any answer
//! other than [`HostTrust::Trusted`] aborts the handshake with
//! [`Error::HostKeyUntrusted`][crate::Error::HostKeyUntrusted] before any
//! authentication data is sent. Learning a key is always an explicit caller
//! decision, never a side effect of connecting.

use std::collections::HashMap;

use log::debug;
use ssh_key::{HashAlg, PublicKey};

/// The verdict of a trust store about a host key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTrust {
    /// The key is on record for this host.
    Trusted,
    /// Nothing is on record for this host.
    Unknown,
    /// Keys are on record for this host, and this is not one of them.
    Mismatch,
}

/// A store of known host keys.
pub trait TrustStore: Send + Sync {
    fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostTrust;

    /// Record `key` as trusted for `(host, port)`.
    fn learn(&mut self, host: &str, port: u16, key: &PublicKey);
}

/// An in-memory trust store, seeded by the caller.
///
/// Front-ends with persistent state are expected to wrap their own storage
/// in [`TrustStore`] instead; nothing here survives the process.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    keys: HashMap<(String, u16), Vec<PublicKey>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostTrust {
        match self.keys.get(&(host.to_owned(), port)) {
            None => HostTrust::Unknown,
            Some(known) if known.iter().any(|k| k.key_data() == key.key_data()) => {
                HostTrust::Trusted
            }
            Some(_) => {
                debug!(
                    "host key mismatch for {host}:{port}, offered {}",
                    key.fingerprint(HashAlg::Sha256)
                );
                HostTrust::Mismatch
            }
        }
    }

    fn learn(&mut self, host: &str, port: u16, key: &PublicKey) {
        let entry = self.keys.entry((host.to_owned(), port)).or_default();
        if !entry.iter().any(|k| k.key_data() == key.key_data()) {
            debug!(
                "learning host key for {host}:{port}: {}",
                key.fingerprint(HashAlg::Sha256)
            );
            entry.push(key.clone());
        }
    }
}
