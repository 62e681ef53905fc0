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

//! MAC algorithm names (for [Preferred][crate::Preferred]) and the HMAC-SHA2
//! implementations behind them, in both classic and encrypt-then-MAC layouts.
use std::collections::HashMap;
use std::convert::TryFrom;
use std::marker::PhantomData;
use std::sync::LazyLock;

use digest::typenum::{Unsigned, U32, U64};
use generic_array::{ArrayLength, GenericArray};
use hmac::Hmac;
use sha2::{Sha256, Sha512};
use ssh_encoding::Encode;
use subtle::ConstantTimeEq;

pub(crate) trait MacAlgorithm {
    fn key_len(&self) -> usize;
    fn make_mac(&self, key: &[u8]) -> Box<dyn Mac + Send>;
}

pub(crate) trait Mac {
    fn mac_len(&self) -> usize;
    fn is_etm(&self) -> bool {
        false
    }
    fn compute(&self, sequence_number: u32, payload: &[u8], output: &mut [u8]);
    fn verify(&self, sequence_number: u32, payload: &[u8], mac: &[u8]) -> bool;
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

impl TryFrom<&str> for Name {
    type Error = ();
    fn try_from(s: &str) -> Result<Name, ()> {
        ALL_MAC_ALGORITHMS
            .iter()
            .find(|n| n.0 == s)
            .map(|n| **n)
            .ok_or(())
    }
}

/// `none`
pub const NONE: Name = Name("none");
/// `hmac-sha2-256`
pub const HMAC_SHA256: Name = Name("hmac-sha2-256");
/// `hmac-sha2-512`
pub const HMAC_SHA512: Name = Name("hmac-sha2-512");
/// `hmac-sha2-256-etm@openssh.com`
pub const HMAC_SHA256_ETM: Name = Name("hmac-sha2-256-etm@openssh.com");
/// `hmac-sha2-512-etm@openssh.com`
pub const HMAC_SHA512_ETM: Name = Name("hmac-sha2-512-etm@openssh.com");

/// HMAC over `seqn ++ covered bytes`, generic over the hash. The classic
/// and `-etm@openssh.com` variants compute the same tag; they differ only
/// in what the record layer covers, which [`Mac::is_etm`] reports.
pub(crate) struct HmacAlgorithm<M, KL> {
    etm: bool,
    hash: PhantomData<M>,
    key_len: PhantomData<KL>,
}

struct HmacState<M, KL: ArrayLength<u8>> {
    key: GenericArray<u8, KL>,
    etm: bool,
    hash: PhantomData<M>,
}

impl<M, KL> MacAlgorithm for HmacAlgorithm<M, KL>
where
    M: digest::Mac + digest::KeyInit + Send + 'static,
    KL: ArrayLength<u8> + 'static,
{
    fn key_len(&self) -> usize {
        KL::to_usize()
    }

    fn make_mac(&self, mac_key: &[u8]) -> Box<dyn Mac + Send> {
        Box::new(HmacState::<M, KL> {
            key: GenericArray::clone_from_slice(mac_key),
            etm: self.etm,
            hash: PhantomData,
        })
    }
}

impl<M, KL> Mac for HmacState<M, KL>
where
    M: digest::Mac + digest::KeyInit + Send + 'static,
    KL: ArrayLength<u8> + 'static,
{
    fn mac_len(&self) -> usize {
        M::OutputSize::to_usize()
    }

    fn is_etm(&self) -> bool {
        self.etm
    }

    fn compute(&self, sequence_number: u32, payload: &[u8], output: &mut [u8]) {
        #[allow(clippy::unwrap_used)] // key length is fixed by KL
        let mut hmac = <M as digest::Mac>::new_from_slice(&self.key).unwrap();
        hmac.update(&sequence_number.to_be_bytes());
        hmac.update(payload);
        output.copy_from_slice(&hmac.finalize().into_bytes());
    }

    fn verify(&self, sequence_number: u32, payload: &[u8], mac: &[u8]) -> bool {
        let mut expected = GenericArray::<u8, M::OutputSize>::default();
        self.compute(sequence_number, payload, &mut expected);
        expected.ct_eq(mac).into()
    }
}

/// The absent MAC of the pre-kex phase and of AEAD-style ciphers.
pub(crate) struct NoMacAlgorithm;

struct NoMac;

impl MacAlgorithm for NoMacAlgorithm {
    fn key_len(&self) -> usize {
        0
    }

    fn make_mac(&self, _: &[u8]) -> Box<dyn Mac + Send> {
        Box::new(NoMac)
    }
}

impl Mac for NoMac {
    fn mac_len(&self) -> usize {
        0
    }

    fn compute(&self, _: u32, _: &[u8], _: &mut [u8]) {}

    fn verify(&self, _: u32, _: &[u8], _: &[u8]) -> bool {
        true
    }
}

impl<M, KL> HmacAlgorithm<M, KL> {
    const fn new(etm: bool) -> Self {
        Self {
            etm,
            hash: PhantomData,
            key_len: PhantomData,
        }
    }
}

pub(crate) static NONE_MAC: NoMacAlgorithm = NoMacAlgorithm;
static SHA256_MAC: HmacAlgorithm<Hmac<Sha256>, U32> = HmacAlgorithm::new(false);
static SHA512_MAC: HmacAlgorithm<Hmac<Sha512>, U64> = HmacAlgorithm::new(false);
static SHA256_ETM_MAC: HmacAlgorithm<Hmac<Sha256>, U32> = HmacAlgorithm::new(true);
static SHA512_ETM_MAC: HmacAlgorithm<Hmac<Sha512>, U64> = HmacAlgorithm::new(true);

pub const ALL_MAC_ALGORITHMS: &[&Name] = &[
    &NONE,
    &HMAC_SHA256,
    &HMAC_SHA512,
    &HMAC_SHA256_ETM,
    &HMAC_SHA512_ETM,
];

pub(crate) static MACS: LazyLock<HashMap<&'static Name, &(dyn MacAlgorithm + Send + Sync)>> =
    LazyLock::new(|| {
        let entries: [(&'static Name, &(dyn MacAlgorithm + Send + Sync)); 5] = [
            (&NONE, &NONE_MAC),
            (&HMAC_SHA256, &SHA256_MAC),
            (&HMAC_SHA512, &SHA512_MAC),
            (&HMAC_SHA256_ETM, &SHA256_ETM_MAC),
            (&HMAC_SHA512_ETM, &SHA512_ETM_MAC),
        ];
        debug_assert_eq!(entries.len(), ALL_MAC_ALGORITHMS.len());
        entries.into_iter().collect()
    });
