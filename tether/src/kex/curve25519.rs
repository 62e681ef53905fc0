//! RFC 8731 curve25519-sha256: X25519 ECDH with a SHA-256 exchange hash.

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha256};
use ssh_encoding::Encode;
use zeroize::Zeroizing;

use super::{compute_keys, KexAlgorithm, KexType};
use crate::helpers::encode_mpint;
use crate::session::Exchange;
use crate::{cipher, mac, msg, Error};

pub struct Curve25519KexType {}

impl KexType for Curve25519KexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(Curve25519Kex {
            local_secret: None,
            shared_secret: None,
        })
    }
}

pub struct Curve25519Kex {
    local_secret: Option<Scalar>,
    shared_secret: Option<MontgomeryPoint>,
}

// Key material stays out of logs.
impl std::fmt::Debug for Curve25519Kex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Curve25519Kex").finish_non_exhaustive()
    }
}

impl KexAlgorithm for Curve25519Kex {
    fn client_dh(
        &mut self,
        client_ephemeral: &mut Vec<u8>,
        writer: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let secret = Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>());
        let public = (ED25519_BASEPOINT_TABLE * &secret).to_montgomery();

        client_ephemeral.clear();
        client_ephemeral.extend(&public.0);

        msg::KEX_ECDH_INIT.encode(writer)?;
        public.0.as_slice().encode(writer)?;

        self.local_secret = Some(secret);
        Ok(())
    }

    fn compute_shared_secret(&mut self, remote_pubkey: &[u8]) -> Result<(), Error> {
        let secret = self.local_secret.take().ok_or(Error::KexInit)?;
        let point: [u8; 32] = remote_pubkey.try_into().map_err(|_| Error::Kex)?;
        self.shared_secret = Some(secret * MontgomeryPoint(point));
        Ok(())
    }

    /// See page 7 of RFC 5656; `key` is the length-prefixed host key blob.
    fn compute_exchange_hash(&self, key: &[u8], exchange: &Exchange) -> Result<Vec<u8>, Error> {
        let mut buffer = Vec::new();
        exchange.client_id.encode(&mut buffer)?;
        exchange.server_id.encode(&mut buffer)?;
        exchange.client_kex_init.encode(&mut buffer)?;
        exchange.server_kex_init.encode(&mut buffer)?;

        buffer.extend(key);
        exchange.client_ephemeral.encode(&mut buffer)?;
        exchange.server_ephemeral.encode(&mut buffer)?;

        if let Some(ref shared) = self.shared_secret {
            encode_mpint(&shared.0, &mut buffer)?;
        }

        Ok(Sha256::digest(&buffer).to_vec())
    }

    fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        cipher: cipher::Name,
        remote_to_local_mac: mac::Name,
        local_to_remote_mac: mac::Name,
        is_server: bool,
    ) -> Result<cipher::CipherPair, Error> {
        let shared_mpint = match self.shared_secret {
            Some(ref shared) => {
                let mut buf = Zeroizing::new(Vec::new());
                encode_mpint(&shared.0, &mut *buf)?;
                Some(buf)
            }
            None => None,
        };

        compute_keys::<Sha256>(
            shared_mpint.as_deref().map(Vec::as_slice),
            session_id,
            exchange_hash,
            cipher,
            remote_to_local_mac,
            local_to_remote_mac,
            is_server,
        )
    }
}
