use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error};
use signature::Verifier;
use ssh_encoding::{Decode, Encode};
use ssh_key::{PublicKey, Signature};

use crate::client::Config;
use crate::helpers::EncodedExt;
use crate::kex::{KexAlgorithm, KEXES};
use crate::negotiation::Names;
use crate::session::{Exchange, NewKeys};
use crate::sshbuffer::{IncomingSshPacket, PacketWriter};
use crate::{msg, negotiation, Error, SshId};

/// Whether this is the first exchange of the connection or a re-exchange.
/// A re-exchange carries the session id over; it never changes again.
#[derive(Debug)]
pub(crate) enum KexCause {
    Initial,
    Rekey { session_id: Vec<u8> },
}

impl KexCause {
    pub fn is_rekey(&self) -> bool {
        matches!(self, Self::Rekey { .. })
    }

    fn session_id(&self) -> Option<&[u8]> {
        match self {
            Self::Initial => None,
            Self::Rekey { session_id } => Some(session_id),
        }
    }
}

pub(crate) enum KexProgress {
    NeedsReply { kex: ClientKex },
    Done {
        newkeys: NewKeys,
        server_host_key: PublicKey,
    },
}

#[allow(clippy::large_enum_variant)]
enum ClientKexState {
    Created,
    WaitingForDhReply {
        names: Names,
        kex: Box<dyn KexAlgorithm + Send>,
    },
    WaitingForNewKeys {
        server_host_key: PublicKey,
        newkeys: NewKeys,
    },
}

impl ClientKexState {
    fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::WaitingForDhReply { .. } => "waiting for DH reply",
            Self::WaitingForNewKeys { .. } => "waiting for NEWKEYS",
        }
    }
}

/// The client half of one key exchange, driven one packet at a time.
pub(crate) struct ClientKex {
    exchange: Exchange,
    cause: KexCause,
    state: ClientKexState,
    config: Arc<Config>,
}

impl Debug for ClientKex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKex")
            .field("cause", &self.cause)
            .field("state", &self.state.label())
            .finish()
    }
}

fn expect_first_byte(input: &IncomingSshPacket, wanted: u8) -> Result<(), Error> {
    let got = input.buffer.first();
    if got == Some(&wanted) {
        Ok(())
    } else {
        error!("unexpected message during key exchange: {got:?}, wanted {wanted}");
        Err(Error::KexInit)
    }
}

impl ClientKex {
    pub fn new(
        config: Arc<Config>,
        client_sshid: &SshId,
        server_sshid: &[u8],
        cause: KexCause,
    ) -> Self {
        Self {
            exchange: Exchange::new(client_sshid.as_kex_hash_bytes(), server_sshid),
            cause,
            state: ClientKexState::Created,
            config,
        }
    }

    /// Send our KEXINIT, keeping the payload for the exchange hash.
    pub fn kexinit(&mut self, output: &mut PacketWriter) -> Result<(), Error> {
        self.exchange.client_kex_init = negotiation::write_kex(&self.config.preferred)?;
        output.packet_raw(&self.exchange.client_kex_init);
        Ok(())
    }

    pub fn step(
        mut self,
        input: &IncomingSshPacket,
        output: &mut PacketWriter,
    ) -> Result<KexProgress, Error> {
        match self.state {
            ClientKexState::Created => {
                // The server's KEXINIT settles the algorithm choice.
                expect_first_byte(input, msg::KEXINIT)?;
                self.exchange.server_kex_init.extend(&input.buffer);
                let names = negotiation::read_kex(&input.buffer, &self.config.preferred)?;
                debug!("negotiated algorithms: {names:?}");

                let mut kex = KEXES.get(&names.kex).ok_or(Error::UnknownAlgo)?.make();
                output.packet(|w| {
                    kex.client_dh(&mut self.exchange.client_ephemeral, w)?;
                    Ok(())
                })?;

                self.state = ClientKexState::WaitingForDhReply { names, kex };
                Ok(KexProgress::NeedsReply { kex: self })
            }
            ClientKexState::WaitingForDhReply { mut names, mut kex } => {
                if names.ignore_guessed {
                    // The packet following the server KEXINIT was a wrong
                    // first_kex_packet_follows guess; skip it once.
                    debug!("ignoring guessed kex packet");
                    names.ignore_guessed = false;
                    self.state = ClientKexState::WaitingForDhReply { names, kex };
                    return Ok(KexProgress::NeedsReply { kex: self });
                }

                expect_first_byte(input, msg::KEX_ECDH_REPLY)?;
                #[allow(clippy::indexing_slicing)] // first byte checked above
                let reader = &mut &input.buffer[1..];

                let host_key_blob = Bytes::decode(reader)?;
                let server_host_key = PublicKey::from_bytes(&host_key_blob)?;
                debug!("server host key: {:?}", server_host_key.to_openssh());

                let server_ephemeral = Bytes::decode(reader)?;
                self.exchange.server_ephemeral.extend(&server_ephemeral);
                kex.compute_shared_secret(&self.exchange.server_ephemeral)?;

                let hash =
                    kex.compute_exchange_hash(&host_key_blob.encoded()?, &self.exchange)?;

                let sig_blob = Bytes::decode(reader)?;
                let signature = Signature::decode(&mut &sig_blob[..])?;
                if let Err(e) = Verifier::verify(&server_host_key, &hash, &signature) {
                    debug!("exchange hash signature did not verify: {e:?}");
                    return Err(Error::WrongServerSig);
                }

                let newkeys =
                    derive_newkeys(hash, &*kex, names, &self.exchange, self.cause.session_id())?;
                output.packet(|w| {
                    msg::NEWKEYS.encode(w)?;
                    Ok(())
                })?;

                self.state = ClientKexState::WaitingForNewKeys {
                    server_host_key,
                    newkeys,
                };
                Ok(KexProgress::NeedsReply { kex: self })
            }
            ClientKexState::WaitingForNewKeys {
                server_host_key,
                newkeys,
            } => {
                expect_first_byte(input, msg::NEWKEYS)?;
                Ok(KexProgress::Done {
                    newkeys,
                    server_host_key,
                })
            }
        }
    }
}

fn derive_newkeys(
    hash: Vec<u8>,
    kex: &(dyn KexAlgorithm + Send),
    names: Names,
    exchange: &Exchange,
    session_id: Option<&[u8]>,
) -> Result<NewKeys, Error> {
    // On the initial exchange the exchange hash becomes the session id.
    let session_id = session_id.unwrap_or(&hash);
    let cipher = kex.compute_keys(
        session_id,
        &hash,
        names.cipher,
        names.server_mac,
        names.client_mac,
        false,
    )?;
    Ok(NewKeys {
        exchange: exchange.clone(),
        names,
        cipher,
        session_id: session_id.to_vec(),
    })
}
