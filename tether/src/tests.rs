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
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

use std::borrow::Cow;
use std::num::Wrapping;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::Sha256;
use ssh_encoding::{Decode, Encode};
use ssh_key::Algorithm;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::{AuthFlow, Method, MethodSet};
use crate::cipher::{self, CipherPair, PACKET_LENGTH_LEN, PADDING_LENGTH_LEN};
use crate::helpers::EncodedExt;
use crate::parsing::ChannelOpenConfirmation;
use crate::session::{Encrypted, EncryptedState, Exchange};
use crate::sshbuffer::{read_ssh_id, PacketOrdering, PacketWriter, SSHBuffer};
use crate::trust::{HostTrust, MemoryTrustStore, TrustStore};
use crate::{client, kex, mac, msg, negotiation};
use crate::{Channel, ChannelId, ChannelMsg, Disconnect, Error, Preferred};

fn init() {
    let _ = env_logger::try_init();
}

/// Derive a matched client/server key pair from the same exchange, the way
/// both ends of a connection would.
fn derived_pairs(secret: &[u8], hash: &[u8], m: mac::Name) -> (CipherPair, CipherPair) {
    let client = kex::compute_keys::<Sha256>(
        Some(secret),
        hash,
        hash,
        cipher::AES_256_CTR,
        m,
        m,
        false,
    )
    .unwrap();
    let server = kex::compute_keys::<Sha256>(
        Some(secret),
        hash,
        hash,
        cipher::AES_256_CTR,
        m,
        m,
        true,
    )
    .unwrap();
    (client, server)
}

fn seal(pair: &mut CipherPair, payload: &[u8]) -> SSHBuffer {
    let mut out = SSHBuffer::new();
    pair.sealing.write(payload, &mut out);
    out
}

async fn open(pair: &mut CipherPair, sealed: &[u8]) -> Result<Vec<u8>, Error> {
    let mut stream = sealed;
    let mut buf = SSHBuffer::new();
    let n = cipher::read(&mut stream, &mut buf, &mut *pair.opening).await?;
    Ok(buf.buffer[PACKET_LENGTH_LEN + PADDING_LENGTH_LEN..n].to_vec())
}

#[tokio::test]
async fn record_layer_roundtrip() {
    init();
    for m in [mac::HMAC_SHA256, mac::HMAC_SHA512_ETM] {
        let (mut client, mut server) = derived_pairs(b"shared secret", &[3u8; 32], m);

        let sealed = seal(&mut client, b"first payload");
        assert_eq!(open(&mut server, &sealed.buffer).await.unwrap(), b"first payload");

        // Sequence numbers advanced in lockstep on both sides.
        let sealed = seal(&mut client, b"second payload");
        assert_eq!(open(&mut server, &sealed.buffer).await.unwrap(), b"second payload");
    }
}

#[tokio::test]
async fn tampered_frame_fails_integrity() {
    init();
    for m in [mac::HMAC_SHA256, mac::HMAC_SHA256_ETM] {
        let (mut client, mut server) = derived_pairs(b"shared secret", &[4u8; 32], m);
        let mut sealed = seal(&mut client, b"payload under protection").buffer;
        sealed[7] ^= 1;
        match open(&mut server, &sealed).await {
            Err(Error::IntegrityFailure) => {}
            r => panic!("tampered frame was not rejected: {r:?}"),
        }
    }
}

#[tokio::test]
async fn wrong_direction_keys_do_not_open() {
    init();
    let (mut client, _) = derived_pairs(b"shared secret", &[5u8; 32], mac::HMAC_SHA256);
    let sealed = seal(&mut client, b"client to server").buffer;
    // The client's own opening key is derived with the opposite letters and
    // must not accept its outgoing traffic.
    assert!(open(&mut client, &sealed).await.is_err());
}

#[tokio::test]
async fn rekeying_installs_fresh_keys() {
    init();
    let (mut c1, mut s1) = derived_pairs(b"shared secret", &[6u8; 32], mac::HMAC_SHA256);
    let (_, mut s2) = derived_pairs(b"shared secret", &[7u8; 32], mac::HMAC_SHA256);

    let sealed = seal(&mut c1, b"sent before rekeying").buffer;
    assert!(open(&mut s2, &sealed.clone()).await.is_err());
    assert_eq!(
        open(&mut s1, &sealed).await.unwrap(),
        b"sent before rekeying"
    );
}

#[tokio::test]
async fn oversized_and_truncated_frames() {
    init();
    // A declared length past the hard cap is refused before buffering.
    let mut opening = cipher::clear_opening_key();
    let mut buf = SSHBuffer::new();
    let huge = ((1024 * 1024) as u32).to_be_bytes();
    match cipher::read(&mut &huge[..], &mut buf, &mut *opening).await {
        Err(Error::MalformedFrame(n)) => assert_eq!(n, 1024 * 1024),
        r => panic!("oversized frame accepted: {r:?}"),
    }

    // EOF before a full frame means the transport is gone.
    let mut opening = cipher::clear_opening_key();
    let mut buf = SSHBuffer::new();
    match cipher::read(&mut &[][..], &mut buf, &mut *opening).await {
        Err(Error::TransportClosed) => {}
        r => panic!("eof not reported as closed transport: {r:?}"),
    }
}

#[tokio::test]
async fn read_reassembles_fragmented_frames() {
    init();
    let (mut client, mut server) = derived_pairs(b"shared secret", &[8u8; 32], mac::HMAC_SHA256);
    let sealed = seal(&mut client, b"fragmented payload").buffer;

    let (mut a, mut b) = tokio::io::duplex(4);
    let writer = tokio::spawn(async move {
        for chunk in sealed.chunks(3) {
            a.write_all(chunk).await.unwrap();
        }
    });
    let mut buf = SSHBuffer::new();
    let n = cipher::read(&mut b, &mut buf, &mut *server.opening)
        .await
        .unwrap();
    assert_eq!(
        &buf.buffer[PACKET_LENGTH_LEN + PADDING_LENGTH_LEN..n],
        b"fragmented payload"
    );
    writer.await.unwrap();
}

#[test]
fn out_of_order_sequence_is_fatal() {
    let mut ordering = PacketOrdering::new();
    ordering.check(Wrapping(0)).unwrap();
    ordering.check(Wrapping(1)).unwrap();
    // A replay of an already-seen number must not be accepted.
    assert!(matches!(
        ordering.check(Wrapping(1)),
        Err(Error::OutOfOrder)
    ));
}

fn prefs(
    ciphers: &'static [cipher::Name],
    macs: &'static [mac::Name],
) -> Preferred {
    Preferred {
        kex: Cow::Borrowed(&[kex::CURVE25519]),
        key: Cow::Borrowed(&[Algorithm::Ed25519]),
        cipher: Cow::Borrowed(ciphers),
        mac: Cow::Borrowed(macs),
    }
}

#[test]
fn negotiation_picks_first_common_algorithm() {
    init();
    let server = prefs(
        &[cipher::AES_128_CTR, cipher::AES_192_CTR],
        &[mac::HMAC_SHA256],
    );
    let client = prefs(
        &[cipher::AES_256_CTR, cipher::AES_192_CTR, cipher::AES_128_CTR],
        &[mac::HMAC_SHA512, mac::HMAC_SHA256],
    );
    let kexinit = negotiation::write_kex(&server).unwrap();
    let names = negotiation::read_kex(&kexinit, &client).unwrap();
    assert_eq!(names.kex, kex::CURVE25519);
    assert_eq!(names.cipher, cipher::AES_192_CTR);
    assert_eq!(names.client_mac, mac::HMAC_SHA256);
    assert!(!names.ignore_guessed);
}

#[test]
fn negotiation_fails_without_common_algorithm() {
    init();
    let server = prefs(&[cipher::AES_128_CTR], &[mac::HMAC_SHA256]);
    let client = prefs(&[cipher::AES_256_CTR], &[mac::HMAC_SHA256]);
    let kexinit = negotiation::write_kex(&server).unwrap();
    match negotiation::read_kex(&kexinit, &client) {
        Err(Error::NoCommonAlgorithm { kind, .. }) => {
            assert!(matches!(kind, crate::AlgorithmKind::Cipher))
        }
        r => panic!("negotiation should have failed: {r:?}"),
    }
}

fn password(p: &str) -> Method {
    Method::Password {
        password: p.into(),
    }
}

#[test]
fn auth_flow_stops_at_attempt_limit() {
    let mut flow = AuthFlow::new(
        vec![
            password("one"),
            password("two"),
            password("three"),
            password("four"),
        ],
        3,
    );
    for _ in 0..3 {
        let method = flow.next().unwrap();
        flow.on_failure(MethodSet::all());
        assert!(matches!(method, Method::Password { .. }));
    }
    // The fourth credential exists but the budget is spent.
    assert!(flow.next().is_none());
}

#[test]
fn auth_flow_follows_server_remaining_methods() {
    let key = ssh_key::PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
    let mut flow = AuthFlow::new(
        vec![
            password("hunter2"),
            Method::PublicKey { key: Arc::new(key) },
        ],
        10,
    );
    assert!(matches!(flow.next(), Some(Method::Password { .. })));

    // The server only allows publickey from now on; the remaining password
    // credential is skipped.
    let remaining =
        MethodSet::from(&crate::helpers::NameList(vec!["publickey".to_string()]));
    flow.on_failure(remaining);
    assert!(matches!(flow.next(), Some(Method::PublicKey { .. })));
    assert!(flow.next().is_none());
}

fn fresh_encrypted() -> Encrypted {
    Encrypted {
        state: EncryptedState::Authenticated,
        exchange: None,
        session_id: Vec::new(),
        channels: std::collections::HashMap::new(),
        last_channel_id: Wrapping(1),
        outgoing: Vec::new(),
        flushed: 0,
        last_rekey: std::time::Instant::now(),
        rekey_wanted: false,
    }
}

#[test]
fn channel_send_respects_window_and_packet_size() {
    init();
    let mut enc = fresh_encrypted();
    let id = enc.new_channel(2097152, 32768);
    enc.channels.get_mut(&id).unwrap().confirm(&ChannelOpenConfirmation {
        recipient_channel: u32::from(id),
        sender_channel: 9,
        initial_window_size: 5,
        maximum_packet_size: 4,
    });

    enc.data(id, None, b"0123456789".to_vec(), false).unwrap();
    {
        let params = enc.channels.get(&id).unwrap();
        // Five bytes went out (as a 4-byte and a 1-byte packet), the rest is
        // queued until the server widens the window.
        assert_eq!(params.recipient_window_size, 0);
        assert_eq!(params.pending_data.len(), 1);
        assert_eq!(params.pending_data[0].2, 5);
    }

    enc.channels.get_mut(&id).unwrap().recipient_window_size += 100;
    assert_eq!(enc.flush_pending(id).unwrap(), 5);
    assert!(!enc.has_pending_data(id));
}

#[test]
fn data_on_unconfirmed_channel_is_refused() {
    let mut enc = fresh_encrypted();
    let id = enc.new_channel(2097152, 32768);
    assert!(matches!(
        enc.data(id, None, b"too early".to_vec(), false),
        Err(Error::WrongChannel)
    ));
}

#[test]
fn server_initiated_channel_open_is_refused() {
    let mut enc = fresh_encrypted();
    enc.refuse_channel_open(7).unwrap();

    // Skip the write queue's length prefix.
    let mut r = &enc.outgoing[4..];
    assert_eq!(u8::decode(&mut r).unwrap(), msg::CHANNEL_OPEN_FAILURE);
    assert_eq!(u32::decode(&mut r).unwrap(), 7);
    assert_eq!(
        u32::decode(&mut r).unwrap(),
        msg::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED as u32
    );
    assert_eq!(
        String::decode(&mut r).unwrap(),
        "open administratively prohibited"
    );
}

#[tokio::test]
async fn channel_handle_blocks_on_empty_window() {
    init();
    let (msg_tx, mut msg_rx) = tokio::sync::mpsc::channel::<client::Msg>(10);
    let (chan_tx, chan_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut channel: Channel<client::Msg> = Channel {
        id: ChannelId(1),
        sender: msg_tx,
        receiver: chan_rx,
        max_packet_size: 32768,
        window_size: 0,
    };

    let send = tokio::spawn(async move { channel.data(&b"hello"[..]).await });

    // Nothing may go out while the window is empty.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(msg_rx.try_recv().is_err());

    chan_tx
        .send(ChannelMsg::WindowAdjusted { new_size: 1024 })
        .unwrap();
    match msg_rx.recv().await.unwrap() {
        client::Msg::Channel(id, ChannelMsg::Data { data }) => {
            assert_eq!(u32::from(id), 1);
            assert_eq!(data, b"hello");
        }
        m => panic!("unexpected message: {m:?}"),
    }
    send.await.unwrap().unwrap();
}

#[tokio::test]
async fn blocked_send_fails_when_session_is_gone() {
    init();
    let (msg_tx, _msg_rx) = tokio::sync::mpsc::channel::<client::Msg>(10);
    let (chan_tx, chan_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut channel: Channel<client::Msg> = Channel {
        id: ChannelId(1),
        sender: msg_tx,
        receiver: chan_rx,
        max_packet_size: 32768,
        window_size: 0,
    };

    let send = tokio::spawn(async move { channel.data(&b"stuck"[..]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The session side goes away while the send is parked on the window;
    // the send must fail instead of waiting (or spinning) forever.
    drop(chan_tx);
    let result = tokio::time::timeout(Duration::from_millis(500), send)
        .await
        .expect("send still blocked after the session went away")
        .unwrap();
    assert!(matches!(result, Err(Error::TransportClosed)));
}

#[test]
fn trust_store_verdicts() {
    init();
    let key_a = ssh_key::PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
    let key_b = ssh_key::PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
    let key_a = key_a.public_key().clone();
    let key_b = key_b.public_key().clone();

    let mut store = MemoryTrustStore::new();
    assert_eq!(store.check("host", 22, &key_a), HostTrust::Unknown);

    store.learn("host", 22, &key_a);
    assert_eq!(store.check("host", 22, &key_a), HostTrust::Trusted);
    assert_eq!(store.check("host", 22, &key_b), HostTrust::Mismatch);

    // Same host under another port is a different endpoint.
    assert_eq!(store.check("host", 2222, &key_a), HostTrust::Unknown);
}

#[tokio::test]
async fn handshake_honors_timeout() {
    init();
    struct Client;
    #[async_trait]
    impl client::Handler for Client {
        type Error = Error;
    }

    let config = Arc::new(client::Config {
        handshake_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    // The other end never sends its version string.
    let (a, _b) = tokio::io::duplex(1024);
    match client::connect_stream(config, a, Client).await {
        Err(Error::Timeout) => {}
        r => panic!("handshake should have timed out: {r:?}"),
    }
}

const SERVER_ID: &[u8] = b"SSH-2.0-testserver";

/// A minimal in-process server: enough of the other side of the protocol
/// to take a real client session through the version exchange, the key
/// exchange and authentication.
struct TestServer<S> {
    stream: S,
    writer: PacketWriter,
    read_buffer: SSHBuffer,
    opening: Box<dyn cipher::OpeningKey + Send>,
    host_key: ssh_key::PrivateKey,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestServer<S> {
    fn new(stream: S) -> Self {
        TestServer {
            stream,
            writer: PacketWriter::clear(),
            read_buffer: SSHBuffer::new(),
            opening: cipher::clear_opening_key(),
            host_key: ed25519_key(),
        }
    }

    async fn recv(&mut self) -> Result<Vec<u8>, Error> {
        let n = cipher::read(&mut self.stream, &mut self.read_buffer, &mut *self.opening).await?;
        Ok(self.read_buffer.buffer[PACKET_LENGTH_LEN + PADDING_LENGTH_LEN..n].to_vec())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        let buf = self.writer.buffer();
        self.stream.write_all(&buf.buffer).await?;
        buf.buffer.clear();
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), Error> {
        let mut id = SERVER_ID.to_vec();
        id.extend(b"\r\n");
        self.stream.write_all(&id).await?;
        let client_id = read_ssh_id(&mut self.stream).await?;

        let server_kexinit = negotiation::write_kex(&Preferred::DEFAULT)?;
        self.writer.packet_raw(&server_kexinit);
        self.flush().await?;
        let client_kexinit = self.recv().await?;
        let names = negotiation::read_kex(&client_kexinit, &Preferred::DEFAULT)?;

        let ecdh_init = self.recv().await?;
        assert_eq!(ecdh_init.first(), Some(&msg::KEX_ECDH_INIT));
        let client_ephemeral = Bytes::decode(&mut &ecdh_init[1..])?;

        let mut exchange = Exchange::new(&client_id, SERVER_ID);
        exchange.client_kex_init = client_kexinit;
        exchange.server_kex_init = server_kexinit;
        exchange.client_ephemeral = client_ephemeral.to_vec();

        // The ephemeral generation is the same on either side; only the
        // init message written alongside differs, so it is discarded.
        let mut kex = kex::KEXES.get(&names.kex).unwrap().make();
        let mut discarded = Vec::new();
        kex.client_dh(&mut exchange.server_ephemeral, &mut discarded)?;
        kex.compute_shared_secret(&exchange.client_ephemeral)?;

        let host_key_blob = self.host_key.public_key().to_bytes()?;
        let hash = kex.compute_exchange_hash(&host_key_blob.encoded()?, &exchange)?;
        let signature: ssh_key::Signature = signature::Signer::try_sign(&self.host_key, &hash)?;

        self.writer.packet(|w| {
            msg::KEX_ECDH_REPLY.encode(w)?;
            host_key_blob.encode(w)?;
            exchange.server_ephemeral.encode(w)?;
            signature.encoded()?.encode(w)?;
            Ok(())
        })?;
        self.writer.packet(|w| {
            msg::NEWKEYS.encode(w)?;
            Ok(())
        })?;
        self.flush().await?;

        let newkeys = self.recv().await?;
        assert_eq!(newkeys.first(), Some(&msg::NEWKEYS));

        let pair = kex.compute_keys(
            &hash,
            &hash,
            names.cipher,
            names.client_mac,
            names.server_mac,
            true,
        )?;
        self.writer.set_cipher(pair.sealing);
        self.opening = pair.opening;
        Ok(())
    }

    /// Fail every authentication attempt until the client disconnects;
    /// returns the disconnect reason code.
    async fn serve_password_failures(&mut self) -> Result<u32, Error> {
        loop {
            let pkt = self.recv().await?;
            match pkt.first() {
                Some(&msg::SERVICE_REQUEST) => {
                    self.writer.packet(|w| {
                        msg::SERVICE_ACCEPT.encode(w)?;
                        "ssh-userauth".encode(w)?;
                        Ok(())
                    })?;
                }
                Some(&msg::USERAUTH_REQUEST) => {
                    self.writer.packet(|w| {
                        msg::USERAUTH_FAILURE.encode(w)?;
                        "password".encode(w)?;
                        w.push(0);
                        Ok(())
                    })?;
                }
                Some(&msg::DISCONNECT) => {
                    return Ok(u32::decode(&mut &pkt[1..])?);
                }
                other => panic!("unexpected message during auth: {other:?}"),
            }
            self.flush().await?;
        }
    }
}

fn ed25519_key() -> ssh_key::PrivateKey {
    ssh_key::PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap()
}

struct Trusting;

#[async_trait]
impl client::Handler for Trusting {
    type Error = Error;

    async fn check_server_key(&mut self, _: &ssh_key::PublicKey) -> Result<bool, Error> {
        Ok(true)
    }
}

#[tokio::test]
async fn untrusted_host_key_fails_the_handshake() {
    init();
    struct Distrusting;
    #[async_trait]
    impl client::Handler for Distrusting {
        type Error = Error;
        // check_server_key is left at its fail-closed default.
    }

    let (a, b) = tokio::io::duplex(65536);
    let server = tokio::spawn(async move {
        let mut server = TestServer::new(b);
        // The client hangs up right after the exchange; an error past that
        // point is expected.
        let _ = server.handshake().await;
    });

    match client::connect_stream(Arc::new(client::Config::default()), a, Distrusting).await {
        Err(Error::HostKeyUntrusted) => {}
        r => panic!("untrusted host key was accepted: {r:?}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn fatal_error_surfaces_when_awaiting_the_handle() {
    init();
    let (a, b) = tokio::io::duplex(65536);
    let server = tokio::spawn(async move {
        let mut server = TestServer::new(b);
        server.handshake().await.unwrap();
        // A frame whose tag no longer matches its ciphertext.
        server
            .writer
            .packet(|w| {
                msg::IGNORE.encode(w)?;
                "some corrupted payload".encode(w)?;
                Ok(())
            })
            .unwrap();
        server.writer.buffer().buffer[6] ^= 1;
        server.flush().await.unwrap();
    });

    let handle = client::connect_stream(Arc::new(client::Config::default()), a, Trusting)
        .await
        .unwrap();
    match handle.await {
        Err(Error::IntegrityFailure) => {}
        r => panic!("session error was not surfaced to the caller: {r:?}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn exhausted_authentication_disconnects_the_session() {
    init();
    let (a, b) = tokio::io::duplex(65536);
    let server = tokio::spawn(async move {
        let mut server = TestServer::new(b);
        server.handshake().await.unwrap();
        server.serve_password_failures().await.unwrap()
    });

    let mut handle = client::connect_stream(Arc::new(client::Config::default()), a, Trusting)
        .await
        .unwrap();
    match handle
        .authenticate("user", vec![password("one"), password("two")], 2)
        .await
    {
        Err(Error::AuthenticationExhausted) => {}
        r => panic!("authentication should have been exhausted: {r:?}"),
    }
    assert_eq!(
        server.await.unwrap(),
        Disconnect::NoMoreAuthMethodsAvailable as u32
    );
}
