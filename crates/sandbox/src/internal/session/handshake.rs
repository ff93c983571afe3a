use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use orion::aead::streaming::{Nonce, StreamOpener, StreamSealer, StreamTag};
use orion::kdf::SecretKey;
use orion::util::secure_rand_bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::internal::common::error::SandboxError;
use crate::internal::session::codec::{FrameSink, FrameSource, decode, encode};

const CHALLENGE_LENGTH: usize = 16;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// First message of a session; both peers send one.
#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct Hello {
    pub protocol: u32,
    pub role: Cow<'static, str>,
    /// Present when the sender holds a session key.
    pub challenge: Option<ByteBuf>,
}

/// Answer to the peer's [`Hello`].
#[derive(Serialize, Deserialize, Debug)]
pub(crate) enum HelloReply {
    Plain,
    Sealed { nonce: ByteBuf, proof: ByteBuf },
    Refused { reason: String },
}

/// Stream ciphers of an established session, both absent for plain sessions.
pub(crate) struct SessionCiphers {
    pub sealer: Option<StreamSealer>,
    pub opener: Option<StreamOpener>,
}

/// One side of the session handshake.
///
/// A peer with a key proves that it holds the same key by sealing its role,
/// the protocol version and the challenge it received. The sealer used for
/// the proof keeps running and encrypts the rest of the session.
pub(crate) struct Handshake {
    protocol: u32,
    role: &'static str,
    peer_role: &'static str,
    key: Option<Arc<SecretKey>>,
    challenge: Vec<u8>,
    sealer: Option<StreamSealer>,
    refusal: Option<String>,
}

fn proof_payload(role: &str, protocol: u32, challenge: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(role.len() + 4 + challenge.len());
    payload.extend_from_slice(role.as_bytes());
    payload.extend_from_slice(&protocol.to_le_bytes());
    payload.extend_from_slice(challenge);
    payload
}

impl Handshake {
    pub fn new(
        protocol: u32,
        role: &'static str,
        peer_role: &'static str,
        key: Option<Arc<SecretKey>>,
    ) -> Self {
        Handshake {
            protocol,
            role,
            peer_role,
            key,
            challenge: Vec::new(),
            sealer: None,
            refusal: None,
        }
    }

    pub fn hello(&mut self) -> crate::Result<Hello> {
        let challenge = if self.key.is_some() {
            let mut challenge = vec![0; CHALLENGE_LENGTH];
            secure_rand_bytes(&mut challenge).map_err(|_| "Cannot generate challenge")?;
            self.challenge.clone_from(&challenge);
            Some(ByteBuf::from(challenge))
        } else {
            None
        };
        Ok(Hello {
            protocol: self.protocol,
            role: Cow::Borrowed(self.role),
            challenge,
        })
    }

    fn refuse(&mut self, reason: String) -> HelloReply {
        self.refusal = Some(reason.clone());
        HelloReply::Refused { reason }
    }

    pub fn answer(&mut self, hello: Hello) -> crate::Result<HelloReply> {
        if hello.protocol != self.protocol {
            return Ok(self.refuse(format!(
                "Protocol version mismatch, local {}, remote {}",
                self.protocol, hello.protocol
            )));
        }
        if hello.role != self.peer_role {
            return Ok(self.refuse(format!(
                "Peer introduced itself as {}, expected {}",
                hello.role, self.peer_role
            )));
        }
        let (challenge, key) = match (hello.challenge, &self.key) {
            (None, None) => return Ok(HelloReply::Plain),
            (Some(_), None) => {
                return Ok(self.refuse("Peer requires an encrypted session".to_string()));
            }
            (None, Some(_)) => {
                return Ok(self.refuse("Peer offers only a plain session".to_string()));
            }
            (Some(challenge), Some(key)) => (challenge, key.clone()),
        };
        if challenge.len() != CHALLENGE_LENGTH {
            return Ok(self.refuse(format!("Challenge has {} bytes", challenge.len())));
        }

        let (mut sealer, nonce) = StreamSealer::new(&key).map_err(|_| "Cannot create sealer")?;
        let proof = sealer
            .seal_chunk(
                &proof_payload(self.role, self.protocol, &challenge),
                &StreamTag::Message,
            )
            .map_err(|_| "Cannot seal challenge")?;
        self.sealer = Some(sealer);
        Ok(HelloReply::Sealed {
            nonce: ByteBuf::from(nonce.as_ref().to_vec()),
            proof: ByteBuf::from(proof),
        })
    }

    pub fn complete(mut self, reply: HelloReply) -> crate::Result<SessionCiphers> {
        if let Some(reason) = self.refusal.take() {
            return Err(format!("Session refused locally: {reason}").into());
        }
        let opener = match (reply, &self.key) {
            (HelloReply::Refused { reason }, _) => {
                return Err(format!("Session refused by peer: {reason}").into());
            }
            (HelloReply::Plain, None) => None,
            (HelloReply::Sealed { nonce, proof }, Some(key)) => {
                let nonce = Nonce::from_slice(&nonce).map_err(|_| "Invalid session nonce")?;
                let mut opener =
                    StreamOpener::new(key, &nonce).map_err(|_| "Cannot create opener")?;
                let expected = proof_payload(self.peer_role, self.protocol, &self.challenge);
                match opener.open_chunk(&proof) {
                    Ok((opened, StreamTag::Message)) if opened == expected => {}
                    _ => return Err("Peer did not prove the session key".into()),
                }
                Some(opener)
            }
            _ => return Err("Unexpected handshake reply".into()),
        };
        log::debug!(
            "Session with {} established, encrypted: {}",
            self.peer_role,
            opener.is_some()
        );
        Ok(SessionCiphers {
            sealer: self.sealer,
            opener,
        })
    }
}

async fn send_message<T, M>(sink: &mut FrameSink<T>, message: &M) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite,
    M: Serialize,
{
    let data = encode(message)?;
    match timeout(HANDSHAKE_TIMEOUT, sink.send(Bytes::from(data))).await {
        Ok(result) => Ok(result?),
        Err(_) => Err("Handshake message could not be sent in time".into()),
    }
}

async fn receive_message<T, M>(source: &mut FrameSource<T>) -> crate::Result<M>
where
    T: AsyncRead + AsyncWrite,
    M: serde::de::DeserializeOwned,
{
    match timeout(HANDSHAKE_TIMEOUT, source.next()).await {
        Ok(Some(frame)) => decode(&frame?),
        Ok(None) => Err(SandboxError::from(
            "Connection closed during the session handshake",
        )),
        Err(_) => Err("Handshake message did not arrive in time".into()),
    }
}

/// Runs the handshake before any other frame is exchanged.
pub(crate) async fn negotiate<T: AsyncRead + AsyncWrite>(
    sink: &mut FrameSink<T>,
    source: &mut FrameSource<T>,
    mut handshake: Handshake,
) -> crate::Result<SessionCiphers> {
    let hello = handshake.hello()?;
    send_message(sink, &hello).await?;
    let peer_hello: Hello = receive_message(source).await?;
    let reply = handshake.answer(peer_hello)?;
    send_message(sink, &reply).await?;
    let peer_reply: HelloReply = receive_message(source).await?;
    handshake.complete(peer_reply)
}
