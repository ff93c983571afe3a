use std::marker::PhantomData;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use orion::aead::streaming::{StreamOpener, StreamSealer};
use orion::kdf::SecretKey;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::internal::session::codec::{
    FrameSink, FrameSource, encode, frame_stream, open_frame, seal_frame,
};
use crate::internal::session::handshake::{Handshake, negotiate};

/// Framed, optionally encrypted, bidirectional message channel.
///
/// Encryption is negotiated during [`Connection::init`]. When a session key is
/// present, every message is sealed by default; the `*_as` variants let the
/// caller send or receive an individual frame in the clear. Both peers must make
/// the same choice for each frame, otherwise the stream ciphers desynchronise.
pub struct Connection<ReceiveMsg, SendMsg, T = TcpStream> {
    writer: FrameSink<T>,
    reader: FrameSource<T>,
    sealer: Option<StreamSealer>,
    opener: Option<StreamOpener>,
    _r: PhantomData<ReceiveMsg>,
    _s: PhantomData<SendMsg>,
}

impl<R: DeserializeOwned, S: Serialize> Connection<R, S, TcpStream> {
    pub async fn init(
        socket: TcpStream,
        protocol: u32,
        my_role: &'static str,
        peer_role: &'static str,
        key: Option<Arc<SecretKey>>,
    ) -> crate::Result<Self> {
        socket.set_nodelay(true)?;
        Self::init_stream(socket, protocol, my_role, peer_role, key).await
    }
}

impl<R: DeserializeOwned, S: Serialize, T: AsyncRead + AsyncWrite> Connection<R, S, T> {
    pub async fn init_stream(
        stream: T,
        protocol: u32,
        my_role: &'static str,
        peer_role: &'static str,
        key: Option<Arc<SecretKey>>,
    ) -> crate::Result<Self> {
        let (mut writer, mut reader) = frame_stream(stream).split();
        let handshake = Handshake::new(protocol, my_role, peer_role, key);
        let ciphers = negotiate(&mut writer, &mut reader, handshake).await?;

        Ok(Self {
            writer,
            reader,
            sealer: ciphers.sealer,
            opener: ciphers.opener,
            _r: Default::default(),
            _s: Default::default(),
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.sealer.is_some() && self.opener.is_some()
    }

    pub async fn send(&mut self, item: S) -> crate::Result<()> {
        self.send_as(item, true).await
    }

    /// Sends one message; `encrypt` is ignored when the session has no key.
    pub async fn send_as(&mut self, item: S, encrypt: bool) -> crate::Result<()> {
        let data = encode(&item)?;
        let sealer = if encrypt { self.sealer.as_mut() } else { None };
        let frame = seal_frame(sealer, data)?;
        self.writer.send(frame).await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Option<crate::Result<R>> {
        self.receive_as(true).await
    }

    pub async fn receive_as(&mut self, decrypt: bool) -> Option<crate::Result<R>> {
        let frame = self.reader.next().await?;
        let opener = if decrypt { self.opener.as_mut() } else { None };
        Some(
            frame
                .map_err(crate::Error::from)
                .and_then(|data| open_frame(opener, &data)),
        )
    }

    pub async fn send_and_receive(&mut self, item: S) -> crate::Result<R> {
        self.send(item).await?;
        self.expect_message().await
    }

    /// Receives the next message, treating a closed connection as an error.
    pub async fn expect_message(&mut self) -> crate::Result<R> {
        self.expect_message_as(true).await
    }

    pub async fn expect_message_as(&mut self, decrypt: bool) -> crate::Result<R> {
        match self.receive_as(decrypt).await {
            Some(msg) => msg,
            None => Err(crate::Error::GenericError(
                "Connection closed while a message was expected".into(),
            )),
        }
    }
}
