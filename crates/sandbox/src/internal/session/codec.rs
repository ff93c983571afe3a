use bincode::{DefaultOptions, Options};
use bytes::Bytes;
use orion::aead::streaming::{StreamOpener, StreamSealer, StreamTag};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use futures::stream::{SplitSink, SplitStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::internal::common::error::SandboxError;

pub(crate) type FramedStream<T> = Framed<T, LengthDelimitedCodec>;
pub(crate) type FrameSink<T> = SplitSink<FramedStream<T>, Bytes>;
pub(crate) type FrameSource<T> = SplitStream<FramedStream<T>>;

/// Little-endian length prefixed frames, capped at [`crate::MAX_FRAME_SIZE`].
pub(crate) fn frame_stream<T: AsyncRead + AsyncWrite>(stream: T) -> FramedStream<T> {
    LengthDelimitedCodec::builder()
        .little_endian()
        .max_frame_length(crate::MAX_FRAME_SIZE)
        .new_framed(stream)
}

fn bincode_options() -> impl Options {
    DefaultOptions::new()
        .with_limit(crate::MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> crate::Result<Vec<u8>> {
    bincode_options()
        .serialize(value)
        .map_err(|e| SandboxError::SerializationError(format!("Cannot encode message: {e}")))
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> crate::Result<T> {
    bincode_options()
        .deserialize(data)
        .map_err(|e| SandboxError::SerializationError(format!("Cannot decode message: {e}")))
}

/// Turns an encoded message into a frame, sealing it when a sealer is given.
pub(crate) fn seal_frame(sealer: Option<&mut StreamSealer>, data: Vec<u8>) -> crate::Result<Bytes> {
    let Some(sealer) = sealer else {
        return Ok(data.into());
    };
    let sealed = sealer
        .seal_chunk(&data, &StreamTag::Message)
        .map_err(|_| SandboxError::from("Cannot encrypt message"))?;
    Ok(sealed.into())
}

pub(crate) fn open_frame<T: DeserializeOwned>(
    opener: Option<&mut StreamOpener>,
    frame: &[u8],
) -> crate::Result<T> {
    let Some(opener) = opener else {
        return decode(frame);
    };
    match opener.open_chunk(frame) {
        Ok((data, StreamTag::Message)) => decode(&data),
        Ok(_) => Err("Encrypted frame carries an unexpected tag".into()),
        Err(_) => Err("Cannot decrypt message".into()),
    }
}
