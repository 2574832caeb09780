//! Length-delimited CBOR framing for hub streams.
//!
//! Every frame on the wire has the shape:
//!
//! ```text
//! ┌─────────────┬───────────┬────────────────────┐
//! │ total_len   │  flags    │       payload      │
//! │   (4 bytes) │  (1 byte) │  (variable length) │
//! └─────────────┴───────────┴────────────────────┘
//! ```
//!
//! - **`total_len`** (u32, big-endian): length of `flags + payload`
//! - **`flags`** (u8): `0x00` = raw CBOR, `0x01` = Zstd-compressed CBOR
//! - **`payload`**: the CBOR record, compressed when the serialized form
//!   exceeds [`COMPRESS_THRESHOLD`]
//!
//! The decoder enforces [`MAX_FRAME`] to keep a misbehaving peer from
//! forcing unbounded allocation; an oversized or malformed frame is fatal
//! to that connection only.

use std::io::Write;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::HubError;
use crate::wire::Message;
use crate::wire::files::FileFrame;

/// Minimum serialized size before Zstd compression is applied. Below this
/// the CPU cost outweighs the savings.
const COMPRESS_THRESHOLD: usize = 1024;

/// Zstd level 3: fast enough for per-message compression.
const COMPRESS_LEVEL: i32 = 3;

/// Hard cap on a single frame.
pub const MAX_FRAME: usize = 8 * 1024 * 1024;

/// Scratch buffers above this capacity are shrunk back after a frame, so a
/// rare huge message does not pin its allocation forever.
const RETAINED_CAPACITY: usize = 64 * 1024;

/// Codec for [`Message`] frames on hub streams.
pub type MessageCodec = FrameCodec<Message>;

/// Codec for the file-transfer listener.
pub type FileCodec = FrameCodec<FileFrame>;

/// Encoder + decoder for any serde record using the frame layout above.
pub struct FrameCodec<T> {
    /// Reused CBOR serialization buffer.
    scratch: Vec<u8>,
    /// Reused compression output buffer.
    compressed: Vec<u8>,
    _marker: PhantomData<T>,
}

impl<T> FrameCodec<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scratch: Vec::new(),
            compressed: Vec::new(),
            _marker: PhantomData,
        }
    }

    fn reset_buffers(&mut self) {
        self.scratch.shrink_to(RETAINED_CAPACITY);
        self.compressed.shrink_to(RETAINED_CAPACITY);
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = HubError;

    fn encode(
        &mut self,
        item: T,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        self.scratch.clear();
        self.compressed.clear();
        ciborium::into_writer(&item, &mut self.scratch)
            .map_err(|e| HubError::Frame(e.to_string()))?;

        let (payload, flags) = if self.scratch.len() > COMPRESS_THRESHOLD {
            let mut encoder =
                zstd::Encoder::new(&mut self.compressed, COMPRESS_LEVEL)?;
            encoder.write_all(&self.scratch)?;
            encoder.finish()?;
            (self.compressed.as_slice(), 1u8)
        } else {
            (self.scratch.as_slice(), 0u8)
        };

        let total_len = 1 + payload.len();
        dst.reserve(4 + total_len);
        dst.put_u32(total_len as u32);
        dst.put_u8(flags);
        dst.extend_from_slice(payload);

        self.reset_buffers();
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = HubError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        const LEN_PREFIX: usize = 4;
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        // Peek the length without consuming it yet.
        let total_len = u32::from_be_bytes(
            src[..LEN_PREFIX].try_into().expect("4 bytes available"),
        ) as usize;

        if total_len > MAX_FRAME {
            return Err(HubError::Frame(format!(
                "frame of {total_len} bytes exceeds the {MAX_FRAME} byte cap"
            )));
        }
        if total_len < 1 {
            return Err(HubError::Frame(
                "frame too short to hold a flags byte".into(),
            ));
        }

        if src.len() < LEN_PREFIX + total_len {
            src.reserve(LEN_PREFIX + total_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let flags = src.get_u8();
        let payload = src.split_to(total_len - 1);

        let item = match flags {
            1 => {
                let decoder = zstd::Decoder::new(payload.reader())?;
                ciborium::from_reader(decoder)
                    .map_err(|e| HubError::Frame(e.to_string()))?
            }
            0 => ciborium::from_reader(payload.reader())
                .map_err(|e| HubError::Frame(e.to_string()))?,
            unknown => {
                return Err(HubError::Frame(format!(
                    "unknown frame flags: {unknown}"
                )));
            }
        };

        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageType;

    fn roundtrip(msg: Message) -> Message {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn small_frame_round_trips_uncompressed() {
        let mut msg = Message::new(MessageType::Direct);
        msg.from = "a".into();
        msg.to = "b".into();
        msg.content = "hello".into();

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        // flags byte right after the length prefix
        assert_eq!(buf[4], 0);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.content, "hello");
        assert_eq!(decoded.kind, MessageType::Direct);
        assert!(buf.is_empty());
    }

    #[test]
    fn large_frame_is_compressed() {
        let mut msg = Message::new(MessageType::Request);
        msg.content = "x".repeat(16 * 1024);

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf[4], 1);
        // Compressible payload should come out well under the raw size.
        assert!(buf.len() < 8 * 1024);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.content, msg.content);
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut msg = Message::new(MessageType::Direct);
        msg.content = "partial".into();

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..buf.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&buf[buf.len() - 3..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.content, "partial");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME + 1) as u32);
        buf.put_u8(0);
        let mut codec = MessageCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(HubError::Frame(_))
        ));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(7);
        buf.put_u8(0);
        let mut codec = MessageCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(HubError::Frame(_))
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        for i in 0..3 {
            let mut msg = Message::new(MessageType::Direct);
            msg.content = format!("frame-{i}");
            codec.encode(msg, &mut buf).unwrap();
        }
        for i in 0..3 {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.content, format!("frame-{i}"));
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn metadata_round_trips() {
        let mut msg = Message::new(MessageType::Response);
        msg.metadata.insert("request_id".into(), "r1".into());
        msg.metadata.insert("status".into(), "success".into());
        let decoded = roundtrip(msg);
        assert_eq!(decoded.metadata["request_id"], "r1");
        assert_eq!(decoded.metadata["status"], "success");
    }
}
