//! NUL-framed JSON packet codec.
//!
//! One packet per frame; frames are separated by a single 0x00 byte. Parse
//! failures are surfaced as values rather than stream errors so a read loop
//! can log the bad frame and keep reading. An unterminated trailing frame at
//! EOF decodes to "no packet", which is distinct from an error.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tokio_util::codec::Decoder;

/// The frame separator.
pub const FRAME_TERMINATOR: u8 = 0x00;

/// A frame that could not be parsed into a packet. The frame is consumed and
/// the connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("frame is not a valid packet: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize `packet` and append the frame terminator.
pub fn encode_packet<T: Serialize>(packet: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = serde_json::to_vec(packet)?;
    buf.push(FRAME_TERMINATOR);
    Ok(buf)
}

/// Decoder for one direction of a connection: `PacketCodec<Request>` on the
/// receiver, `PacketCodec<Response>` on the sender.
#[derive(Debug, Default)]
pub struct PacketCodec<T> {
    _packet: PhantomData<fn() -> T>,
}

impl<T> PacketCodec<T> {
    pub fn new() -> Self {
        PacketCodec {
            _packet: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for PacketCodec<T> {
    type Item = Result<T, CodecError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(end) = src.iter().position(|&b| b == FRAME_TERMINATOR) else {
            return Ok(None);
        };
        let frame = src.split_to(end);
        src.advance(1);
        Ok(Some(parse_frame(&frame)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                // Unterminated bytes at EOF are "no packet", not an error.
                src.clear();
                Ok(None)
            }
        }
    }
}

fn parse_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, CodecError> {
    let text = std::str::from_utf8(frame)?;
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, RequestType};
    use crate::response::{PacketType, ResultType};

    fn decode_all(codec: &mut PacketCodec<Request>, buf: &mut BytesMut) -> Vec<Result<Request, CodecError>> {
        let mut out = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn decodes_a_terminated_frame() {
        let mut codec = PacketCodec::<Request>::new();
        let mut buf = BytesMut::from(&b"{\"id\":0,\"type\":255}\x00"[..]);
        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().kind, RequestType::KeepAlive);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_the_terminator_across_split_reads() {
        let mut codec = PacketCodec::<Request>::new();
        let mut buf = BytesMut::from(&b"{\"id\":0,\"ty"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"pe\":255}\x00{\"id\":0,\"type\":240}\x00");
        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_ref().unwrap().kind, RequestType::Login);
    }

    #[test]
    fn bad_frame_is_an_item_not_a_stream_error() {
        let mut codec = PacketCodec::<Request>::new();
        let mut buf = BytesMut::from(&b"not json\x00{\"id\":0,\"type\":255}\x00"[..]);
        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        assert!(items[0].is_err());
        assert!(items[1].is_ok());
    }

    #[test]
    fn unknown_ordinal_is_a_codec_error() {
        let mut codec = PacketCodec::<Request>::new();
        let mut buf = BytesMut::from(&b"{\"id\":0,\"type\":9999}\x00"[..]);
        let items = decode_all(&mut codec, &mut buf);
        assert!(items[0].is_err());
    }

    #[test]
    fn unterminated_eof_is_no_packet() {
        let mut codec = PacketCodec::<Request>::new();
        let mut buf = BytesMut::from(&b"{\"id\":0,\"type\":255}"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_appends_the_terminator() {
        let request = Request::builder(RequestType::KeepAlive).build().unwrap();
        let bytes = encode_packet(&request).unwrap();
        assert_eq!(bytes.last(), Some(&FRAME_TERMINATOR));
        assert_eq!(bytes.iter().filter(|&&b| b == FRAME_TERMINATOR).count(), 1);
    }

    // The wire mapping is enum-by-ordinal and fragile against reordering;
    // these tests pin every value.

    #[test]
    fn request_type_ordinals_are_pinned() {
        let expected: [(RequestType, u16); 6] = [
            (RequestType::Start, 1),
            (RequestType::Stop, 2),
            (RequestType::RemoteFunctionResult, 0xD0),
            (RequestType::PlayerInfo, 0xE0),
            (RequestType::Login, 0xF0),
            (RequestType::KeepAlive, 0xFF),
        ];
        for (kind, ordinal) in expected {
            assert_eq!(u16::from(kind), ordinal);
            assert_eq!(RequestType::try_from(ordinal).unwrap(), kind);
        }
    }

    #[test]
    fn packet_type_ordinals_are_pinned() {
        let expected: [(PacketType, u16); 7] = [
            (PacketType::EffectResult, 0),
            (PacketType::EffectStatus, 1),
            (PacketType::RemoteFunction, 0xD0),
            (PacketType::Login, 0xF0),
            (PacketType::LoginSuccess, 0xF1),
            (PacketType::Disconnect, 0xF2),
            (PacketType::KeepAlive, 0xFF),
        ];
        for (packet, ordinal) in expected {
            assert_eq!(u16::from(packet), ordinal);
            assert_eq!(PacketType::try_from(ordinal).unwrap(), packet);
        }
    }

    #[test]
    fn result_type_ordinals_are_pinned() {
        let expected: [(ResultType, u8); 13] = [
            (ResultType::Success, 0),
            (ResultType::Failure, 1),
            (ResultType::Unavailable, 2),
            (ResultType::Retry, 3),
            (ResultType::Queue, 4),
            (ResultType::NotReady, 5),
            (ResultType::Paused, 6),
            (ResultType::Resumed, 7),
            (ResultType::Finished, 8),
            (ResultType::Visible, 0x80),
            (ResultType::NotVisible, 0x81),
            (ResultType::Selectable, 0x82),
            (ResultType::NotSelectable, 0x83),
        ];
        for (result, ordinal) in expected {
            assert_eq!(u8::from(result), ordinal);
            assert_eq!(ResultType::try_from(ordinal).unwrap(), result);
        }
    }
}
