//! Wire format for the six frame types exchanged between a `Server` and a `Client`.
//!
//! A frame is a single UDP datagram: a 1-byte tag followed by the tag's fields in the
//! order declared below. Strings are length-prefixed with a 32-bit network-order count,
//! no terminator. This mirrors the framing of `examples/original_source/include/Networking/Socket.hpp`'s
//! `PacketType` enum and its `sf::Packet` string/nested-packet operators.

use std::io::{self, Cursor};

use byteorder::{BigEndian, NativeEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

pub const TAG_DATA: u8 = 0;
pub const TAG_CONNECTION_REQUEST: u8 = 1;
pub const TAG_CONNECTION_CLOSE: u8 = 2;
pub const TAG_CONNECTION_CONFIRM: u8 = 3;
pub const TAG_PASSWORD_REQUEST: u8 = 4;
pub const TAG_PASSWORD: u8 = 5;

/// One of the six typed messages this protocol exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    ConnectionRequest,
    ConnectionClose(String),
    ConnectionConfirm(u32),
    PasswordRequest,
    Password(String),
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Data(_) => TAG_DATA,
            Frame::ConnectionRequest => TAG_CONNECTION_REQUEST,
            Frame::ConnectionClose(_) => TAG_CONNECTION_CLOSE,
            Frame::ConnectionConfirm(_) => TAG_CONNECTION_CONFIRM,
            Frame::PasswordRequest => TAG_PASSWORD_REQUEST,
            Frame::Password(_) => TAG_PASSWORD,
        }
    }

    /// Serializes this frame into a single outgoing datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(5);
        buf.write_u8(self.tag()).expect("writing to a Vec never fails");
        match self {
            Frame::Data(payload) => buf.extend_from_slice(payload),
            Frame::ConnectionRequest | Frame::PasswordRequest => {}
            Frame::ConnectionClose(reason) => write_string(&mut buf, reason),
            Frame::ConnectionConfirm(id) => {
                buf.write_u32::<BigEndian>(*id).expect("writing to a Vec never fails")
            }
            Frame::Password(secret) => write_string(&mut buf, secret),
        }
        Bytes::from(buf)
    }
}

/// The result of attempting to parse a received datagram.
pub enum Decoded {
    Frame(Frame),
    /// Tag byte was unrecognized, or the body was too short/malformed for its tag.
    /// Carries whatever followed the tag byte, for a caller-supplied fallback handler.
    Unknown(Bytes),
}

/// Parses a single datagram. Never returns an error: malformed or unrecognized input is
/// reported as `Decoded::Unknown` rather than replayed or retried, per the framing contract.
pub fn decode(datagram: &[u8]) -> Decoded {
    if datagram.is_empty() {
        return Decoded::Unknown(Bytes::new());
    }
    let tag = datagram[0];
    let rest = &datagram[1..];
    match tag {
        TAG_DATA => Decoded::Frame(Frame::Data(Bytes::from(rest.to_vec()))),
        TAG_CONNECTION_REQUEST => Decoded::Frame(Frame::ConnectionRequest),
        TAG_PASSWORD_REQUEST => Decoded::Frame(Frame::PasswordRequest),
        TAG_CONNECTION_CLOSE => {
            if rest.is_empty() {
                Decoded::Frame(Frame::ConnectionClose("Unknown".to_string()))
            } else {
                let mut cur = Cursor::new(rest);
                match read_string(&mut cur) {
                    Ok(reason) => Decoded::Frame(Frame::ConnectionClose(reason)),
                    Err(_) => Decoded::Unknown(Bytes::from(rest.to_vec())),
                }
            }
        }
        TAG_CONNECTION_CONFIRM => {
            let mut cur = Cursor::new(rest);
            match cur.read_u32::<BigEndian>() {
                Ok(id) => Decoded::Frame(Frame::ConnectionConfirm(id)),
                Err(_) => Decoded::Unknown(Bytes::from(rest.to_vec())),
            }
        }
        TAG_PASSWORD => {
            let mut cur = Cursor::new(rest);
            match read_string(&mut cur) {
                Ok(secret) => Decoded::Frame(Frame::Password(secret)),
                Err(_) => Decoded::Unknown(Bytes::from(rest.to_vec())),
            }
        }
        _ => Decoded::Unknown(Bytes::from(rest.to_vec())),
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_u32::<BigEndian>(s.len() as u32)
        .expect("writing to a Vec never fails");
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(cur: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cur.read_u32::<BigEndian>()? as usize;
    let pos = cur.position() as usize;
    let data = cur.get_ref();
    if pos + len > data.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short string field"));
    }
    let s = String::from_utf8(data[pos..pos + len].to_vec())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    cur.set_position((pos + len) as u64);
    Ok(s)
}

/// Wraps one encoded packet inside another's payload: a machine-word size field (native
/// byte order, matching `size_t` on the side that produced it) followed by the raw bytes.
/// For callers building a `Data` frame whose payload is itself a nested protocol message.
pub fn encode_nested(buf: &mut Vec<u8>, inner: &[u8]) {
    buf.write_u64::<NativeEndian>(inner.len() as u64)
        .expect("writing to a Vec never fails");
    buf.extend_from_slice(inner);
}

/// Inverse of [`encode_nested`].
pub fn decode_nested(cur: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = cur.read_u64::<NativeEndian>()? as usize;
    let pos = cur.position() as usize;
    let data = cur.get_ref();
    if pos + len > data.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short nested packet"));
    }
    let out = data[pos..pos + len].to_vec();
    cur.set_position((pos + len) as u64);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn roundtrip(frame: Frame) {
        let encoded = frame.encode();
        match decode(&encoded) {
            Decoded::Frame(decoded) => assert_eq!(decoded, frame),
            Decoded::Unknown(_) => panic!("expected a known frame, got Unknown for {:?}", frame),
        }
    }

    #[test]
    fn round_trips_every_variant() {
        roundtrip(Frame::Data(Bytes::from_static(b"hello")));
        roundtrip(Frame::Data(Bytes::new()));
        roundtrip(Frame::ConnectionRequest);
        roundtrip(Frame::ConnectionClose("bye".to_string()));
        roundtrip(Frame::ConnectionConfirm(0x7f00_0001));
        roundtrip(Frame::PasswordRequest);
        roundtrip(Frame::Password("hunter2".to_string()));
    }

    #[test]
    fn empty_datagram_is_unknown() {
        assert_matches!(decode(&[]), Decoded::Unknown(_));
    }

    #[test]
    fn unrecognized_tag_is_unknown() {
        let datagram = [0xffu8, 1, 2, 3];
        match decode(&datagram) {
            Decoded::Unknown(rest) => assert_eq!(&rest[..], &[1, 2, 3]),
            Decoded::Frame(_) => panic!("expected Unknown"),
        }
    }

    #[test]
    fn truncated_connection_confirm_is_unknown() {
        let datagram = [TAG_CONNECTION_CONFIRM, 0, 0];
        assert_matches!(decode(&datagram), Decoded::Unknown(_));
    }

    #[test]
    fn truncated_string_is_unknown() {
        // claims a 100 byte reason but the datagram doesn't contain it
        let mut datagram = vec![TAG_CONNECTION_CLOSE];
        datagram.write_u32::<BigEndian>(100).unwrap();
        datagram.extend_from_slice(b"short");
        assert_matches!(decode(&datagram), Decoded::Unknown(_));
    }

    #[test]
    fn connection_close_with_no_body_defaults_to_unknown_reason() {
        let datagram = [TAG_CONNECTION_CLOSE];
        match decode(&datagram) {
            Decoded::Frame(Frame::ConnectionClose(reason)) => assert_eq!(reason, "Unknown"),
            other => panic!("expected a ConnectionClose frame, got {:?}", other.tag_for_test()),
        }
    }

    impl Decoded {
        fn tag_for_test(&self) -> Option<u8> {
            match self {
                Decoded::Frame(f) => Some(f.tag()),
                Decoded::Unknown(_) => None,
            }
        }
    }

    #[test]
    fn nested_packet_round_trips() {
        let inner = b"inner payload".to_vec();
        let mut buf = Vec::new();
        encode_nested(&mut buf, &inner);
        let mut cur = Cursor::new(&buf[..]);
        let decoded = decode_nested(&mut cur).unwrap();
        assert_eq!(decoded, inner);
    }
}
