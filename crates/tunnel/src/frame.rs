//! Wire framing: a fixed 5-byte big-endian header `{type, length, streamid}`
//! followed by `length` payload bytes. Control payloads (SYN, AUTH) are JSON;
//! RESULT and WND carry a big-endian u32; DATA and DNS carry raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::Error;

/// Fixed header size on the wire.
pub const HEADER_LEN: usize = 5;

/// Largest payload expressible by the u16 length field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Result = 1,
    Auth = 2,
    Data = 3,
    Syn = 4,
    Wnd = 5,
    Fin = 6,
    Rst = 7,
    Ping = 8,
    Dns = 9,
    Spam = 10,
}

impl FrameType {
    fn from_wire(byte: u8) -> Option<FrameType> {
        match byte {
            1 => Some(FrameType::Result),
            2 => Some(FrameType::Auth),
            3 => Some(FrameType::Data),
            4 => Some(FrameType::Syn),
            5 => Some(FrameType::Wnd),
            6 => Some(FrameType::Fin),
            7 => Some(FrameType::Rst),
            8 => Some(FrameType::Ping),
            9 => Some(FrameType::Dns),
            10 => Some(FrameType::Spam),
            _ => None,
        }
    }
}

/// Reply codes carried by RESULT frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Errno {
    None = 0,
    Auth = 1,
    IdExist = 2,
    ConnFailed = 3,
    Timeout = 4,
    Closed = 5,
    UnknownNetwork = 6,
}

impl Errno {
    pub fn from_wire(value: u32) -> Option<Errno> {
        match value {
            0 => Some(Errno::None),
            1 => Some(Errno::Auth),
            2 => Some(Errno::IdExist),
            3 => Some(Errno::ConnFailed),
            4 => Some(Errno::Timeout),
            5 => Some(Errno::Closed),
            6 => Some(Errno::UnknownNetwork),
            _ => None,
        }
    }
}

/// SYN payload: the stream's target descriptor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct Syn {
    #[serde(rename = "Network")]
    pub network: String,
    #[serde(rename = "Address")]
    pub address: String,
}

/// AUTH payload, the first frame a client sends on a fresh substrate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct Auth {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub streamid: u16,
    pub data: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, streamid: u16) -> Frame {
        Frame {
            frame_type,
            streamid,
            data: Bytes::new(),
        }
    }

    pub fn data(streamid: u16, payload: Bytes) -> Frame {
        Frame {
            frame_type: FrameType::Data,
            streamid,
            data: payload,
        }
    }

    pub fn syn(streamid: u16, syn: &Syn) -> Result<Frame, Error> {
        Ok(Frame {
            frame_type: FrameType::Syn,
            streamid,
            data: marshal_json(syn)?,
        })
    }

    pub fn auth(streamid: u16, auth: &Auth) -> Result<Frame, Error> {
        Ok(Frame {
            frame_type: FrameType::Auth,
            streamid,
            data: marshal_json(auth)?,
        })
    }

    pub fn result(streamid: u16, errno: Errno) -> Frame {
        Frame {
            frame_type: FrameType::Result,
            streamid,
            data: Bytes::copy_from_slice(&(errno as u32).to_be_bytes()),
        }
    }

    pub fn wnd(streamid: u16, bytes_freed: u32) -> Frame {
        Frame {
            frame_type: FrameType::Wnd,
            streamid,
            data: Bytes::copy_from_slice(&bytes_freed.to_be_bytes()),
        }
    }

    pub fn fin(streamid: u16) -> Frame {
        Frame::new(FrameType::Fin, streamid)
    }

    pub fn rst(streamid: u16) -> Frame {
        Frame::new(FrameType::Rst, streamid)
    }

    pub fn dns(streamid: u16, message: Bytes) -> Frame {
        Frame {
            frame_type: FrameType::Dns,
            streamid,
            data: message,
        }
    }

    pub fn decode_syn(&self) -> Result<Syn, Error> {
        serde_json::from_slice(&self.data).map_err(|err| Error::Payload("syn", err))
    }

    pub fn decode_auth(&self) -> Result<Auth, Error> {
        serde_json::from_slice(&self.data).map_err(|err| Error::Payload("auth", err))
    }

    /// Decode the u32 payload of a RESULT or WND frame.
    pub fn decode_u32(&self) -> Result<u32, Error> {
        let bytes: [u8; 4] = self
            .data
            .as_ref()
            .try_into()
            .map_err(|_| Error::UnexpectedFrame(self.frame_type))?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn decode_result(&self) -> Result<Errno, Error> {
        Errno::from_wire(self.decode_u32()?).ok_or(Error::UnexpectedFrame(self.frame_type))
    }

    /// Total on-wire size of this frame.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }
}

fn marshal_json<T: serde::Serialize>(value: &T) -> Result<Bytes, Error> {
    let data = serde_json::to_vec(value).map_err(|err| Error::Payload("control", err))?;
    if data.len() > MAX_PAYLOAD {
        return Err(Error::FrameOverflow);
    }
    Ok(data.into())
}

/// Codec for [`Frame`]s over any ordered byte stream.
///
/// Decoding is strict: a type byte outside the known range is a protocol
/// violation surfaced as `InvalidData`, which the fabric treats as fatal.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let frame_type = FrameType::from_wire(src[0]).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown frame type {}", src[0]),
            )
        })?;
        let streamid = u16::from_be_bytes([src[3], src[4]]);

        src.advance(HEADER_LEN);
        let data = src.split_to(length).freeze();

        Ok(Some(Frame {
            frame_type,
            streamid,
            data,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.data.len() > MAX_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "frame payload overflows the u16 length field",
            ));
        }
        dst.reserve(HEADER_LEN + frame.data.len());
        dst.put_u8(frame.frame_type as u8);
        dst.put_u16(frame.data.len() as u16);
        dst.put_u16(frame.streamid);
        dst.extend_from_slice(&frame.data);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        FrameCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Frame::data(0x0102, Bytes::from_static(b"hi")), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[3, 0, 2, 1, 2, b'h', b'i']);
    }

    #[test]
    fn test_partial_input_yields_none() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Frame::data(7, Bytes::from_static(b"abcdef")), &mut buf)
            .unwrap();

        let mut partial = BytesMut::from(&buf[..3]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&buf[..HEADER_LEN + 2]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_is_invalid_data() {
        let mut buf = BytesMut::from(&[42u8, 0, 0, 0, 1][..]);
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_syn_roundtrip_is_fixed_point() {
        let syn = Syn {
            network: "tcp".to_string(),
            address: "127.0.0.1:80".to_string(),
        };
        let decoded = roundtrip(Frame::syn(9, &syn).unwrap());
        assert_eq!(decoded.streamid, 9);
        assert_eq!(decoded.decode_syn().unwrap(), syn);
    }

    #[test]
    fn test_auth_field_names_match_wire_format() {
        let auth = Auth {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        let frame = Frame::auth(0, &auth).unwrap();
        let text = std::str::from_utf8(&frame.data).unwrap();
        assert!(text.contains("\"Username\""), "{text}");
        assert!(text.contains("\"Password\""), "{text}");
        assert_eq!(roundtrip(frame).decode_auth().unwrap(), auth);
    }

    #[test]
    fn test_result_and_wnd_are_be_u32() {
        let frame = Frame::result(1, Errno::ConnFailed);
        assert_eq!(&frame.data[..], &[0, 0, 0, 3]);
        assert_eq!(roundtrip(frame).decode_result().unwrap(), Errno::ConnFailed);

        let frame = Frame::wnd(1, 0x01020304);
        assert_eq!(&frame.data[..], &[1, 2, 3, 4]);
        assert_eq!(roundtrip(frame).decode_u32().unwrap(), 0x01020304);
    }

    #[test]
    fn test_max_payload_fits_one_frame() {
        let frame = Frame::data(1, Bytes::from(vec![0xa5; MAX_PAYLOAD]));
        let decoded = roundtrip(frame);
        assert_eq!(decoded.data.len(), MAX_PAYLOAD);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::data(1, Bytes::from(vec![0; MAX_PAYLOAD + 1]));
        let mut buf = BytesMut::new();
        let err = FrameCodec.encode(frame, &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
