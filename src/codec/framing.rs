//! Length-prefixed frames carrying a type name and a payload.

use std::{io, net::SocketAddr, sync::Arc};

use thiserror::Error;
use tracing::error;

use crate::{
    buffer::Buffer,
    codec::message::{Message, MessagePtr, MessageRegistry},
    net::tcp::{NetworkHandler, TcpConnectionRef},
    piece::PiecePool,
};

pub const HEADER_LEN: usize = 4;
/// Smallest accepted `total_len`.
pub const MIN_MESSAGE_LEN: usize = 2 * HEADER_LEN + 2;
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame length {0} outside the accepted range")]
    InvalidLength(i32),
    #[error("type name length {0} is not positive")]
    InvalidNameLen(i32),
    #[error("no message type registered as {0:?}")]
    UnknownMessageType(String),
    #[error("payload parse failed: {0}")]
    Parse(#[source] io::Error),
}

impl CodecError {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecError::InvalidLength(_) => "InvalidLength",
            CodecError::InvalidNameLen(_) => "InvalidNameLen",
            CodecError::UnknownMessageType(_) => "UnknownMessageType",
            CodecError::Parse(_) => "ParseError",
        }
    }
}

/// Takes the next complete frame off the head of `buffer`.
///
/// `None` means more bytes are needed. An `InvalidLength` error leaves the
/// buffer untouched; every other error consumes the offending frame.
pub fn decode_frame(
    registry: &MessageRegistry,
    buffer: &mut Buffer,
) -> Option<Result<MessagePtr, CodecError>> {
    if buffer.len() < MIN_MESSAGE_LEN + HEADER_LEN {
        return None;
    }
    let total_len = buffer.peek_i32();
    if total_len < MIN_MESSAGE_LEN as i32 || total_len > MAX_MESSAGE_LEN as i32 {
        return Some(Err(CodecError::InvalidLength(total_len)));
    }
    let total_len = total_len as usize;
    if buffer.len() < HEADER_LEN + total_len {
        return None;
    }

    buffer.skip(HEADER_LEN);
    Some(parse_body(registry, buffer, total_len))
}

fn parse_body(
    registry: &MessageRegistry,
    buffer: &mut Buffer,
    total_len: usize,
) -> Result<MessagePtr, CodecError> {
    let name_len = buffer.read_i32();
    let body_len = total_len - HEADER_LEN;
    if name_len <= 0 {
        buffer.skip(body_len);
        return Err(CodecError::InvalidNameLen(name_len));
    }
    let name_len = name_len as usize;
    if name_len > body_len {
        buffer.skip(body_len);
        return Err(CodecError::Parse(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("type name length {name_len} exceeds the {body_len} byte frame body"),
        )));
    }
    let payload_len = body_len - name_len;

    let mut name = buffer.read_vec(name_len);
    if name.last() == Some(&0) {
        name.pop();
    }
    let type_name = String::from_utf8_lossy(&name).into_owned();
    let Some(mut message) = registry.create(&type_name) else {
        buffer.skip(payload_len);
        return Err(CodecError::UnknownMessageType(type_name));
    };

    let (decoded, unread) = {
        let mut input = buffer.input_view(payload_len);
        let decoded = message.decode(&mut input);
        (decoded, input.remaining())
    };
    buffer.skip(unread);
    decoded.map_err(CodecError::Parse)?;
    Ok(MessagePtr::from(message))
}

/// Serializes `message` into a fresh frame drawn from `pool`.
pub fn encode_frame(message: &dyn Message, pool: &PiecePool) -> io::Result<Buffer> {
    let type_name = message.type_name();
    let name_len = type_name.len() + 1;

    let mut frame = Buffer::new(pool);
    frame.reserve_prepend(HEADER_LEN);
    frame.write_i32(name_len as i32);
    frame.write(type_name.as_bytes());
    frame.write(&[0]);
    {
        let mut output = frame.output_view();
        message.encode(&mut output)?;
    }

    let total_len = frame.len();
    if total_len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{type_name} frame of {total_len} bytes exceeds {MAX_MESSAGE_LEN}"),
        ));
    }
    frame.prepend_i32(total_len as i32);
    Ok(frame)
}

/// Frames `message` and queues it on `conn`. Encoding failures are logged
/// and nothing is sent.
pub fn send_message(conn: &TcpConnectionRef, message: &dyn Message) {
    match encode_frame(message, conn.pool()) {
        Ok(mut frame) => conn.send_buffer(&mut frame),
        Err(e) => {
            error!(conn = %conn.id(), message = message.type_name(), error = %e, "message not sent");
        }
    }
}

/// Callbacks of a [`MessageCodec`], with decoded messages instead of bytes.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_connection(&self, conn: &TcpConnectionRef) {
        let _ = conn;
    }

    fn on_message(&self, conn: &TcpConnectionRef, message: MessagePtr);

    fn on_write_complete(&self, conn: &TcpConnectionRef) {
        let _ = conn;
    }

    fn on_connect_failed(&self, addr: SocketAddr, error: &io::Error) {
        let _ = (addr, error);
    }

    fn accept_peer(&self, peer: &SocketAddr) -> bool {
        let _ = peer;
        true
    }

    /// Called for every framing error. Logs and closes the connection unless
    /// overridden.
    fn on_codec_error(&self, conn: &TcpConnectionRef, error: CodecError) {
        error!(conn = %conn.id(), code = error.as_str(), error = %error, "codec error");
        if conn.is_connected() {
            conn.close();
        }
    }
}

impl<H: MessageHandler> MessageHandler for Arc<H> {
    fn on_connection(&self, conn: &TcpConnectionRef) {
        (**self).on_connection(conn)
    }

    fn on_message(&self, conn: &TcpConnectionRef, message: MessagePtr) {
        (**self).on_message(conn, message)
    }

    fn on_write_complete(&self, conn: &TcpConnectionRef) {
        (**self).on_write_complete(conn)
    }

    fn on_connect_failed(&self, addr: SocketAddr, error: &io::Error) {
        (**self).on_connect_failed(addr, error)
    }

    fn accept_peer(&self, peer: &SocketAddr) -> bool {
        (**self).accept_peer(peer)
    }

    fn on_codec_error(&self, conn: &TcpConnectionRef, error: CodecError) {
        (**self).on_codec_error(conn, error)
    }
}

/// Turns a byte stream into messages for a [`MessageHandler`].
pub struct MessageCodec<H> {
    registry: MessageRegistry,
    handler: H,
}

impl<H: MessageHandler> MessageCodec<H> {
    pub fn new(registry: MessageRegistry, handler: H) -> Self {
        Self { registry, handler }
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: MessageHandler> NetworkHandler for MessageCodec<H> {
    fn on_connection(&self, conn: &TcpConnectionRef) {
        self.handler.on_connection(conn);
    }

    fn on_message(&self, conn: &TcpConnectionRef, buffer: &mut Buffer) -> crate::error::Result<()> {
        while let Some(decoded) = decode_frame(&self.registry, buffer) {
            match decoded {
                Ok(message) => self.handler.on_message(conn, message),
                Err(e) => {
                    self.handler.on_codec_error(conn, e);
                    break;
                }
            }
        }
        Ok(())
    }

    fn on_write_complete(&self, conn: &TcpConnectionRef) {
        self.handler.on_write_complete(conn);
    }

    fn on_connect_failed(&self, addr: SocketAddr, error: &io::Error) {
        self.handler.on_connect_failed(addr, error);
    }

    fn accept_peer(&self, peer: &SocketAddr) -> bool {
        self.handler.accept_peer(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::{InputView, OutputView},
        codec::message::NamedMessage,
        piece::PIECE_CAPACITY,
    };
    use proptest::prelude::*;
    use std::io::{Read, Write};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Note {
        text: Vec<u8>,
    }

    impl Message for Note {
        fn type_name(&self) -> &'static str {
            Self::TYPE_NAME
        }

        fn encode(&self, output: &mut OutputView<'_>) -> io::Result<()> {
            output.write_all(&self.text)
        }

        fn decode(&mut self, input: &mut InputView<'_>) -> io::Result<()> {
            input.read_to_end(&mut self.text).map(|_| ())
        }
    }

    impl NamedMessage for Note {
        const TYPE_NAME: &'static str = "test.Note";
    }

    /// Reads a 2-byte length, then that many bytes; anything after is ignored.
    #[derive(Debug, Default)]
    struct Strict {
        body: Vec<u8>,
    }

    impl Message for Strict {
        fn type_name(&self) -> &'static str {
            Self::TYPE_NAME
        }

        fn encode(&self, output: &mut OutputView<'_>) -> io::Result<()> {
            output.write_all(&(self.body.len() as u16).to_be_bytes())?;
            output.write_all(&self.body)
        }

        fn decode(&mut self, input: &mut InputView<'_>) -> io::Result<()> {
            let mut len = [0u8; 2];
            input.read_exact(&mut len)?;
            self.body = vec![0; u16::from_be_bytes(len) as usize];
            input.read_exact(&mut self.body)
        }
    }

    impl NamedMessage for Strict {
        const TYPE_NAME: &'static str = "test.Strict";
    }

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register::<Note>().register::<Strict>();
        registry
    }

    fn note(text: &[u8]) -> Note {
        Note {
            text: text.to_vec(),
        }
    }

    fn frame_bytes(message: &dyn Message) -> Vec<u8> {
        encode_frame(message, &PiecePool::new()).unwrap().to_vec()
    }

    fn decoded_note(result: Option<Result<MessagePtr, CodecError>>) -> Note {
        let message = result.expect("frame complete").expect("frame valid");
        let note = message.into_any().downcast::<Note>().expect("a Note");
        (*note).clone()
    }

    #[test]
    fn test_frame_layout() {
        let bytes = frame_bytes(&note(b"hi"));
        let name = b"test.Note\0";
        let total = 4 + name.len() + 2;
        assert_eq!(&bytes[..4], &(total as i32).to_be_bytes());
        assert_eq!(&bytes[4..8], &(name.len() as i32).to_be_bytes());
        assert_eq!(&bytes[8..8 + name.len()], name);
        assert_eq!(&bytes[8 + name.len()..], b"hi");
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let pool = PiecePool::new();
        let bytes = frame_bytes(&note(b"payload"));
        let mut buffer = Buffer::new(&pool);
        buffer.write(&bytes[..bytes.len() - 1]);
        assert!(decode_frame(&registry(), &mut buffer).is_none());
        assert_eq!(buffer.len(), bytes.len() - 1);

        buffer.write(&bytes[bytes.len() - 1..]);
        assert_eq!(decoded_note(decode_frame(&registry(), &mut buffer)), note(b"payload"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_length_below_minimum_consumes_nothing() {
        let pool = PiecePool::new();
        let mut buffer = Buffer::new(&pool);
        buffer.write_i32(1);
        buffer.write(&[0u8; 16]);
        let err = decode_frame(&registry(), &mut buffer).unwrap().unwrap_err();
        assert!(matches!(err, CodecError::InvalidLength(1)));
        assert_eq!(err.as_str(), "InvalidLength");
        assert_eq!(buffer.len(), 20);
    }

    #[test]
    fn test_length_above_maximum_consumes_nothing() {
        let pool = PiecePool::new();
        let mut buffer = Buffer::new(&pool);
        buffer.write_i32(MAX_MESSAGE_LEN as i32 + 1);
        buffer.write(&[7u8; 32]);
        let err = decode_frame(&registry(), &mut buffer).unwrap().unwrap_err();
        assert!(matches!(err, CodecError::InvalidLength(_)));
        assert_eq!(buffer.len(), 36);
    }

    #[test]
    fn test_bad_name_length_skips_frame() {
        let pool = PiecePool::new();
        let mut buffer = Buffer::new(&pool);
        buffer.write_i32(12);
        buffer.write_i32(0);
        buffer.write(&[1u8; 8]);
        buffer.write(&frame_bytes(&note(b"next")));

        let err = decode_frame(&registry(), &mut buffer).unwrap().unwrap_err();
        assert!(matches!(err, CodecError::InvalidNameLen(0)));
        assert_eq!(decoded_note(decode_frame(&registry(), &mut buffer)), note(b"next"));
    }

    #[test]
    fn test_name_longer_than_frame_is_parse_error() {
        let pool = PiecePool::new();
        let mut buffer = Buffer::new(&pool);
        buffer.write_i32(12);
        buffer.write_i32(9);
        buffer.write(&[b'x'; 8]);
        buffer.write(&frame_bytes(&note(b"next")));

        let err = decode_frame(&registry(), &mut buffer).unwrap().unwrap_err();
        assert_eq!(err.as_str(), "ParseError");
        assert_eq!(decoded_note(decode_frame(&registry(), &mut buffer)), note(b"next"));
    }

    #[test]
    fn test_unknown_type_skips_frame() {
        let pool = PiecePool::new();
        let mut buffer = Buffer::new(&pool);
        let mut unknown = MessageRegistry::new();
        unknown.register::<Note>();
        buffer.write(&frame_bytes(&Strict { body: vec![3; 5] }));
        buffer.write(&frame_bytes(&note(b"after")));

        let err = decode_frame(&unknown, &mut buffer).unwrap().unwrap_err();
        match err {
            CodecError::UnknownMessageType(name) => assert_eq!(name, "test.Strict"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(decoded_note(decode_frame(&unknown, &mut buffer)), note(b"after"));
    }

    #[test]
    fn test_parse_error_skips_frame() {
        let pool = PiecePool::new();
        let mut buffer = Buffer::new(&pool);
        let name = b"test.Strict\0";
        // declares a 200 byte body but carries 3
        buffer.write_i32((4 + name.len() + 5) as i32);
        buffer.write_i32(name.len() as i32);
        buffer.write(name);
        buffer.write(&[0, 200, 1, 2, 3]);
        buffer.write(&frame_bytes(&note(b"ok")));

        let err = decode_frame(&registry(), &mut buffer).unwrap().unwrap_err();
        assert!(matches!(err, CodecError::Parse(_)));
        assert_eq!(err.as_str(), "ParseError");
        assert_eq!(decoded_note(decode_frame(&registry(), &mut buffer)), note(b"ok"));
    }

    #[test]
    fn test_unread_payload_is_skipped() {
        let pool = PiecePool::new();
        let mut buffer = Buffer::new(&pool);
        let mut bytes = frame_bytes(&Strict { body: b"abc".to_vec() });
        // trailing junk inside the frame
        bytes.extend_from_slice(b"zz");
        let total = (bytes.len() - HEADER_LEN) as i32;
        bytes[..4].copy_from_slice(&total.to_be_bytes());
        buffer.write(&bytes);
        buffer.write(&frame_bytes(&note(b"tail")));

        let message = decode_frame(&registry(), &mut buffer).unwrap().unwrap();
        let strict = message.into_any().downcast::<Strict>().unwrap();
        assert_eq!(strict.body, b"abc");
        assert_eq!(decoded_note(decode_frame(&registry(), &mut buffer)), note(b"tail"));
    }

    #[test]
    fn test_payload_spanning_pieces() {
        let text: Vec<u8> = (0..3 * PIECE_CAPACITY).map(|i| (i % 241) as u8).collect();
        let pool = PiecePool::new();
        let frame = encode_frame(&note(&text), &pool).unwrap();
        assert!(frame.piece_count() > 1);

        let mut buffer = Buffer::new(&pool);
        buffer.append(frame);
        assert_eq!(decoded_note(decode_frame(&registry(), &mut buffer)).text, text);
    }

    proptest! {
        #[test]
        fn prop_split_delivery_decodes_every_message(
            texts in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..8),
            cuts in proptest::collection::vec(1usize..64, 1..40),
        ) {
            let stream: Vec<u8> = texts.iter().flat_map(|t| frame_bytes(&note(t))).collect();
            let pool = PiecePool::new();
            let registry = registry();
            let mut buffer = Buffer::new(&pool);
            let mut decoded = Vec::new();

            let mut offset = 0;
            let mut cut = cuts.iter().cycle();
            while offset < stream.len() {
                let n = (*cut.next().unwrap()).min(stream.len() - offset);
                buffer.write(&stream[offset..offset + n]);
                offset += n;
                while let Some(result) = decode_frame(&registry, &mut buffer) {
                    decoded.push(decoded_note(Some(result)).text);
                }
            }

            prop_assert_eq!(decoded, texts);
            prop_assert!(buffer.is_empty());
        }
    }
}
