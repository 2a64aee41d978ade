use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio_util::codec::Decoder;

use crate::token::{ProtocolError, Token};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Decodes a byte stream into `Token`s, one complete RESP value at a time.
///
/// Top-level arrays, the shape of every client command, are decoded element by element: complete
/// elements are taken off the buffer as they arrive, so a large command is not parsed again from
/// its first byte each time more of it comes in.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    max_frame_size: usize,
    partial: Option<PartialArray>,
}

#[derive(Debug, Clone)]
struct PartialArray {
    items: Vec<Token>,
    remaining: usize,
    /// Bytes of this array already taken off the buffer.
    consumed: usize,
}

impl TokenCodec {
    pub fn new(max_frame_size: usize) -> TokenCodec {
        TokenCodec {
            max_frame_size,
            partial: None,
        }
    }

    fn decode_whole(&mut self, src: &mut BytesMut) -> Result<Option<Token>, ProtocolError> {
        let mut cursor = Cursor::new(&src[..]);
        let token = match Token::parse(&mut cursor) {
            Ok(token) => token,
            Err(ProtocolError::Incomplete) => return self.incomplete(src, 0),
            Err(err) => return Err(err),
        };

        let position = cursor.position() as usize;

        // Remove the parsed token from the buffer.
        src.advance(position);

        Ok(Some(token))
    }

    fn decode_elements(
        &mut self,
        mut partial: PartialArray,
        src: &mut BytesMut,
    ) -> Result<Option<Token>, ProtocolError> {
        while partial.remaining > 0 {
            let mut cursor = Cursor::new(&src[..]);
            match Token::parse_array_element(&mut cursor) {
                Ok(token) => {
                    let position = cursor.position() as usize;
                    src.advance(position);
                    partial.consumed += position;
                    partial.items.push(token);
                    partial.remaining -= 1;
                }
                Err(ProtocolError::Incomplete) => {
                    let consumed = partial.consumed;
                    self.partial = Some(partial);
                    return self.incomplete(src, consumed);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Some(Token::Array(partial.items)))
    }

    /// Refuse to keep buffering a single value past the limit.
    fn incomplete(&self, src: &BytesMut, consumed: usize) -> Result<Option<Token>, ProtocolError> {
        let size = consumed + src.len();
        if size >= self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(None)
    }
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for TokenCodec {
    type Item = Token;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(partial) = self.partial.take() {
            return self.decode_elements(partial, src);
        }

        let mut cursor = Cursor::new(&src[..]);
        let length = match Token::parse_array_header(&mut cursor) {
            Ok(Some(length)) => length,
            Ok(None) => return self.decode_whole(src),
            Err(ProtocolError::Incomplete) => return self.incomplete(src, 0),
            Err(err) => return Err(err),
        };

        let header = cursor.position() as usize;
        src.advance(header);

        let partial = PartialArray {
            // A peer can declare any count; only reserve what the buffer could possibly hold.
            items: Vec::with_capacity(length.min(src.len())),
            remaining: length,
            consumed: header,
        };
        self.decode_elements(partial, src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(token) => Ok(Some(token)),
            None => match self.partial.take() {
                Some(partial) => Err(ProtocolError::Truncated(partial.consumed + src.len())),
                None if src.is_empty() => Ok(None),
                None => Err(ProtocolError::Truncated(src.len())),
            },
        }
    }
}
