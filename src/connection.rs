use futures::StreamExt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use uuid::Uuid;

use crate::codec::TokenCodec;
use crate::server::SessionError;
use crate::token::{ProtocolError, Token};

pub struct Connection {
    pub id: Uuid,
    pub client_address: SocketAddr,
    // Data is read from the socket into the codec's buffer. When a token is parsed, the
    // corresponding data is removed from the buffer.
    reader: FramedRead<OwnedReadHalf, TokenCodec>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub fn new(stream: TcpStream, client_address: SocketAddr) -> Connection {
        Connection::with_codec(stream, client_address, Uuid::new_v4(), TokenCodec::default())
    }

    pub fn with_codec(
        stream: TcpStream,
        client_address: SocketAddr,
        id: Uuid,
        codec: TokenCodec,
    ) -> Connection {
        let (reader, writer) = stream.into_split();
        Connection {
            id,
            client_address,
            reader: FramedRead::new(reader, codec),
            writer,
        }
    }

    /// Reads the next token. `None` means the peer closed the connection cleanly, between two
    /// tokens.
    pub async fn read_token(&mut self) -> Result<Option<Token>, SessionError> {
        match self.reader.next().await {
            Some(Ok(token)) => Ok(Some(token)),
            Some(Err(ProtocolError::Io(err))) => Err(SessionError::Transport(err)),
            Some(Err(err)) => Err(SessionError::Protocol(err)),
            None => Ok(None),
        }
    }

    pub async fn write_token(&mut self, token: &Token) -> Result<(), SessionError> {
        let bytes = token.serialize()?;
        self.writer.write_all(&bytes).await?;
        Ok(())
    }
}
