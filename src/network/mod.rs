//! Broker transport.
//!
//! - [`Connection`]: one TCP connection with pipelined, FIFO-matched requests
//! - [`Broker`]: a broker node that owns (and transparently replaces) its connection
//!
//! Frames on the wire are an i32 size followed by that many bytes.

mod broker;
mod connection;

pub use broker::Broker;
pub use connection::Connection;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::DEFAULT_MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};

/// Reads one size-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
    let size = match reader.read_i32().await {
        Ok(size) => size,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if size < 0 {
        return Err(Error::Encoding(format!(
            "Invalid negative message size: {}",
            size
        )));
    }
    let size = size as usize;
    if size > DEFAULT_MAX_MESSAGE_SIZE {
        return Err(Error::Encoding(format!(
            "Message size {} exceeds maximum allowed size {}",
            size, DEFAULT_MAX_MESSAGE_SIZE
        )));
    }

    let mut data = BytesMut::zeroed(size);
    reader.read_exact(&mut data).await?;
    Ok(Some(data.freeze()))
}

/// Writes an already size-prefixed frame and flushes it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &[0, 0, 0, 3, b'a', b'b', b'c'])
            .await
            .unwrap();
        drop(client);

        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"abc");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_negative_size() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &(-5i32).to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(Error::Encoding(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_truncated_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(Error::Network(std::io::ErrorKind::UnexpectedEof))
        ));
    }
}
