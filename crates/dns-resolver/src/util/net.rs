use bytes::BytesMut;
use std::fmt;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message is slightly different to a DNS UDP message: it
/// has a big-endian u16 prefix giving the total length of the
/// message.  This is redundant (since the header is fixed-size and
/// says how many fields there are, and the fields contain length
/// information), but it means the entire message can be read before
/// parsing begins.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, TcpError> {
    let expected = stream.read_u16().await.map_err(TcpError::IO)? as usize;
    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        if stream.read_buf(&mut bytes).await.map_err(TcpError::IO)? == 0 {
            return Err(TcpError::TooShort {
                expected,
                actual: bytes.len(),
            });
        }
    }
    bytes.truncate(expected);
    Ok(bytes)
}

/// Write a serialised message to a TCP stream, with its two-octet
/// length prefix.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), TcpError> {
    let len = u16::try_from(bytes.len()).map_err(|_| TcpError::TooLong {
        actual: bytes.len(),
    })?;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(TcpError::IO)?;
    stream.write_all(bytes).await.map_err(TcpError::IO)?;

    Ok(())
}

/// An error that can occur when exchanging a DNS message over TCP.
#[derive(Debug)]
pub enum TcpError {
    TooShort { expected: usize, actual: usize },
    TooLong { actual: usize },
    IO(io::Error),
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpError::TooShort { expected, actual } => {
                write!(f, "expected {expected} octets but stream ended after {actual}")
            }
            TcpError::TooLong { actual } => {
                write!(f, "message of {actual} octets is too long for TCP")
            }
            TcpError::IO(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for TcpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TcpError::IO(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn tcp_bytes_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let bytes = read_tcp_bytes(&mut stream).await.unwrap();
            send_tcp_bytes(&mut stream, &bytes).await.unwrap();
        });

        let mut stream = TcpStream::connect(address).await.unwrap();
        send_tcp_bytes(&mut stream, b"hello world").await.unwrap();
        let echoed = read_tcp_bytes(&mut stream).await.unwrap();

        assert_eq!(&b"hello world"[..], &echoed[..]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_tcp_bytes_short_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0, 10, 1, 2, 3]).await.unwrap();
        });

        let mut stream = TcpStream::connect(address).await.unwrap();
        server.await.unwrap();

        assert!(matches!(
            read_tcp_bytes(&mut stream).await,
            Err(TcpError::TooShort {
                expected: 10,
                actual: 3
            })
        ));
    }
}
