use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_types::protocol::serialise::UDP_MESSAGE_MAX_LEN;
use dns_types::protocol::types::*;

use crate::util::net::{read_tcp_bytes, send_tcp_bytes};

/// Send a query to a remote nameserver and return its response.
///
/// The query goes over UDP first.  If the UDP response is truncated,
/// the query is repeated over TCP.  The response is checked with
/// `response_matches_request`, but its contents are otherwise not
/// validated.
///
/// Each exchange has the given timeout.
pub async fn query_nameserver(
    address: SocketAddr,
    request: &Message,
    timeout_duration: Duration,
) -> Result<Message, QueryError> {
    let serialised_request = request.to_octets().map_err(|_| QueryError::Serialise)?;

    let response = match timeout(
        timeout_duration,
        query_nameserver_udp(address, &serialised_request),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => return Err(QueryError::Timeout),
    };

    let response = if response.header.is_truncated {
        tracing::trace!("truncated response, retrying over TCP");
        match timeout(
            timeout_duration,
            query_nameserver_tcp(address, &serialised_request),
        )
        .await
        {
            Ok(res) => res?,
            Err(_) => return Err(QueryError::Timeout),
        }
    } else {
        response
    };

    if response_matches_request(request, &response) {
        Ok(response)
    } else {
        Err(QueryError::Mismatched)
    }
}

/// Timeout-less UDP exchange.
async fn query_nameserver_udp(
    address: SocketAddr,
    serialised_request: &[u8],
) -> Result<Message, QueryError> {
    if serialised_request.len() > UDP_MESSAGE_MAX_LEN {
        return Err(QueryError::Serialise);
    }

    let bind_address = if address.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };

    let sock = UdpSocket::bind(bind_address).await?;
    sock.connect(address).await?;
    sock.send(serialised_request).await?;

    let mut buf = vec![0u8; UDP_MESSAGE_MAX_LEN];
    let len = sock.recv(&mut buf).await?;
    Message::from_octets(&buf[..len]).map_err(|_| QueryError::Malformed)
}

/// Timeout-less TCP exchange.
async fn query_nameserver_tcp(
    address: SocketAddr,
    serialised_request: &[u8],
) -> Result<Message, QueryError> {
    let mut stream = TcpStream::connect(address).await?;
    send_tcp_bytes(&mut stream, serialised_request)
        .await
        .map_err(|_| QueryError::Network)?;
    let bytes = read_tcp_bytes(&mut stream)
        .await
        .map_err(|_| QueryError::Network)?;
    Message::from_octets(bytes.as_ref()).map_err(|_| QueryError::Malformed)
}

/// Very basic validation that a nameserver response matches a
/// message:
///
/// - Check the ID, opcode, and questions match the question.
///
/// - Check it is a response.
///
/// - Check it is not truncated.
///
/// The rcode is not checked: a name error is a meaningful answer.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id {
        return false;
    }
    if !response.header.is_response {
        return false;
    }
    if request.header.opcode != response.header.opcode {
        return false;
    }
    if response.header.is_truncated {
        return false;
    }
    if request.questions != response.questions {
        return false;
    }

    true
}

/// Why a nameserver query did not produce a usable response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QueryError {
    /// No response within the timeout.
    Timeout,

    /// The request could not be serialised, or is too big for UDP.
    Serialise,

    /// Sending or receiving failed.
    Network,

    /// The response could not be parsed.
    Malformed,

    /// The response is not for this request.
    Mismatched,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryError::Timeout => write!(f, "timed out"),
            QueryError::Serialise => write!(f, "could not serialise request"),
            QueryError::Network => write!(f, "network error"),
            QueryError::Malformed => write!(f, "malformed response"),
            QueryError::Mismatched => write!(f, "response does not match request"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<std::io::Error> for QueryError {
    fn from(_: std::io::Error) -> Self {
        QueryError::Network
    }
}
