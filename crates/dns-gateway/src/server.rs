use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::Instrument;

use dns_types::protocol::serialise::UDP_MESSAGE_MAX_LEN;
use dns_types::protocol::types::*;

use crate::audit::AuditEvent;
use crate::dispatch::Gateway;
use crate::metrics::*;

/// A serialised response, waiting to be sent.
struct Reply {
    peer: SocketAddr,
    octets: BytesMut,
    query_name: Option<DomainName>,
    truncated: bool,
    rcode: Rcode,
    received: Instant,
}

/// Answer queries on a UDP socket until it is closed.
///
/// Each datagram is handled in its own task.  The tasks send their
/// serialised responses back here, and this loop writes them to the
/// socket and emits the audit events.
pub async fn listen_udp(gateway: Arc<Gateway>, socket: UdpSocket, audit_tx: mpsc::Sender<AuditEvent>) {
    let (tx, mut rx) = mpsc::channel::<Reply>(32);
    let mut buf = vec![0u8; UDP_MESSAGE_MAX_LEN];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                let received = Instant::now();
                let bytes = BytesMut::from(&buf[..size]);
                let reply = tx.clone();
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Some(response) = gateway.handle_raw_message(bytes.as_ref()).await {
                        match response.to_octets_within(UDP_MESSAGE_MAX_LEN) {
                            Ok(octets) => {
                                // to_octets_within sets TC in the
                                // serialised header, not in `response`
                                let truncated = octets.len() >= 3 && octets[2] & HEADER_MASK_TC != 0;
                                let reply_message = Reply {
                                    peer,
                                    octets,
                                    query_name: response.questions.first().map(|q| q.name.clone()),
                                    truncated,
                                    rcode: response.header.rcode,
                                    received,
                                };
                                if let Err(error) = reply.send(reply_message).await {
                                    tracing::debug!(?error, "could not queue reply");
                                }
                            }
                            Err(error) => {
                                tracing::warn!(message = ?response, %error, "could not serialise response");
                            }
                        }
                    }
                }.instrument(tracing::error_span!("handle_request", %peer)));
            }

            Some(reply) = rx.recv() => {
                if let Err(error) = socket.send_to(&reply.octets, reply.peer).await {
                    tracing::debug!(peer = %reply.peer, ?error, "udp send error");
                    continue;
                }

                let tc = reply.truncated.to_string();
                let rcode = reply.rcode.to_string();
                DNS_RESPONSES_TOTAL
                    .with_label_values(&[tc.as_str(), rcode.as_str()])
                    .inc();
                DNS_RESPONSE_TIME_SECONDS
                    .with_label_values(&["udp"])
                    .observe(reply.received.elapsed().as_secs_f64());

                if let Some(query_name) = reply.query_name {
                    // a full or closed audit channel must not hold up responses
                    let _ = audit_tx.try_send(AuditEvent::now(query_name, reply.peer));
                }
            }
        }
    }
}
