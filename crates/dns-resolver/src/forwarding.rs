use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Instrument;

use dns_types::protocol::types::*;

use crate::util::nameserver::{query_nameserver, QueryError};
use crate::util::types::*;
use crate::Resolver;

/// Forwarding DNS resolution.
///
/// Sends a recursive query to another nameserver and returns its
/// answer.  As this other nameserver can spoof any records it wants,
/// very little validation is done of its responses.
#[derive(Debug, Clone)]
pub struct ForwardingResolver {
    upstream: SocketAddr,
    timeout: Duration,
}

impl ForwardingResolver {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }
}

#[async_trait]
impl Resolver for ForwardingResolver {
    async fn resolve(&self, question: &Question) -> ResolutionOutcome {
        let mut request = Message::from_question(rand::random(), question.clone());
        request.header.recursion_desired = true;

        match query_nameserver(self.upstream, &request, self.timeout)
            .instrument(tracing::error_span!("query_nameserver", address = %self.upstream))
            .await
        {
            Ok(response) => {
                outcome_from_response(question, &response).unwrap_or(ResolutionOutcome::Empty)
            }
            Err(QueryError::Timeout) => {
                tracing::debug!("timed out");
                ResolutionOutcome::Failure(ResolutionFailure::Timeout)
            }
            Err(error) => {
                tracing::debug!(%error, "upstream query failed");
                ResolutionOutcome::Failure(ResolutionFailure::BadResponse)
            }
        }
    }
}
