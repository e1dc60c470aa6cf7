use async_trait::async_trait;
use rand::seq::IndexedRandom;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::Instrument;

use dns_types::protocol::types::*;

use crate::util::nameserver::{query_nameserver, QueryError};
use crate::util::types::*;
use crate::Resolver;

/// Maximum number of nameservers queried for one question.  Real
/// delegation chains are much shorter than this.
pub const HOP_LIMIT: usize = 16;

/// The IPv4 addresses of the root nameservers, a.root-servers.net
/// to m.root-servers.net.
pub const ROOT_HINTS: [Ipv4Addr; 13] = [
    Ipv4Addr::new(198, 41, 0, 4),
    Ipv4Addr::new(170, 247, 170, 2),
    Ipv4Addr::new(192, 33, 4, 12),
    Ipv4Addr::new(199, 7, 91, 13),
    Ipv4Addr::new(192, 203, 230, 10),
    Ipv4Addr::new(192, 5, 5, 241),
    Ipv4Addr::new(192, 112, 36, 4),
    Ipv4Addr::new(198, 97, 190, 53),
    Ipv4Addr::new(192, 36, 148, 17),
    Ipv4Addr::new(192, 58, 128, 30),
    Ipv4Addr::new(193, 0, 14, 129),
    Ipv4Addr::new(199, 7, 83, 42),
    Ipv4Addr::new(202, 12, 27, 33),
];

/// Iterative DNS resolution.
///
/// Starting from a root nameserver, send a non-recursive query and
/// follow referrals until some nameserver gives an answer (or says
/// there is none).  Nothing is cached: every question walks down from
/// the root.
///
/// See section 5.3.3 of RFC 1034.
#[derive(Debug, Clone)]
pub struct IterativeResolver {
    root_hints: Vec<Ipv4Addr>,
    port: u16,
    hop_limit: usize,
    timeout: Duration,
}

impl IterativeResolver {
    pub fn new(timeout: Duration) -> Self {
        Self::with_root_hints(ROOT_HINTS.to_vec(), 53, timeout)
    }

    /// Use different root nameservers, all listening on `port`.
    /// Referred-to nameservers are also queried on `port`.
    pub fn with_root_hints(root_hints: Vec<Ipv4Addr>, port: u16, timeout: Duration) -> Self {
        Self {
            root_hints,
            port,
            hop_limit: HOP_LIMIT,
            timeout,
        }
    }

    /// Query one nameserver, retrying once if it does not respond in
    /// time.
    async fn query_with_retry(
        &self,
        address: Ipv4Addr,
        question: &Question,
    ) -> Result<Message, QueryError> {
        let address = SocketAddr::new(IpAddr::V4(address), self.port);
        let request = Message::from_question(rand::random(), question.clone());

        match query_nameserver(address, &request, self.timeout).await {
            Err(QueryError::Timeout) => {
                tracing::debug!("timed out, retrying");
                let request = Message::from_question(rand::random(), question.clone());
                query_nameserver(address, &request, self.timeout).await
            }
            res => res,
        }
    }
}

#[async_trait]
impl Resolver for IterativeResolver {
    async fn resolve(&self, question: &Question) -> ResolutionOutcome {
        let Some(mut address) = self.root_hints.choose(&mut rand::rng()).copied() else {
            return ResolutionOutcome::Failure(ResolutionFailure::NoDelegation);
        };
        let mut match_count = 0;

        for hop in 0..self.hop_limit {
            let response = match self
                .query_with_retry(address, question)
                .instrument(tracing::error_span!("query_nameserver", %address, %hop))
                .await
            {
                Ok(response) => response,
                Err(QueryError::Timeout) => {
                    return ResolutionOutcome::Failure(ResolutionFailure::Timeout)
                }
                Err(error) => {
                    tracing::debug!(%address, %error, "nameserver query failed");
                    return ResolutionOutcome::Failure(ResolutionFailure::BadResponse);
                }
            };

            match next_step(question, &response, match_count) {
                Step::Done(outcome) => return outcome,
                Step::Referral {
                    address: next,
                    match_count: next_match_count,
                } => {
                    tracing::trace!(%next, "following referral");
                    address = next;
                    match_count = next_match_count;
                }
            }
        }

        tracing::debug!(hop_limit = %self.hop_limit, "hit hop limit");
        ResolutionOutcome::Failure(ResolutionFailure::HopLimit)
    }
}

/// What to do after getting a response from a nameserver.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Step {
    Done(ResolutionOutcome),
    Referral { address: Ipv4Addr, match_count: usize },
}

/// Decide what to do with a (matching) nameserver response:
///
/// - An error rcode, or a non-empty answer section, ends resolution.
///
/// - An authoritative response with no answers means the name has no
///   records of this type.
///
/// - Otherwise this is a referral: pick the address of one of the
///   delegated nameservers from the additional section.  Prefer `NS`
///   records which are a closer match for the question name than the
///   current zone; if there are none, use any `A` record at all.
pub fn next_step(question: &Question, response: &Message, match_count: usize) -> Step {
    if let Some(outcome) = outcome_from_response(question, response) {
        return Step::Done(outcome);
    }

    if response.header.is_authoritative {
        return Step::Done(ResolutionOutcome::Empty);
    }

    let better = get_better_ns_names(&response.authorities, &question.name, match_count);
    if let Some((zone, ns_names)) = &better {
        if let Some(address) = get_glue(&response.additionals, |name| ns_names.contains(name)) {
            return Step::Referral {
                address,
                match_count: zone.labels.len(),
            };
        }
    }

    match get_glue(&response.additionals, |_| true) {
        Some(address) => Step::Referral {
            address,
            match_count,
        },
        None => Step::Done(ResolutionOutcome::Failure(ResolutionFailure::NoDelegation)),
    }
}

/// Given a set of RRs and a domain name we're looking for, look for
/// better matching NS RRs (by comparing the current match count).
/// Returns the new matching superdomain and the nameserver hostnames.
pub fn get_better_ns_names(
    rrs: &[ResourceRecord],
    target: &DomainName,
    current_match_count: usize,
) -> Option<(DomainName, HashSet<DomainName>)> {
    let mut ns_names = HashSet::new();
    let mut match_count = current_match_count;
    let mut match_name = None;

    for rr in rrs {
        if let RecordTypeWithData::NS { nsdname } = &rr.rtype_with_data {
            if target.is_subdomain_of(&rr.name) {
                match rr.name.labels.len().cmp(&match_count) {
                    Ordering::Greater => {
                        match_count = rr.name.labels.len();
                        match_name = Some(rr.name.clone());

                        ns_names.clear();
                        ns_names.insert(nsdname.clone());
                    }
                    Ordering::Equal if match_name.is_some() => {
                        ns_names.insert(nsdname.clone());
                    }
                    _ => (),
                }
            }
        }
    }

    match_name.map(|mn| (mn, ns_names))
}

/// The first `A` record whose owner satisfies the predicate.
fn get_glue<P: Fn(&DomainName) -> bool>(rrs: &[ResourceRecord], predicate: P) -> Option<Ipv4Addr> {
    rrs.iter().find_map(|rr| match &rr.rtype_with_data {
        RecordTypeWithData::A { address } if predicate(&rr.name) => Some(*address),
        _ => None,
    })
}
