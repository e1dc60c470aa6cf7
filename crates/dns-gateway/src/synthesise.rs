//! Turn policy decisions and resolution outcomes into answer records.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use dns_resolver::{ResolutionOutcome, Resolver};
use dns_types::protocol::types::*;

use crate::metrics::RESOLUTION_OUTCOMES_TOTAL;
use crate::normalise::normalise;
use crate::policy::{PolicyStore, PolicyVerdict};

/// Address blocked names resolve to.
pub const SINKHOLE_ADDRESS: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// TTL of every record the gateway sends, whatever the upstream TTL.
pub const SYNTHESISED_TTL: u32 = 300;

/// Maximum number of `CNAME` records in one answer.
pub const CHAIN_LIMIT: usize = 16;

/// The single record answering a blocked name, whatever the query
/// type.
pub fn sinkhole(name: &DomainName) -> ResourceRecord {
    ResourceRecord::new(
        name.clone(),
        RecordTypeWithData::A {
            address: SINKHOLE_ADDRESS,
        },
        SYNTHESISED_TTL,
    )
}

/// Whether answers for this question are looked up at all.  Other
/// questions get an empty answer section.
pub fn is_supported(question: &Question) -> bool {
    let supported_type = matches!(
        question.qtype,
        QueryType::Record(
            RecordType::A
                | RecordType::AAAA
                | RecordType::CNAME
                | RecordType::MX
                | RecordType::NS
                | RecordType::SOA
                | RecordType::TXT
                | RecordType::PTR
                | RecordType::SRV
        )
    );
    let supported_class = question.qclass == QueryClass::Record(RecordClass::IN);

    supported_type && supported_class
}

/// Owner the resolved data under `name`.
pub fn records_for(name: &DomainName, data: Vec<RecordTypeWithData>) -> Vec<ResourceRecord> {
    data.into_iter()
        .map(|rtype_with_data| ResourceRecord::new(name.clone(), rtype_with_data, SYNTHESISED_TTL))
        .collect()
}

/// Resolve a permitted question into its answer section.
///
/// `CNAME`s are followed: each alias adds a `CNAME` record and its
/// target is resolved in turn.  Each target is also checked against
/// the blacklist, and a blacklisted target ends the chain with a
/// sinkhole record for it.  The chain stops at the first repeated
/// name, or after `CHAIN_LIMIT` aliases.
///
/// Failures give whatever answers were collected so far, possibly
/// none.
pub async fn resolve_answers(
    policy: &PolicyStore,
    resolver: &dyn Resolver,
    question: &Question,
) -> Vec<ResourceRecord> {
    let mut answers = Vec::new();
    if !is_supported(question) {
        tracing::debug!(%question, "unsupported question, sending empty answer");
        return answers;
    }

    let mut visited = HashSet::from([question.name.clone()]);
    let mut current = question.clone();

    loop {
        let outcome = resolver.resolve(&current).await;
        RESOLUTION_OUTCOMES_TOTAL
            .with_label_values(&[outcome.kind()])
            .inc();

        match outcome {
            ResolutionOutcome::Answer { records, .. } => {
                answers.append(&mut records_for(&current.name, records));
                break;
            }
            ResolutionOutcome::Chain { target } => {
                answers.push(ResourceRecord::new(
                    current.name.clone(),
                    RecordTypeWithData::CNAME {
                        cname: target.clone(),
                    },
                    SYNTHESISED_TTL,
                ));

                if !visited.insert(target.clone()) {
                    tracing::debug!(%target, "CNAME cycle");
                    break;
                }
                if answers.len() >= CHAIN_LIMIT {
                    tracing::debug!(%target, "CNAME chain too long");
                    break;
                }
                if policy.lookup(&normalise(&target)) == PolicyVerdict::Blacklisted {
                    tracing::info!(%target, "CNAME target blacklisted, sinkholing");
                    answers.push(sinkhole(&target));
                    break;
                }

                current.name = target;
            }
            ResolutionOutcome::Empty => break,
            ResolutionOutcome::Failure(failure) => {
                tracing::debug!(name = %current.name, %failure, "resolution failed");
                break;
            }
        }
    }

    answers
}
