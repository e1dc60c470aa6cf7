use std::fmt;

use dns_types::protocol::types::*;

/// The result of a name resolution attempt.
///
/// If this is a `Chain`, the caller should add a `CNAME` record to
/// its answer and repeat resolution for the target.  This may build
/// up a chain of `CNAME`s for some names.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResolutionOutcome {
    /// Records of the requested type at the requested name.  `ttl` is
    /// the smallest TTL of the records the data came from.
    Answer {
        records: Vec<RecordTypeWithData>,
        ttl: u32,
    },
    /// The name is an alias.
    Chain { target: DomainName },
    /// The name does not exist, or has no records of this type.
    Empty,
    /// Resolution could not be completed.
    Failure(ResolutionFailure),
}

impl ResolutionOutcome {
    /// Label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolutionOutcome::Answer { .. } => "answer",
            ResolutionOutcome::Chain { .. } => "chain",
            ResolutionOutcome::Empty => "empty",
            ResolutionOutcome::Failure(failure) => failure.as_str(),
        }
    }
}

/// Why resolution could not be completed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResolutionFailure {
    /// A nameserver did not answer in time, even after a retry.
    Timeout,

    /// A referral had no usable nameserver address.
    NoDelegation,

    /// Too many referrals were followed.
    HopLimit,

    /// The nameserver signalled an error.
    Upstream(Rcode),

    /// The nameserver could not be reached, or sent back something
    /// which is not a response to the query.
    BadResponse,
}

impl ResolutionFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionFailure::Timeout => "timeout",
            ResolutionFailure::NoDelegation => "no_delegation",
            ResolutionFailure::HopLimit => "hop_limit",
            ResolutionFailure::Upstream(_) => "upstream_error",
            ResolutionFailure::BadResponse => "bad_response",
        }
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolutionFailure::Timeout => write!(f, "timed out"),
            ResolutionFailure::NoDelegation => write!(f, "referral with no nameserver address"),
            ResolutionFailure::HopLimit => write!(f, "too many referrals"),
            ResolutionFailure::Upstream(rcode) => write!(f, "nameserver returned {rcode}"),
            ResolutionFailure::BadResponse => write!(f, "no usable response from nameserver"),
        }
    }
}

impl std::error::Error for ResolutionFailure {}

/// Turn an answer section into an outcome for the question:
///
/// - Records at the question name which match the question type are
///   an `Answer`.
///
/// - Otherwise, a `CNAME` at the question name is a `Chain`.
///
/// - Otherwise the answer is `Empty`.
///
/// Records at other names (eg, the rest of a `CNAME` chain which an
/// upstream nameserver has helpfully resolved) are ignored: the chain
/// is followed one link at a time by the caller.
pub fn outcome_from_answers(question: &Question, answers: &[ResourceRecord]) -> ResolutionOutcome {
    let mut records = Vec::with_capacity(answers.len());
    let mut ttl = u32::MAX;
    let mut cname = None;

    for rr in answers {
        if rr.name != question.name {
            continue;
        }

        if rr.rtype_with_data.matches(question.qtype) {
            records.push(rr.rtype_with_data.clone());
            ttl = ttl.min(rr.ttl);
        } else if let RecordTypeWithData::CNAME { cname: target } = &rr.rtype_with_data {
            cname.get_or_insert_with(|| target.clone());
        }
    }

    if !records.is_empty() {
        ResolutionOutcome::Answer { records, ttl }
    } else if let Some(target) = cname {
        ResolutionOutcome::Chain { target }
    } else {
        ResolutionOutcome::Empty
    }
}

/// Interpret the parts of a nameserver response which do not depend
/// on how the nameserver was found: the rcode and the answer section.
///
/// Returns `None` for a successful response with no answers, which is
/// either a referral or "no data", depending on the nameserver.
pub fn outcome_from_response(question: &Question, response: &Message) -> Option<ResolutionOutcome> {
    match response.header.rcode {
        Rcode::NoError => (),
        Rcode::NameError => return Some(ResolutionOutcome::Empty),
        rcode => return Some(ResolutionOutcome::Failure(ResolutionFailure::Upstream(rcode))),
    }

    if response.answers.is_empty() {
        None
    } else {
        Some(outcome_from_answers(question, &response.answers))
    }
}
