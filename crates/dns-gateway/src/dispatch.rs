//! Decide how to answer a single request.

use std::sync::Arc;

use dns_resolver::Resolver;
use dns_types::protocol::types::*;

use crate::classifier::{classify_or_fail_closed, Classifier};
use crate::metrics::*;
use crate::normalise::normalise;
use crate::policy::{PolicyStore, PolicyVerdict};
use crate::synthesise::{resolve_answers, sinkhole};

/// Everything needed to answer a request.  Cheap to clone, and shared
/// between all request handlers.
#[derive(Clone)]
pub struct Gateway {
    pub policy: Arc<PolicyStore>,
    pub resolver: Arc<dyn Resolver>,
    pub classifier: Arc<dyn Classifier>,
}

impl Gateway {
    pub fn new(
        policy: Arc<PolicyStore>,
        resolver: Arc<dyn Resolver>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            policy,
            resolver,
            classifier,
        }
    }

    /// Decode a request and build its response.  Returns `None` if
    /// the request should be dropped: it cannot be decoded, or it is
    /// itself a response.
    ///
    /// Other queries which cannot be answered still get a response,
    /// echoing the id and questions: `NotImplemented` for an opcode
    /// other than a standard query, and `Refused` for anything but a
    /// single question.
    pub async fn handle_raw_message(&self, buf: &[u8]) -> Option<Message> {
        let query = match Message::from_octets(buf) {
            Ok(query) => query,
            Err(error) => {
                tracing::debug!(%error, "dropping malformed request");
                DNS_REQUESTS_DROPPED_TOTAL
                    .with_label_values(&[DROPPED_FOR_MALFORMED])
                    .inc();
                return None;
            }
        };

        if query.header.is_response {
            tracing::debug!(id = %query.header.id, "dropping response sent as a request");
            DNS_REQUESTS_DROPPED_TOTAL
                .with_label_values(&[DROPPED_FOR_NOT_A_QUERY])
                .inc();
            return None;
        }

        let refusal = if query.header.opcode != Opcode::Standard {
            Some((Rcode::NotImplemented, REFUSED_FOR_NONSTANDARD_OPCODE))
        } else if query.questions.len() != 1 {
            Some((Rcode::Refused, REFUSED_FOR_QUESTION_COUNT))
        } else {
            None
        };

        if let Some((rcode, reason)) = refusal {
            tracing::debug!(id = %query.header.id, %reason, %rcode, "refusing request");
            DNS_REQUESTS_REFUSED_TOTAL.with_label_values(&[reason]).inc();
            let mut response = query.make_response();
            response.header.rcode = rcode;
            return Some(response);
        }

        Some(self.build_response(query).await)
    }

    /// Answer a decoded standard query with a single question.  The
    /// response code is always `NoError`: a refused or failed lookup
    /// looks the same as a name with no records.
    pub async fn build_response(&self, query: Message) -> Message {
        let mut response = query.make_response();

        for question in &query.questions {
            let mut answers = self.answer_question(question).await;
            response.answers.append(&mut answers);
        }

        response
    }

    async fn answer_question(&self, question: &Question) -> Vec<ResourceRecord> {
        let domain = normalise(&question.name);
        let verdict = self.policy.lookup(&domain);

        let permitted = match verdict {
            PolicyVerdict::Whitelisted => true,
            PolicyVerdict::Blacklisted => false,
            PolicyVerdict::Unknown => {
                let query_name = question.name.to_dotted_octets();
                let verdict = classify_or_fail_closed(self.classifier.as_ref(), &query_name).await;
                tracing::debug!(%domain, label = %verdict.label.as_str(), confidence = ?verdict.confidence, "classified");
                POLICY_VERDICTS_TOTAL
                    .with_label_values(&[verdict.label.as_str()])
                    .inc();
                !verdict.is_malicious()
            }
        };

        if verdict != PolicyVerdict::Unknown {
            POLICY_VERDICTS_TOTAL
                .with_label_values(&[verdict.as_str()])
                .inc();
        }

        if permitted {
            resolve_answers(&self.policy, self.resolver.as_ref(), question).await
        } else {
            tracing::info!(%question, %domain, "sinkholing");
            vec![sinkhole(&question.name)]
        }
    }
}
