//! Reduce a query name to the registrable domain the policy lists are
//! keyed on.

use std::fmt;

use dns_types::protocol::types::{DomainName, Label};

/// A registrable domain: one label plus its public suffix, lower-case,
/// without the trailing dot.  Eg, `www.bbc.co.uk.` normalises to
/// `bbc.co.uk`.
///
/// Names which have no registrable domain (the root, a bare public
/// suffix, garbage) normalise to the empty domain, which is never in
/// any policy list.
///
/// A label which itself contains a `.` is rendered escaped, as `\.`,
/// so it can never be mistaken for two labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalisedDomain(String);

impl NormalisedDomain {
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Normalise a textual name, as found in a policy list.  A
    /// trailing dot and surrounding whitespace are ignored.
    pub fn normalise(raw: &str) -> Self {
        let trimmed = raw.trim().trim_end_matches('.');
        if trimmed.is_empty() {
            return Self::empty();
        }

        let mut labels = Vec::new();
        for chunk in trimmed.split('.') {
            match Label::try_from(chunk.as_bytes()) {
                Ok(label) if !label.is_empty() => labels.push(label.to_ascii_lowercase()),
                _ => return Self::empty(),
            }
        }

        Self::from_labels(&labels)
    }

    /// Normalise a name as it arrived on the wire, label by label.
    pub fn from_name(name: &DomainName) -> Self {
        let labels: Vec<Label> = name
            .labels
            .iter()
            .filter(|label| !label.is_empty())
            .map(Label::to_ascii_lowercase)
            .collect();

        Self::from_labels(&labels)
    }

    /// The registrable domain of some lower-case labels, not including
    /// the root.
    fn from_labels(labels: &[Label]) -> Self {
        // public suffix rules never have a `.` inside a label, so only
        // the trailing run of labels without one can be a suffix
        let plain = labels
            .iter()
            .rev()
            .take_while(|label| !label.octets().contains(&b'.'))
            .count();

        let suffix_len = if plain == 0 {
            1
        } else {
            let tail: Vec<&[u8]> = labels[labels.len() - plain..]
                .iter()
                .map(|label| &label.octets()[..])
                .collect();
            let tail = tail.join(&b'.');
            psl::suffix(&tail).map_or(1, |suffix| {
                suffix.as_bytes().split(|octet| *octet == b'.').count()
            })
        };

        if labels.len() <= suffix_len {
            return Self::empty();
        }

        let domain: Vec<String> = labels[labels.len() - suffix_len - 1..]
            .iter()
            .map(Label::to_string)
            .collect();
        Self(domain.join("."))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Normalise a query name.
pub fn normalise(name: &DomainName) -> NormalisedDomain {
    NormalisedDomain::from_name(name)
}

/// Normalise a textual name.
pub fn normalise_str(raw: &str) -> NormalisedDomain {
    NormalisedDomain::normalise(raw)
}

impl fmt::Display for NormalisedDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
