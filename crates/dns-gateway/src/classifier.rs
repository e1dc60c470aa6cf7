//! Client for the external tunneling classifier.
//!
//! The classifier speaks a one-shot stream protocol: connect, send the
//! query name as UTF-8, half-close, read the verdict, close.  A verdict
//! is:
//!
//! ```text
//!     +---------+-------+------------------------------+
//!     | version | label | confidence (optional)        |
//!     |   u8=1  |  u8   | f32, big-endian, 0.0 ..= 1.0 |
//!     +---------+-------+------------------------------+
//! ```
//!
//! where a label of 0 is benign and 1 is malicious.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::metrics::CLASSIFIER_FAILURES_TOTAL;

pub const VERDICT_VERSION: u8 = 1;

/// Longest response the classifier may send.
pub const MAX_RESPONSE_LEN: usize = 4096;

const LABEL_BENIGN: u8 = 0;
const LABEL_MALICIOUS: u8 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Label {
    Benign,
    Malicious,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Label::Benign => "benign",
            Label::Malicious => "malicious",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Verdict {
    pub label: Label,
    pub confidence: Option<f32>,
}

impl Verdict {
    /// The verdict used whenever the classifier cannot give one.
    pub fn fail_closed() -> Self {
        Self {
            label: Label::Malicious,
            confidence: None,
        }
    }

    pub fn is_malicious(&self) -> bool {
        self.label == Label::Malicious
    }
}

/// Parse a verdict.
///
/// # Errors
///
/// If the octets are not exactly a version 1 verdict.
pub fn decode_verdict(octets: &[u8]) -> Result<Verdict, MalformedVerdict> {
    let (version, label, rest) = match octets {
        [version, label, rest @ ..] => (*version, *label, rest),
        _ => return Err(MalformedVerdict::InvalidLength(octets.len())),
    };

    if version != VERDICT_VERSION {
        return Err(MalformedVerdict::UnsupportedVersion(version));
    }

    let label = match label {
        LABEL_BENIGN => Label::Benign,
        LABEL_MALICIOUS => Label::Malicious,
        other => return Err(MalformedVerdict::InvalidLabel(other)),
    };

    let confidence = match rest {
        [] => None,
        [a, b, c, d] => {
            let confidence = f32::from_be_bytes([*a, *b, *c, *d]);
            if !(0.0..=1.0).contains(&confidence) {
                return Err(MalformedVerdict::InvalidConfidence);
            }
            Some(confidence)
        }
        _ => return Err(MalformedVerdict::InvalidLength(octets.len())),
    };

    Ok(Verdict { label, confidence })
}

pub fn encode_verdict(verdict: &Verdict) -> Vec<u8> {
    let mut octets = Vec::with_capacity(6);
    octets.push(VERDICT_VERSION);
    octets.push(match verdict.label {
        Label::Benign => LABEL_BENIGN,
        Label::Malicious => LABEL_MALICIOUS,
    });
    if let Some(confidence) = verdict.confidence {
        octets.extend_from_slice(&confidence.to_be_bytes());
    }
    octets
}

/// Why a classifier response could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedVerdict {
    UnsupportedVersion(u8),
    InvalidLabel(u8),
    InvalidLength(usize),
    InvalidConfidence,
}

impl fmt::Display for MalformedVerdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MalformedVerdict::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            MalformedVerdict::InvalidLabel(l) => write!(f, "invalid label {l}"),
            MalformedVerdict::InvalidLength(n) => write!(f, "invalid length {n}"),
            MalformedVerdict::InvalidConfidence => write!(f, "confidence not in 0.0..=1.0"),
        }
    }
}

/// Why the classifier could not give a verdict.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("could not connect to classifier: {0}")]
    Connect(#[source] io::Error),

    #[error("could not send query to classifier: {0}")]
    Send(#[source] io::Error),

    #[error("could not receive verdict from classifier: {0}")]
    Receive(#[source] io::Error),

    #[error("classifier timed out")]
    Timeout,

    #[error("classifier closed the connection without a verdict")]
    EmptyResponse,

    #[error("classifier sent a malformed verdict: {0}")]
    Malformed(MalformedVerdict),
}

impl ClassifierError {
    /// Label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ClassifierError::Connect(_) => "connect",
            ClassifierError::Send(_) => "send",
            ClassifierError::Receive(_) => "receive",
            ClassifierError::Timeout => "timeout",
            ClassifierError::EmptyResponse => "empty_response",
            ClassifierError::Malformed(_) => "malformed",
        }
    }
}

/// Something which can decide whether a query looks like DNS
/// tunneling.
///
/// The query name is the label octets as received, joined with `.`,
/// so case and any non-ASCII octets reach the classifier unchanged.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, query_name: &[u8]) -> Result<Verdict, ClassifierError>;
}

/// Classify a name, treating any failure as malicious.
pub async fn classify_or_fail_closed(classifier: &dyn Classifier, query_name: &[u8]) -> Verdict {
    match classifier.classify(query_name).await {
        Ok(verdict) => verdict,
        Err(error) => {
            let query_name = String::from_utf8_lossy(query_name);
            tracing::warn!(%query_name, %error, "classifier failed, treating as malicious");
            CLASSIFIER_FAILURES_TOTAL
                .with_label_values(&[error.reason()])
                .inc();
            Verdict::fail_closed()
        }
    }
}

/// A classifier reached over TCP.  Each query opens a new connection.
#[derive(Debug, Clone)]
pub struct TcpClassifier {
    pub address: SocketAddr,
    pub timeout: Duration,
}

impl TcpClassifier {
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self { address, timeout }
    }

    async fn exchange(&self, query_name: &[u8]) -> Result<Verdict, ClassifierError> {
        let mut stream = TcpStream::connect(self.address)
            .await
            .map_err(ClassifierError::Connect)?;

        stream
            .write_all(query_name)
            .await
            .map_err(ClassifierError::Send)?;
        stream.shutdown().await.map_err(ClassifierError::Send)?;

        let mut buf = vec![0u8; MAX_RESPONSE_LEN];
        let mut len = 0;
        while len < MAX_RESPONSE_LEN {
            let n = stream
                .read(&mut buf[len..])
                .await
                .map_err(ClassifierError::Receive)?;
            if n == 0 {
                break;
            }
            len += n;
        }

        if len == 0 {
            return Err(ClassifierError::EmptyResponse);
        }

        decode_verdict(&buf[..len]).map_err(ClassifierError::Malformed)
    }
}

#[async_trait]
impl Classifier for TcpClassifier {
    async fn classify(&self, query_name: &[u8]) -> Result<Verdict, ClassifierError> {
        match timeout(self.timeout, self.exchange(query_name)).await {
            Ok(res) => res,
            Err(_) => Err(ClassifierError::Timeout),
        }
    }
}
