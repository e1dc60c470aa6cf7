use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use dns_gateway::audit::AuditEvent;
use dns_gateway::classifier::{
    encode_verdict, Classifier, ClassifierError, Label, TcpClassifier, Verdict,
};
use dns_gateway::dispatch::Gateway;
use dns_gateway::normalise::NormalisedDomain;
use dns_gateway::policy::PolicyStore;
use dns_gateway::server::listen_udp;
use dns_resolver::{ResolutionOutcome, Resolver};
use dns_types::protocol::types::test_util::*;
use dns_types::protocol::types::*;

/// Resolves from a fixed table, as if the whole internet were a
/// handful of names.
#[derive(Default)]
struct TableResolver {
    table: HashMap<DomainName, ResolutionOutcome>,
}

impl TableResolver {
    fn address(mut self, name: &str, address: Ipv4Addr) -> Self {
        self.table.insert(
            domain(name),
            ResolutionOutcome::Answer {
                records: vec![RecordTypeWithData::A { address }],
                ttl: 86400,
            },
        );
        self
    }

    fn addresses(mut self, name: &str, count: u8) -> Self {
        let records = (0..count)
            .map(|i| RecordTypeWithData::A {
                address: Ipv4Addr::new(10, 0, 0, i),
            })
            .collect();
        self.table.insert(
            domain(name),
            ResolutionOutcome::Answer { records, ttl: 60 },
        );
        self
    }

    fn alias(mut self, name: &str, target: &str) -> Self {
        self.table.insert(
            domain(name),
            ResolutionOutcome::Chain {
                target: domain(target),
            },
        );
        self
    }
}

#[async_trait]
impl Resolver for TableResolver {
    async fn resolve(&self, question: &Question) -> ResolutionOutcome {
        self.table
            .get(&question.name)
            .cloned()
            .unwrap_or(ResolutionOutcome::Empty)
    }
}

struct FixedClassifier(Label);

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _: &[u8]) -> Result<Verdict, ClassifierError> {
        Ok(Verdict {
            label: self.0,
            confidence: Some(0.9),
        })
    }
}

fn resolver() -> TableResolver {
    TableResolver::default()
        .address("good.example.", Ipv4Addr::new(93, 184, 216, 34))
        .address("evil.test.", Ipv4Addr::new(6, 6, 6, 6))
        .alias("unknown.example.", "alias.example.")
        .address("alias.example.", Ipv4Addr::new(5, 6, 7, 8))
        .alias("a.example.", "b.example.")
        .alias("b.example.", "a.example.")
        .alias("hidden.example.", "c2.evil.test.")
        .addresses("big.example.", 40)
}

fn policy() -> PolicyStore {
    PolicyStore::new(
        vec![NormalisedDomain::normalise("good.example")],
        vec![NormalisedDomain::normalise("evil.test")],
    )
}

fn gateway_with(classifier: Arc<dyn Classifier>) -> Gateway {
    Gateway::new(Arc::new(policy()), Arc::new(resolver()), classifier)
}

fn gateway(label: Label) -> Gateway {
    gateway_with(Arc::new(FixedClassifier(label)))
}

fn query_octets(id: u16, name: &str, rtype: RecordType) -> Vec<u8> {
    let mut query = Message::from_question(id, question(name, rtype));
    query.header.recursion_desired = true;
    query.to_octets().unwrap().to_vec()
}

async fn ask(gateway: &Gateway, name: &str, rtype: RecordType) -> Message {
    let octets = query_octets(4321, name, rtype);
    let response = gateway.handle_raw_message(&octets).await.unwrap();

    assert_eq!(4321, response.header.id);
    assert_eq!(vec![question(name, rtype)], response.questions);
    assert!(response.header.is_response);
    assert_eq!(Rcode::NoError, response.header.rcode);

    response
}

async fn unreachable_address() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
}

#[tokio::test]
async fn whitelisted_name_is_resolved() {
    let response = ask(&gateway(Label::Malicious), "good.example.", RecordType::A).await;

    assert_eq!(
        vec![a_record("good.example.", Ipv4Addr::new(93, 184, 216, 34))],
        response.answers
    );
    assert!(response.authorities.is_empty());
    assert!(response.additionals.is_empty());
}

#[tokio::test]
async fn blacklisted_name_is_sinkholed() {
    let response = ask(&gateway(Label::Benign), "evil.test.", RecordType::A).await;

    assert_eq!(
        vec![a_record("evil.test.", Ipv4Addr::UNSPECIFIED)],
        response.answers
    );
    assert!(response.authorities.is_empty());
    assert!(response.additionals.is_empty());
}

#[tokio::test]
async fn blacklisted_name_is_sinkholed_whatever_the_type() {
    let response = ask(&gateway(Label::Benign), "www.evil.test.", RecordType::MX).await;

    assert_eq!(
        vec![a_record("www.evil.test.", Ipv4Addr::UNSPECIFIED)],
        response.answers
    );
}

#[tokio::test]
async fn benign_cname_chain_is_followed() {
    let response = ask(&gateway(Label::Benign), "unknown.example.", RecordType::A).await;

    assert_eq!(
        vec![
            cname_record("unknown.example.", "alias.example."),
            a_record("alias.example.", Ipv4Addr::new(5, 6, 7, 8)),
        ],
        response.answers
    );
}

#[tokio::test]
async fn cname_cycle_is_bounded() {
    let response = ask(&gateway(Label::Benign), "a.example.", RecordType::A).await;

    assert_eq!(
        vec![
            cname_record("a.example.", "b.example."),
            cname_record("b.example.", "a.example."),
        ],
        response.answers
    );
}

#[tokio::test]
async fn blacklisted_cname_target_is_sinkholed() {
    let response = ask(&gateway(Label::Benign), "hidden.example.", RecordType::A).await;

    assert_eq!(
        vec![
            cname_record("hidden.example.", "c2.evil.test."),
            a_record("c2.evil.test.", Ipv4Addr::UNSPECIFIED),
        ],
        response.answers
    );
}

#[tokio::test]
async fn unresolvable_name_is_empty_answer() {
    let response = ask(&gateway(Label::Benign), "nowhere.example.", RecordType::A).await;

    assert!(response.answers.is_empty());
}

#[tokio::test]
async fn unreachable_classifier_fails_closed() {
    let classifier = TcpClassifier::new(unreachable_address().await, Duration::from_secs(1));
    let failing = gateway_with(Arc::new(classifier));
    let octets = query_octets(7, "tunnel.example.", RecordType::TXT);

    let failed_closed = failing.handle_raw_message(&octets).await.unwrap();

    let blacklisting = Gateway::new(
        Arc::new(PolicyStore::new(
            Vec::new(),
            vec![NormalisedDomain::normalise("tunnel.example")],
        )),
        Arc::new(resolver()),
        Arc::new(FixedClassifier(Label::Benign)),
    );
    let blacklisted = blacklisting.handle_raw_message(&octets).await.unwrap();

    assert_eq!(blacklisted, failed_closed);
    assert_eq!(
        vec![a_record("tunnel.example.", Ipv4Addr::UNSPECIFIED)],
        failed_closed.answers
    );
}

#[tokio::test]
async fn real_classifier_benign_verdict() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut query = String::new();
        stream.read_to_string(&mut query).await.unwrap();
        let label = if query == "unknown.example." {
            Label::Benign
        } else {
            Label::Malicious
        };
        let verdict = encode_verdict(&Verdict {
            label,
            confidence: None,
        });
        stream.write_all(&verdict).await.unwrap();
    });

    let gateway = gateway_with(Arc::new(TcpClassifier::new(address, Duration::from_secs(5))));
    let response = ask(&gateway, "unknown.example.", RecordType::A).await;

    assert_eq!(
        vec![
            cname_record("unknown.example.", "alias.example."),
            a_record("alias.example.", Ipv4Addr::new(5, 6, 7, 8)),
        ],
        response.answers
    );
}

#[tokio::test]
async fn malformed_requests_are_dropped() {
    let gateway = gateway(Label::Benign);

    assert_eq!(None, gateway.handle_raw_message(&[]).await);
    assert_eq!(None, gateway.handle_raw_message(&[0xff; 11]).await);

    // the question name is a pointer to itself
    let mut octets = query_octets(1, "good.example.", RecordType::A);
    octets.truncate(12);
    octets.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1]);
    assert_eq!(None, gateway.handle_raw_message(&octets).await);
}

/// A query for `qname`, given as raw wire octets, with type A.
fn raw_query(id: u16, qname: &[u8]) -> Vec<u8> {
    let mut octets = Vec::new();
    octets.extend_from_slice(&id.to_be_bytes());
    octets.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
    octets.extend_from_slice(qname);
    octets.extend_from_slice(&[0, 1, 0, 1]);
    octets
}

#[tokio::test]
async fn dotted_label_cannot_hide_blacklisted_domain() {
    let gateway = gateway(Label::Benign);
    let octets = raw_query(7, b"\x02x.\x04evil\x04test\x00");

    let response = gateway.handle_raw_message(&octets).await.unwrap();

    assert_eq!(7, response.header.id);
    assert_eq!(1, response.questions.len());
    assert_eq!(
        vec![ResourceRecord::new(
            response.questions[0].name.clone(),
            RecordTypeWithData::A {
                address: Ipv4Addr::UNSPECIFIED
            },
            300
        )],
        response.answers
    );
}

#[tokio::test]
async fn question_is_echoed_byte_for_byte() {
    let gateway = gateway(Label::Benign);
    let qname = b"\x04GoOd\x07ExAmPlE\x00";
    let octets = raw_query(9, qname);

    let response = gateway.handle_raw_message(&octets).await.unwrap();
    let response_octets = response.to_octets().unwrap();

    assert_eq!(
        vec![a_record("good.example.", Ipv4Addr::new(93, 184, 216, 34))],
        response.answers
    );
    assert_eq!(&octets[12..], &response_octets[12..octets.len()]);
}

#[tokio::test]
async fn unsupported_requests_are_answered() {
    let gateway = gateway(Label::Benign);

    let mut status = Message::from_question(11, question("good.example.", RecordType::A));
    status.header.opcode = Opcode::Status;
    let response = gateway
        .handle_raw_message(&status.to_octets().unwrap())
        .await
        .unwrap();
    assert_eq!(11, response.header.id);
    assert_eq!(status.questions, response.questions);
    assert_eq!(Rcode::NotImplemented, response.header.rcode);
    assert!(response.answers.is_empty());

    let mut two = Message::from_question(12, question("good.example.", RecordType::A));
    two.questions.push(question("evil.test.", RecordType::A));
    let response = gateway
        .handle_raw_message(&two.to_octets().unwrap())
        .await
        .unwrap();
    assert_eq!(12, response.header.id);
    assert_eq!(two.questions, response.questions);
    assert_eq!(Rcode::Refused, response.header.rcode);
    assert!(response.answers.is_empty());
}

#[tokio::test]
async fn udp_end_to_end() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_address = socket.local_addr().unwrap();
    let (audit_tx, mut audit_rx) = mpsc::channel::<AuditEvent>(8);
    tokio::spawn(listen_udp(
        Arc::new(gateway(Label::Benign)),
        socket,
        audit_tx,
    ));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_address = client.local_addr().unwrap();
    let mut buf = vec![0u8; 512];

    // an ordinary answer
    client
        .send_to(&query_octets(99, "good.example.", RecordType::A), server_address)
        .await
        .unwrap();
    let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Message::from_octets(&buf[..len]).unwrap();

    assert_eq!(99, response.header.id);
    assert_eq!(
        vec![a_record("good.example.", Ipv4Addr::new(93, 184, 216, 34))],
        response.answers
    );

    let event = tokio::time::timeout(Duration::from_secs(5), audit_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(domain("good.example."), event.query_name);
    assert_eq!(client_address, event.client);

    // an answer too big for a datagram
    client
        .send_to(&query_octets(100, "big.example.", RecordType::A), server_address)
        .await
        .unwrap();
    let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Message::from_octets(&buf[..len]).unwrap();

    assert_eq!(100, response.header.id);
    assert!(len <= 512);
    assert!(response.header.is_truncated);
    assert!(!response.answers.is_empty());
    assert!(response.answers.len() < 40);
}
