use clap::Parser;
use std::fmt::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::process;
use std::time::Duration;

use dns_resolver::util::nameserver::query_nameserver;
use dns_types::protocol::types::{
    DomainName, Message, QueryClass, QueryType, Question, RecordClass, RecordType,
    RecordTypeWithData, ResourceRecord,
};

/// Seconds to wait for the nameserver.
const TIMEOUT: u64 = 5;

/// Render RDATA the way it would appear in a zone file.
fn format_rdata(rtype_with_data: &RecordTypeWithData) -> String {
    match rtype_with_data {
        RecordTypeWithData::A { address } => address.to_string(),
        RecordTypeWithData::AAAA { address } => address.to_string(),
        RecordTypeWithData::NS { nsdname } => nsdname.to_string(),
        RecordTypeWithData::CNAME { cname } => cname.to_string(),
        RecordTypeWithData::PTR { ptrdname } => ptrdname.to_string(),
        RecordTypeWithData::MX {
            preference,
            exchange,
        } => format!("{preference} {exchange}"),
        RecordTypeWithData::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => format!("{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}"),
        RecordTypeWithData::SRV {
            priority,
            weight,
            port,
            target,
        } => format!("{priority} {weight} {port} {target}"),
        RecordTypeWithData::TXT { octets } => format_character_strings(octets),
        RecordTypeWithData::Unknown { octets, .. } => {
            let mut out = format!("\\# {}", octets.len());
            if !octets.is_empty() {
                out.push(' ');
                for octet in octets.iter() {
                    let _ = write!(out, "{octet:02x}");
                }
            }
            out
        }
    }
}

/// Each length-prefixed string as a quoted string, non-printable
/// octets escaped.
fn format_character_strings(octets: &[u8]) -> String {
    let mut strings = Vec::new();
    let mut rest = octets;
    while let Some((len, tail)) = rest.split_first() {
        let len = usize::from(*len).min(tail.len());
        let (string, tail) = tail.split_at(len);
        let mut quoted = String::from("\"");
        for octet in string {
            match octet {
                b'"' | b'\\' => {
                    quoted.push('\\');
                    quoted.push(char::from(*octet));
                }
                0x20..=0x7e => quoted.push(char::from(*octet)),
                _ => {
                    let _ = write!(quoted, "\\{octet:03}");
                }
            }
        }
        quoted.push('"');
        strings.push(quoted);
        rest = tail;
    }
    strings.join(" ")
}

fn print_section(heading: &str, rrs: &[ResourceRecord]) {
    if rrs.is_empty() {
        return;
    }

    println!("\n;; {heading}");
    for rr in rrs {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            rr.name,
            rr.ttl,
            rr.rclass,
            rr.rtype_with_data.rtype(),
            format_rdata(&rr.rtype_with_data)
        );
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Parser)]
/// DNS lookup utility
///
/// Sends a single recursive query to a nameserver, such as a
/// dns-gateway, and prints the response.
struct Args {
    /// Domain name to resolve
    #[clap(value_parser)]
    domain: DomainName,

    /// Query type to resolve
    #[clap(default_value_t = QueryType::Record(RecordType::A), value_parser)]
    qtype: QueryType,

    /// Nameserver to query
    #[clap(short, long, default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, 53)), value_parser)]
    server: SocketAddr,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let question = Question {
        name: args.domain,
        qtype: args.qtype,
        qclass: QueryClass::Record(RecordClass::IN),
    };

    println!(";; QUESTION");
    println!("{}\t{}\t{}", question.name, question.qclass, question.qtype);

    let mut request = Message::from_question(rand::random(), question);
    request.header.recursion_desired = true;

    match query_nameserver(args.server, &request, Duration::from_secs(TIMEOUT)).await {
        Ok(response) => {
            println!("\n;; {} from {}", response.header.rcode, args.server);
            if response.answers.is_empty() {
                println!("\n;; ANSWER");
                println!("; no records");
            }
            print_section("ANSWER", &response.answers);
            print_section("AUTHORITY", &response.authorities);
            print_section("ADDITIONAL", &response.additionals);
        }
        Err(err) => {
            println!("\n;; ANSWER");
            println!("; {err}");
            process::exit(1);
        }
    }
}
