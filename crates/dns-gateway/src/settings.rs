//! Command-line configuration.

use clap::{Parser, ValueEnum};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Clone, Parser)]
/// A DNS gateway which enforces a domain policy.
///
/// Each query name is reduced to its registrable domain and checked
/// against a whitelist and a blacklist.  Blacklisted names are
/// answered with 0.0.0.0.  Names in neither list are sent to a
/// tunneling classifier, and are answered with 0.0.0.0 if it says they
/// are malicious or if it cannot be reached.  Everything else is
/// resolved, iteratively from the root nameservers or through an
/// upstream nameserver.
///
/// It only listens on UDP, and only queries upstream nameservers over
/// IPv4.
pub struct Args {
    /// Interface to listen on
    #[clap(short, long, env = "DNS_GATEWAY_INTERFACE", default_value_t = Ipv4Addr::UNSPECIFIED)]
    pub interface: Ipv4Addr,

    /// Port to listen on
    #[clap(short, long, env = "DNS_GATEWAY_PORT", default_value_t = 53)]
    pub port: u16,

    /// Path to the whitelist, a CSV file with a 'domain' column
    #[clap(short, long, env = "DNS_GATEWAY_WHITELIST")]
    pub whitelist: PathBuf,

    /// Path to the blacklist, a CSV file with a 'domain' column
    #[clap(short, long, env = "DNS_GATEWAY_BLACKLIST")]
    pub blacklist: PathBuf,

    /// Address of the tunneling classifier
    #[clap(short, long, env = "DNS_GATEWAY_CLASSIFIER_ADDRESS", default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, 5050)))]
    pub classifier_address: SocketAddr,

    /// Seconds to wait for the classifier before treating a name as malicious
    #[clap(long, env = "DNS_GATEWAY_CLASSIFIER_TIMEOUT", default_value_t = 5)]
    pub classifier_timeout: u64,

    /// Forward queries to this recursive nameserver, rather than
    /// resolving them from the root nameservers
    #[clap(short, long, env = "DNS_GATEWAY_FORWARD_ADDRESS")]
    pub forward_address: Option<SocketAddr>,

    /// Seconds to wait for each upstream nameserver
    #[clap(long, env = "DNS_GATEWAY_RESOLVER_TIMEOUT", default_value_t = 5)]
    pub resolver_timeout: u64,

    /// Address to serve Prometheus metrics on
    #[clap(short, long, env = "DNS_GATEWAY_METRICS_ADDRESS", default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, 9420)))]
    pub metrics_address: SocketAddr,

    /// Format of the log output
    #[clap(long, env = "DNS_GATEWAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Where resolvable names are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    Iterative,
    Forwarding(SocketAddr),
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub listen_address: SocketAddr,
    pub whitelist: PathBuf,
    pub blacklist: PathBuf,
    pub classifier_address: SocketAddr,
    pub classifier_timeout: Duration,
    pub resolution: ResolutionMode,
    pub resolver_timeout: Duration,
    pub metrics_address: SocketAddr,
    pub log_format: LogFormat,
}

impl TryFrom<Args> for GatewayConfig {
    type Error = SettingsError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.classifier_timeout == 0 {
            return Err(SettingsError::ZeroTimeout("classifier-timeout"));
        }
        if args.resolver_timeout == 0 {
            return Err(SettingsError::ZeroTimeout("resolver-timeout"));
        }

        let listen_address = SocketAddr::from((args.interface, args.port));

        let resolution = match args.forward_address {
            Some(upstream) if is_same_socket(listen_address, upstream) => {
                return Err(SettingsError::ForwardToSelf(upstream));
            }
            Some(upstream) => ResolutionMode::Forwarding(upstream),
            None => ResolutionMode::Iterative,
        };

        Ok(Self {
            listen_address,
            whitelist: args.whitelist,
            blacklist: args.blacklist,
            classifier_address: args.classifier_address,
            classifier_timeout: Duration::from_secs(args.classifier_timeout),
            resolution,
            resolver_timeout: Duration::from_secs(args.resolver_timeout),
            metrics_address: args.metrics_address,
            log_format: args.log_format,
        })
    }
}

/// Whether sending to `upstream` would reach the socket bound to
/// `listen`.
fn is_same_socket(listen: SocketAddr, upstream: SocketAddr) -> bool {
    if listen.port() != upstream.port() {
        return false;
    }

    listen.ip() == upstream.ip() || (listen.ip().is_unspecified() && upstream.ip().is_loopback())
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("--{0} must be at least 1 second")]
    ZeroTimeout(&'static str),

    #[error("--forward-address {0} is this gateway")]
    ForwardToSelf(SocketAddr),
}
