use clap::Parser;
use std::process;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use dns_gateway::audit::{log_audit_events_task, AUDIT_CHANNEL_CAPACITY};
use dns_gateway::classifier::TcpClassifier;
use dns_gateway::dispatch::Gateway;
use dns_gateway::metrics::serve_prometheus_endpoint_task;
use dns_gateway::policy::PolicyStore;
use dns_gateway::server::listen_udp;
use dns_gateway::settings::{Args, GatewayConfig, LogFormat, ResolutionMode};
use dns_resolver::{ForwardingResolver, IterativeResolver, Resolver};

fn begin_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    begin_logging(args.log_format);

    let config = match GatewayConfig::try_from(args) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            process::exit(1);
        }
    };

    let policy = match PolicyStore::from_csv_files(&config.whitelist, &config.blacklist) {
        Ok(policy) => policy,
        Err(error) => {
            tracing::error!(%error, "could not load policy lists");
            process::exit(1);
        }
    };
    tracing::info!(
        whitelisted = %policy.whitelist_len(),
        blacklisted = %policy.blacklist_len(),
        "loaded policy lists"
    );

    let resolver: Arc<dyn Resolver> = match config.resolution {
        ResolutionMode::Iterative => {
            tracing::info!("resolving iteratively from the root nameservers");
            Arc::new(IterativeResolver::new(config.resolver_timeout))
        }
        ResolutionMode::Forwarding(upstream) => {
            tracing::info!(%upstream, "forwarding to upstream nameserver");
            Arc::new(ForwardingResolver::new(upstream, config.resolver_timeout))
        }
    };

    let classifier = Arc::new(TcpClassifier::new(
        config.classifier_address,
        config.classifier_timeout,
    ));

    let gateway = Arc::new(Gateway::new(Arc::new(policy), resolver, classifier));

    let (audit_tx, audit_rx) = mpsc::channel(AUDIT_CHANNEL_CAPACITY);
    tokio::spawn(log_audit_events_task(audit_rx));

    let metrics_address = config.metrics_address;
    tokio::spawn(async move {
        if let Err(error) = serve_prometheus_endpoint_task(metrics_address).await {
            tracing::error!(address = %metrics_address, ?error, "could not serve metrics");
        }
    });

    tracing::info!(address = %config.listen_address, "binding DNS UDP socket");
    let udp = match UdpSocket::bind(config.listen_address).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    listen_udp(gateway, udp, audit_tx).await;
}
