//! sdtun - Socket over DNS tunnel client
//!
//! Reads a local byte stream (stdin/stdout or one bridged TCP connection)
//! and carries it across DNS queries to a cooperating far-end server.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use sdtun::{
    config::SessionConfig, forward, session, DnsCodec, DomainStrategy, ForwardMode,
    ProxyBridge, QueryStrategy, RecordType, ResolverDriver,
};

#[derive(Parser)]
#[command(name = "sdtun")]
#[command(version)]
#[command(about = "Socket over DNS tunnel client", long_about = None)]
#[command(after_help = "Example: sdtun -r 127.0.0.1 sshdns.a.example.com")]
struct Cli {
    /// Delay uplink queries to force full buffer reads (microseconds)
    #[arg(short = 'A', long = "alarm-delay", value_name = "USEC", default_value_t = sdtun::config::DEFAULT_DELAY_US)]
    delay: u64,

    /// Size of the uplink read buffer in bytes
    #[arg(short = 'B', long = "bufsz", value_name = "BYTES", default_value_t = sdtun::config::DEFAULT_BUFSZ)]
    bufsz: usize,

    /// Maximum backoff for polling the server
    #[arg(short = 'b', long = "maxbackoff", default_value_t = sdtun::config::DEFAULT_MAXBACKOFF)]
    maxbackoff: u32,

    /// Dynamically forward the session to host[:port]
    #[arg(short = 'D', long = "forward", value_name = "HOST[:PORT]")]
    forward: Option<String>,

    /// Print resolver debug output
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Number of small reads passed through without buffering (0 disables)
    #[arg(short = 'F', long = "fast-start", default_value_t = sdtun::config::DEFAULT_FASTSTART)]
    faststart: u32,

    /// Maximum number of polling query failures (0 = unlimited)
    #[arg(short = 'M', long = "maxpollfail", default_value_t = sdtun::config::DEFAULT_MAXPOLLFAIL)]
    maxpollfail: u32,

    /// Minimum time to sleep between nameserver queries (microseconds)
    #[arg(short = 'm', long = "sleep", value_name = "USEC", default_value_t = sdtun::config::DEFAULT_SLEEP_US)]
    sleep: u64,

    /// Strategy for shuffling domain names
    #[arg(short = 'n', long = "strategy", value_name = "roundrobin|random", value_parser = parse_strategy, default_value = "roundrobin")]
    strategy: DomainStrategy,

    /// Listen on a TCP port instead of using stdin/stdout
    #[arg(short = 'p', long = "proxy-port", default_value_t = 0)]
    proxy_port: u16,

    /// Number of retries for lookup
    #[arg(short = 'R', long = "retry", default_value_t = 2)]
    retry: u32,

    /// Nameserver address, or keyword: random, opendns, level3, speakeasy, google
    #[arg(short = 'r', long = "nameserver")]
    nameserver: Option<String>,

    /// Resolver strategy
    #[arg(short = 'S', long = "resolver-strategy", value_name = "rotate|blast", value_parser = parse_query_strategy, default_value = "rotate")]
    resolver_strategy: QueryStrategy,

    /// Forwarded session identifier
    #[arg(short = 's', long = "session", default_value_t = 0)]
    session: u8,

    /// Use TCP (0 = new connection for each request, 1 = pipeline requests)
    #[arg(short = 'T', long = "tcp", value_name = "0|1")]
    tcp: Option<u8>,

    /// DNS record type for downlink polling
    #[arg(short = 't', long = "record-type", value_name = "TXT|CNAME|NULL", value_parser = parse_record_type, default_value = "TXT")]
    record_type: RecordType,

    /// Print debug messages (repeat for more)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Resolver transmit timeout in seconds
    #[arg(short = 'x', long = "timeout", value_name = "SECS", default_value_t = 5)]
    timeout: u32,

    /// Domain names queries are issued under
    #[arg(required = true, value_name = "DOMAIN", num_args = 1..)]
    domains: Vec<String>,
}

fn parse_record_type(s: &str) -> Result<RecordType, String> {
    RecordType::parse(s).ok_or_else(|| format!("unknown record type: {} (use TXT, CNAME or NULL)", s))
}

fn parse_strategy(s: &str) -> Result<DomainStrategy, String> {
    DomainStrategy::parse(s)
        .ok_or_else(|| format!("unknown strategy: {} (use roundrobin or random)", s))
}

fn parse_query_strategy(s: &str) -> Result<QueryStrategy, String> {
    QueryStrategy::parse(s).ok_or_else(|| format!("unknown strategy: {} (use rotate or blast)", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    // Fatal startup work happens before the session splits: forward target
    // resolution, config validation, the proxy bridge.
    let forward = match &cli.forward {
        Some(spec) => forward::parse_forward(spec)
            .await
            .context("dynamic forward")?,
        None => ForwardMode::Static,
    };

    let config = SessionConfig {
        domains: cli.domains.clone(),
        strategy: cli.strategy,
        record_type: cli.record_type,
        bufsz: cli.bufsz,
        sleep_us: cli.sleep,
        delay_us: cli.delay,
        maxbackoff: cli.maxbackoff,
        maxpollfail: cli.maxpollfail,
        faststart: cli.faststart,
        forward,
        proxy_port: cli.proxy_port,
        session_id: rand::random::<u16>(),
        forward_session: cli.session,
    };
    config.validate()?;

    let servers = match &cli.nameserver {
        Some(spec) => ResolverDriver::parse_nameserver(spec)?,
        None => ResolverDriver::system_servers(),
    };
    let resolver = Arc::new(ResolverDriver::new(servers, cli.resolver_strategy)?);
    resolver.set_retransmit_timeout(cli.timeout);
    resolver.set_retry_count(cli.retry);
    if let Some(mode) = cli.tcp {
        resolver.set_pipelining(mode != 0);
    }
    resolver.set_debug(cli.debug);

    let codec = Arc::new(DnsCodec::new(&config, resolver)?);

    let (reader, writer): (
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
    ) = if config.proxy_port > 0 {
        let bridge = ProxyBridge::bind(config.proxy_port)?;
        let stream = bridge.accept_one().await?;
        let (read_half, write_half) = stream.into_split();
        (Box::new(read_half), Box::new(write_half))
    } else {
        (Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
    };

    tokio::select! {
        result = session::run(config, codec, reader, writer) => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}
