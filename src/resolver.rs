//! Nameserver driver
//!
//! Carries raw DNS messages to the configured nameservers over UDP or TCP.
//! Two query strategies:
//!
//! - `rotate`: walk the server list in order, advancing to the next server
//!   whenever one fails or times out.
//! - `blast`: query every server concurrently and take the first answer.
//!
//! The retransmit timeout and retry count are adjustable at runtime; the
//! uplink worker raises the timeout as its backoff grows.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::TunnelError;

/// Standard DNS port
pub const NS_PORT: u16 = 53;

/// Well-known public resolvers selectable by keyword
const KEYWORD_SERVERS: &[(&str, &[IpAddr])] = &[
    (
        "opendns",
        &[
            IpAddr::V4(std::net::Ipv4Addr::new(208, 67, 222, 222)),
            IpAddr::V4(std::net::Ipv4Addr::new(208, 67, 220, 220)),
        ],
    ),
    (
        "level3",
        &[
            IpAddr::V4(std::net::Ipv4Addr::new(4, 2, 2, 1)),
            IpAddr::V4(std::net::Ipv4Addr::new(4, 2, 2, 2)),
        ],
    ),
    (
        "speakeasy",
        &[IpAddr::V4(std::net::Ipv4Addr::new(66, 93, 87, 2))],
    ),
    (
        "google",
        &[
            IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)),
            IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 4, 4)),
        ],
    ),
];

/// How queries are spread over the server list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    Rotate,
    Blast,
}

impl QueryStrategy {
    /// Parse a strategy name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rotate" => Some(QueryStrategy::Rotate),
            "blast" => Some(QueryStrategy::Blast),
            _ => None,
        }
    }
}

/// Adjustable resolver options
#[derive(Debug, Clone)]
pub struct ResolverOpts {
    /// Per-attempt timeout in seconds
    pub retrans_secs: u32,
    /// Attempts per server before giving up
    pub retries: u32,
    /// Carry queries over TCP instead of UDP
    pub use_tcp: bool,
    /// Reuse one TCP connection across queries
    pub pipeline: bool,
    /// Log every exchange
    pub debug: bool,
}

impl Default for ResolverOpts {
    fn default() -> Self {
        Self {
            retrans_secs: 5,
            retries: 2,
            use_tcp: false,
            pipeline: false,
            debug: false,
        }
    }
}

/// Sends raw DNS messages to the configured nameservers.
pub struct ResolverDriver {
    servers: Vec<SocketAddr>,
    strategy: QueryStrategy,
    opts: RwLock<ResolverOpts>,
    current: AtomicUsize,
    /// Cached connection for pipelined TCP mode
    conn: tokio::sync::Mutex<Option<(SocketAddr, TcpStream)>>,
}

impl ResolverDriver {
    /// Create a driver over the given server list.
    ///
    /// # Errors
    ///
    /// Fails if the server list is empty.
    pub fn new(servers: Vec<SocketAddr>, strategy: QueryStrategy) -> Result<Self, TunnelError> {
        if servers.is_empty() {
            return Err(TunnelError::Resolver("no nameservers configured".into()));
        }
        Ok(Self {
            servers,
            strategy,
            opts: RwLock::new(ResolverOpts::default()),
            current: AtomicUsize::new(0),
            conn: tokio::sync::Mutex::new(None),
        })
    }

    /// Parse a nameserver specification: an address, `address:port`, or one
    /// of the keywords `random`, `opendns`, `level3`, `speakeasy`, `google`.
    pub fn parse_nameserver(spec: &str) -> Result<Vec<SocketAddr>, TunnelError> {
        if let Ok(addr) = spec.parse::<SocketAddr>() {
            return Ok(vec![addr]);
        }
        if let Ok(ip) = spec.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, NS_PORT)]);
        }

        let keyword = spec.to_ascii_lowercase();
        if keyword == "random" {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            let (_, ips) = KEYWORD_SERVERS
                .choose(&mut rng)
                .expect("keyword table is non-empty");
            return Ok(ips.iter().map(|ip| SocketAddr::new(*ip, NS_PORT)).collect());
        }
        for (name, ips) in KEYWORD_SERVERS {
            if *name == keyword {
                return Ok(ips.iter().map(|ip| SocketAddr::new(*ip, NS_PORT)).collect());
            }
        }

        Err(TunnelError::Resolver(format!("invalid NS address: {}", spec)))
    }

    /// Nameservers from `/etc/resolv.conf`, falling back to a public
    /// resolver when none can be read.
    pub fn system_servers() -> Vec<SocketAddr> {
        let mut servers = Vec::new();
        if let Ok(contents) = std::fs::read_to_string("/etc/resolv.conf") {
            for line in contents.lines() {
                let mut parts = line.split_whitespace();
                if parts.next() == Some("nameserver") {
                    if let Some(ip) = parts.next().and_then(|s| s.parse::<IpAddr>().ok()) {
                        servers.push(SocketAddr::new(ip, NS_PORT));
                    }
                }
            }
        }
        if servers.is_empty() {
            servers.push(SocketAddr::new(
                IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)),
                NS_PORT,
            ));
        }
        servers
    }

    /// Set the per-attempt timeout in seconds (minimum 1).
    pub fn set_retransmit_timeout(&self, secs: u32) {
        self.opts.write().unwrap().retrans_secs = secs.max(1);
    }

    /// Set the number of attempts per server.
    pub fn set_retry_count(&self, retries: u32) {
        self.opts.write().unwrap().retries = retries.max(1);
    }

    /// Switch to TCP transport. `pipeline` reuses one connection across
    /// queries; otherwise each query opens a fresh connection.
    pub fn set_pipelining(&self, pipeline: bool) {
        let mut opts = self.opts.write().unwrap();
        opts.use_tcp = true;
        opts.pipeline = pipeline;
    }

    /// Log every exchange at debug level.
    pub fn set_debug(&self, debug: bool) {
        self.opts.write().unwrap().debug = debug;
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Send one DNS message and return the raw response.
    pub async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let opts = self.opts.read().unwrap().clone();
        match self.strategy {
            QueryStrategy::Rotate => self.exchange_rotate(query, &opts).await,
            QueryStrategy::Blast => self.exchange_blast(query, &opts).await,
        }
    }

    async fn exchange_rotate(
        &self,
        query: &[u8],
        opts: &ResolverOpts,
    ) -> Result<Vec<u8>, TunnelError> {
        let attempts = opts.retries.max(1) as usize * self.servers.len();
        let mut last = TunnelError::Timeout;

        for _ in 0..attempts {
            let server = self.servers[self.current.load(Ordering::Relaxed) % self.servers.len()];
            match self.query_one(server, query, opts).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!("nameserver {} failed: {}", server, e);
                    self.current.fetch_add(1, Ordering::Relaxed);
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn exchange_blast(
        &self,
        query: &[u8],
        opts: &ResolverOpts,
    ) -> Result<Vec<u8>, TunnelError> {
        let queries = self
            .servers
            .iter()
            .map(|server| Box::pin(self.query_one(*server, query, opts)))
            .collect::<Vec<_>>();

        match futures::future::select_ok(queries).await {
            Ok((response, _)) => Ok(response),
            Err(e) => Err(e),
        }
    }

    async fn query_one(
        &self,
        server: SocketAddr,
        query: &[u8],
        opts: &ResolverOpts,
    ) -> Result<Vec<u8>, TunnelError> {
        if opts.debug {
            debug!(
                "querying {} ({} bytes, {})",
                server,
                query.len(),
                if opts.use_tcp { "tcp" } else { "udp" }
            );
        }

        let deadline = Duration::from_secs(opts.retrans_secs.max(1) as u64);
        let result = if opts.use_tcp {
            timeout(deadline, self.query_tcp(server, query, opts.pipeline)).await
        } else {
            timeout(deadline, Self::query_udp(server, query)).await
        };

        result.map_err(|_| TunnelError::Timeout)?
    }

    async fn query_udp(server: SocketAddr, query: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let local: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; 4096];
        let n = socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn query_tcp(
        &self,
        server: SocketAddr,
        query: &[u8],
        pipeline: bool,
    ) -> Result<Vec<u8>, TunnelError> {
        if !pipeline {
            let mut stream = TcpStream::connect(server).await?;
            return Self::tcp_roundtrip(&mut stream, query).await;
        }

        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            Some((cached, stream)) if *cached == server => {
                match Self::tcp_roundtrip(stream, query).await {
                    Ok(response) => Ok(response),
                    Err(e) => {
                        // Drop the broken connection; the caller's retry
                        // reconnects.
                        *guard = None;
                        Err(e)
                    }
                }
            }
            _ => {
                let mut stream = TcpStream::connect(server).await?;
                let response = Self::tcp_roundtrip(&mut stream, query).await?;
                *guard = Some((server, stream));
                Ok(response)
            }
        }
    }

    /// Length-prefixed DNS-over-TCP exchange (RFC 1035 §4.2.2).
    async fn tcp_roundtrip(stream: &mut TcpStream, query: &[u8]) -> Result<Vec<u8>, TunnelError> {
        stream
            .write_all(&(query.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(query).await?;
        stream.flush().await?;

        let mut lenbuf = [0u8; 2];
        stream.read_exact(&mut lenbuf).await?;
        let len = u16::from_be_bytes(lenbuf) as usize;

        let mut response = vec![0u8; len];
        stream.read_exact(&mut response).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nameserver_address() {
        let servers = ResolverDriver::parse_nameserver("127.0.0.1").unwrap();
        assert_eq!(servers, vec!["127.0.0.1:53".parse().unwrap()]);

        let servers = ResolverDriver::parse_nameserver("127.0.0.1:5353").unwrap();
        assert_eq!(servers, vec!["127.0.0.1:5353".parse().unwrap()]);
    }

    #[test]
    fn test_parse_nameserver_keywords() {
        let google = ResolverDriver::parse_nameserver("google").unwrap();
        assert!(google.contains(&"8.8.8.8:53".parse().unwrap()));

        let opendns = ResolverDriver::parse_nameserver("OpenDNS").unwrap();
        assert!(!opendns.is_empty());

        // `random` picks one keyword entry from the table
        let random = ResolverDriver::parse_nameserver("random").unwrap();
        assert!(KEYWORD_SERVERS.iter().any(|(_, ips)| {
            ips.iter()
                .map(|ip| SocketAddr::new(*ip, NS_PORT))
                .collect::<Vec<_>>()
                == random
        }));
    }

    #[test]
    fn test_parse_nameserver_rejects_garbage() {
        assert!(ResolverDriver::parse_nameserver("not-a-server").is_err());
    }

    #[test]
    fn test_new_rejects_empty_list() {
        assert!(ResolverDriver::new(Vec::new(), QueryStrategy::Rotate).is_err());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(QueryStrategy::parse("rotate"), Some(QueryStrategy::Rotate));
        assert_eq!(QueryStrategy::parse("BLAST"), Some(QueryStrategy::Blast));
        assert_eq!(QueryStrategy::parse("spray"), None);
    }

    /// UDP responder that answers every packet with a fixed payload.
    async fn spawn_udp_responder(reply: &'static [u8]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((_, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let _ = socket.send_to(reply, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let server = spawn_udp_responder(b"answer").await;
        let driver = ResolverDriver::new(vec![server], QueryStrategy::Rotate).unwrap();

        let response = driver.exchange(b"query").await.unwrap();
        assert_eq!(response, b"answer");
    }

    #[tokio::test]
    async fn test_rotate_advances_past_dead_server() {
        // First server is bound but never answers; rotate must fail over.
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        let live = spawn_udp_responder(b"alive").await;

        let driver =
            ResolverDriver::new(vec![dead_addr, live], QueryStrategy::Rotate).unwrap();
        driver.set_retransmit_timeout(1);

        let response = driver.exchange(b"query").await.unwrap();
        assert_eq!(response, b"alive");
        drop(dead);
    }

    #[tokio::test]
    async fn test_blast_takes_first_answer() {
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        let live = spawn_udp_responder(b"first").await;

        let driver = ResolverDriver::new(vec![dead_addr, live], QueryStrategy::Blast).unwrap();
        driver.set_retransmit_timeout(1);

        let response = driver.exchange(b"query").await.unwrap();
        assert_eq!(response, b"first");
        drop(dead);
    }

    #[tokio::test]
    async fn test_tcp_pipelined_reuses_connection() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = std::sync::Arc::new(AtomicUsize::new(0));
        let accepts_srv = accepts.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                accepts_srv.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    loop {
                        let mut lenbuf = [0u8; 2];
                        if stream.read_exact(&mut lenbuf).await.is_err() {
                            break;
                        }
                        let len = u16::from_be_bytes(lenbuf) as usize;
                        let mut msg = vec![0u8; len];
                        if stream.read_exact(&mut msg).await.is_err() {
                            break;
                        }
                        let reply = b"pipelined";
                        let _ = stream
                            .write_all(&(reply.len() as u16).to_be_bytes())
                            .await;
                        let _ = stream.write_all(reply).await;
                    }
                });
            }
        });

        let driver = ResolverDriver::new(vec![addr], QueryStrategy::Rotate).unwrap();
        driver.set_pipelining(true);

        assert_eq!(driver.exchange(b"one").await.unwrap(), b"pipelined");
        assert_eq!(driver.exchange(b"two").await.unwrap(), b"pipelined");
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }
}
