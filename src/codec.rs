//! DNS transport codec
//!
//! Turns payload chunks into DNS queries and extracts downlink payload from
//! answers. Uplink payload travels base32-encoded in query labels under the
//! selected domain, followed by a control label carrying the sequence number
//! and session identifiers:
//!
//! ```text
//! <base32 data>.<base32 data>.x<seq>s<session>f<fwd>[.t<addr><port>].tunnel.example.com
//! ```
//!
//! Downlink payload arrives in the answers to polling queries: TXT
//! character-strings and NULL RDATA carry raw bytes, CNAME targets carry
//! base32 labels in front of the queried domain.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use data_encoding::BASE32_NOPAD;
use log::debug;

use crate::config::{ForwardMode, RecordType, SessionConfig};
use crate::resolver::ResolverDriver;
use crate::strategy::DomainPicker;
use crate::wire::{self, RData};
use crate::TunnelError;

/// Presentation lengths of the fixed labels in an uplink query name.
const CONTROL_LABEL_LEN: usize = 15; // "x......s....f.."
const TARGET_LABEL_LEN: usize = 13; // "t........" addr + "...." port

/// Delivery contract consumed by the tunnel workers.
///
/// The engine treats delivery as synchronous: `encode_and_send` either
/// confirms the chunk reached the far end or fails so the uplink worker can
/// retry the same chunk. `poll_for_payload` returns an empty vector when
/// nothing is pending; the downlink worker treats empty and failed polls
/// identically.
#[async_trait]
pub trait TransportCodec: Send + Sync {
    /// Deliver one uplink chunk.
    async fn encode_and_send(&self, payload: &[u8]) -> Result<(), TunnelError>;

    /// Ask the far end for pending downlink payload.
    async fn poll_for_payload(&self) -> Result<Vec<u8>, TunnelError>;

    /// Adjust the resolver's per-attempt timeout (seconds).
    fn set_retransmit_timeout(&self, secs: u32);
}

/// The real codec: base32 labels over the nameserver driver.
pub struct DnsCodec {
    resolver: Arc<ResolverDriver>,
    picker: Mutex<DomainPicker>,
    record_type: RecordType,
    forward: ForwardMode,
    session_id: u16,
    forward_session: u8,
    seq: AtomicU32,
}

impl DnsCodec {
    /// Build a codec for the session.
    ///
    /// # Errors
    ///
    /// Fails if a full read buffer could not be encoded into a query name
    /// under the longest configured domain without breaking the RFC 1035
    /// name length limit.
    pub fn new(config: &SessionConfig, resolver: Arc<ResolverDriver>) -> Result<Self, TunnelError> {
        let longest_domain = config
            .domains
            .iter()
            .map(|d| d.len())
            .max()
            .unwrap_or(0);
        let worst = Self::encoded_name_len(config.bufsz, config.forward, longest_domain);
        if worst > wire::MAX_NAME_LEN {
            return Err(TunnelError::InvalidConfig(format!(
                "read buffer of {} bytes encodes to a {}-byte query name (max {}); \
                 lower -B or use a shorter domain",
                config.bufsz,
                worst,
                wire::MAX_NAME_LEN
            )));
        }

        Ok(Self {
            resolver,
            picker: Mutex::new(DomainPicker::new(config.strategy, config.domains.clone())),
            record_type: config.record_type,
            forward: config.forward,
            session_id: config.session_id,
            forward_session: config.forward_session,
            seq: AtomicU32::new(0),
        })
    }

    /// Worst-case presentation length of an uplink query name.
    fn encoded_name_len(bufsz: usize, forward: ForwardMode, domain_len: usize) -> usize {
        let data_chars = (bufsz * 8 + 4) / 5; // base32 expansion
        let data_labels = data_chars.div_ceil(wire::MAX_LABEL_LEN);
        let target = match forward {
            ForwardMode::Dynamic { .. } => TARGET_LABEL_LEN + 1,
            ForwardMode::Static => 0,
        };
        data_chars + data_labels + CONTROL_LABEL_LEN + 1 + target + domain_len
    }

    /// Resolver option passthroughs, used from option handling at startup.
    pub fn set_retry_count(&self, retries: u32) {
        self.resolver.set_retry_count(retries);
    }

    pub fn set_pipelining(&self, pipeline: bool) {
        self.resolver.set_pipelining(pipeline);
    }

    pub fn set_debug(&self, debug: bool) {
        self.resolver.set_debug(debug);
    }

    /// Build the query name carrying one uplink chunk.
    fn uplink_name(&self, payload: &[u8], domain: &str) -> String {
        let encoded = BASE32_NOPAD.encode(payload).to_ascii_lowercase();
        let mut name = String::with_capacity(encoded.len() + domain.len() + 40);

        for chunk in encoded.as_bytes().chunks(wire::MAX_LABEL_LEN) {
            name.push_str(std::str::from_utf8(chunk).expect("base32 is ascii"));
            name.push('.');
        }

        let seq = self.seq.load(Ordering::Relaxed) & 0x00ff_ffff;
        name.push_str(&format!(
            "x{:06x}s{:04x}f{:02x}",
            seq, self.session_id, self.forward_session
        ));

        if let ForwardMode::Dynamic { addr, port } = self.forward {
            name.push_str(&format!(".t{:08x}{:04x}", u32::from(addr), port));
        }

        name.push('.');
        name.push_str(domain);
        name
    }

    /// Build a downlink polling name. The nonce defeats resolver caching.
    fn poll_name(&self, domain: &str) -> String {
        format!(
            "p{:08x}.s{:04x}f{:02x}.{}",
            rand::random::<u32>(),
            self.session_id,
            self.forward_session,
            domain
        )
    }

    /// Extract downlink payload from a parsed response.
    fn decode_answers(&self, response: &wire::Response, domain: &str) -> Result<Vec<u8>, TunnelError> {
        let mut payload = Vec::new();
        for answer in &response.answers {
            match (self.record_type, answer) {
                (RecordType::Txt, RData::Txt(bytes)) => payload.extend_from_slice(bytes),
                (RecordType::Null, RData::Null(bytes)) => payload.extend_from_slice(bytes),
                (RecordType::Cname, RData::Cname(target)) => {
                    payload.extend_from_slice(&decode_cname_target(target, domain)?);
                }
                _ => {} // record type we did not ask for
            }
        }
        Ok(payload)
    }
}

/// Strip the domain suffix from a CNAME target and base32-decode the
/// remaining labels.
fn decode_cname_target(target: &str, domain: &str) -> Result<Vec<u8>, TunnelError> {
    let data = target
        .strip_suffix(domain)
        .or_else(|| {
            // suffix comparison is case-insensitive per DNS rules
            let lower = target.to_ascii_lowercase();
            lower
                .strip_suffix(&domain.to_ascii_lowercase())
                .map(|p| &target[..p.len()])
        })
        .unwrap_or(target)
        .trim_end_matches('.');

    let compact: String = data
        .chars()
        .filter(|c| *c != '.')
        .collect::<String>()
        .to_ascii_uppercase();
    if compact.is_empty() {
        return Ok(Vec::new());
    }

    BASE32_NOPAD
        .decode(compact.as_bytes())
        .map_err(|e| TunnelError::BadResponse(format!("CNAME payload: {}", e)))
}

#[async_trait]
impl TransportCodec for DnsCodec {
    async fn encode_and_send(&self, payload: &[u8]) -> Result<(), TunnelError> {
        let domain = self.picker.lock().unwrap().next();
        let name = self.uplink_name(payload, &domain);
        let id = rand::random::<u16>();

        let query = wire::build_query(id, &name, wire::QTYPE_A)?;
        let raw = self.resolver.exchange(&query).await?;
        let response = wire::parse_response(&raw)?;

        if response.id != id {
            return Err(TunnelError::BadResponse("transaction id mismatch".into()));
        }
        if response.rcode != 0 {
            return Err(TunnelError::Rejected(response.rcode));
        }

        // The chunk is acknowledged; the next one gets a fresh sequence.
        self.seq.fetch_add(1, Ordering::Relaxed);
        debug!("delivered {} bytes via {}", payload.len(), domain);
        Ok(())
    }

    async fn poll_for_payload(&self) -> Result<Vec<u8>, TunnelError> {
        let domain = self.picker.lock().unwrap().next();
        let name = self.poll_name(&domain);
        let id = rand::random::<u16>();

        let query = wire::build_query(id, &name, self.record_type.qtype())?;
        let raw = self.resolver.exchange(&query).await?;
        let response = wire::parse_response(&raw)?;

        if response.id != id {
            return Err(TunnelError::BadResponse("transaction id mismatch".into()));
        }
        if response.rcode != 0 {
            // NXDOMAIN and friends mean "nothing pending", not an error
            return Ok(Vec::new());
        }

        self.decode_answers(&response, &domain)
    }

    fn set_retransmit_timeout(&self, secs: u32) {
        self.resolver.set_retransmit_timeout(secs);
    }
}
