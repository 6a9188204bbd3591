//! Tunnel session configuration

use std::net::Ipv4Addr;

/// Maximum number of domain names accepted on the command line
pub const MAX_DOMAINS: usize = 256;

/// Maximum length of a single domain name
pub const MAX_DOMAIN_LEN: usize = 255;

/// Default uplink read buffer size (bytes)
pub const DEFAULT_BUFSZ: usize = 110;

/// Default minimum sleep between nameserver queries (microseconds)
pub const DEFAULT_SLEEP_US: u64 = 500_000;

/// Default alarm delay before a short uplink flush (microseconds)
pub const DEFAULT_DELAY_US: u64 = 500_000;

/// Default backoff cap shared by both workers
pub const DEFAULT_MAXBACKOFF: u32 = 30;

/// Default consecutive poll failures before the downlink worker gives up
pub const DEFAULT_MAXPOLLFAIL: u32 = 10;

/// Default number of fast-start reads
pub const DEFAULT_FASTSTART: u32 = 3;

/// Default port for dynamically forwarded sessions
pub const DEFAULT_TARGET_PORT: u16 = 22;

/// DNS record type used for downlink polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Txt,
    Cname,
    Null,
}

impl RecordType {
    /// Wire QTYPE value for this record type
    pub fn qtype(self) -> u16 {
        match self {
            RecordType::Txt => crate::wire::QTYPE_TXT,
            RecordType::Cname => crate::wire::QTYPE_CNAME,
            RecordType::Null => crate::wire::QTYPE_NULL,
        }
    }

    /// Parse a record type name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TXT" => Some(RecordType::Txt),
            "CNAME" => Some(RecordType::Cname),
            "NULL" => Some(RecordType::Null),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Txt => "TXT",
            RecordType::Cname => "CNAME",
            RecordType::Null => "NULL",
        }
    }
}

/// Strategy for cycling through the configured domain list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStrategy {
    RoundRobin,
    Random,
}

impl DomainStrategy {
    /// Parse a strategy name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "roundrobin" => Some(DomainStrategy::RoundRobin),
            "random" => Some(DomainStrategy::Random),
            _ => None,
        }
    }
}

/// How the far end connects the tunneled stream onward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// The far end uses its statically configured target
    Static,
    /// The far end connects to a target resolved at startup
    Dynamic { addr: Ipv4Addr, port: u16 },
}

/// Immutable parameter set shared by both workers.
///
/// Built once at startup, then cloned into the uplink and downlink workers.
/// Nothing here is mutated after the session splits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Domain names queries are issued under, in configured order
    pub domains: Vec<String>,

    /// Domain selection strategy
    pub strategy: DomainStrategy,

    /// Record type for downlink polling queries
    pub record_type: RecordType,

    /// Uplink read buffer size in bytes
    pub bufsz: usize,

    /// Minimum sleep between nameserver queries (microseconds)
    pub sleep_us: u64,

    /// How long a partially filled uplink buffer waits before being flushed
    /// (microseconds). 0 disables buffering entirely.
    pub delay_us: u64,

    /// Cap for both backoff multipliers
    pub maxbackoff: u32,

    /// Consecutive downlink poll failures before terminal exit (0 = unlimited)
    pub maxpollfail: u32,

    /// Number of initial small reads flushed without buffering
    pub faststart: u32,

    /// Forwarding mode communicated to the far end
    pub forward: ForwardMode,

    /// TCP port to bridge instead of stdin/stdout (0 = use stdio)
    pub proxy_port: u16,

    /// Random session identifier carried in every query
    pub session_id: u16,

    /// Forwarded-session identifier
    pub forward_session: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            strategy: DomainStrategy::RoundRobin,
            record_type: RecordType::Txt,
            bufsz: DEFAULT_BUFSZ,
            sleep_us: DEFAULT_SLEEP_US,
            delay_us: DEFAULT_DELAY_US,
            maxbackoff: DEFAULT_MAXBACKOFF,
            maxpollfail: DEFAULT_MAXPOLLFAIL,
            faststart: DEFAULT_FASTSTART,
            forward: ForwardMode::Static,
            proxy_port: 0,
            session_id: 0,
            forward_session: 0,
        }
    }
}

impl SessionConfig {
    /// Validate startup constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain list is empty, too long, contains an
    /// over-long name, or the buffer size or backoff cap is zero.
    pub fn validate(&self) -> Result<(), crate::TunnelError> {
        if self.domains.is_empty() {
            return Err(crate::TunnelError::InvalidConfig(
                "at least one domain name is required".into(),
            ));
        }
        if self.domains.len() >= MAX_DOMAINS {
            return Err(crate::TunnelError::InvalidConfig(format!(
                "too many domain names ({}, maximum {})",
                self.domains.len(),
                MAX_DOMAINS - 1
            )));
        }
        for d in &self.domains {
            if d.is_empty() || d.len() > MAX_DOMAIN_LEN {
                return Err(crate::TunnelError::InvalidConfig(format!(
                    "invalid domain name length: {}",
                    d
                )));
            }
        }
        if self.bufsz == 0 {
            return Err(crate::TunnelError::InvalidConfig(
                "read buffer size must be positive".into(),
            ));
        }
        if self.maxbackoff == 0 {
            return Err(crate::TunnelError::InvalidConfig(
                "maximum backoff must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid_with_domain() {
        let mut config = SessionConfig::default();
        assert!(config.validate().is_err()); // no domains yet

        config.domains.push("tunnel.example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_oversized_domain() {
        let mut config = SessionConfig::default();
        config.domains.push("a".repeat(MAX_DOMAIN_LEN + 1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_bufsz() {
        let mut config = SessionConfig::default();
        config.domains.push("t.example.com".to_string());
        config.bufsz = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_record_type_parsing() {
        assert_eq!(RecordType::parse("txt"), Some(RecordType::Txt));
        assert_eq!(RecordType::parse("CNAME"), Some(RecordType::Cname));
        assert_eq!(RecordType::parse("Null"), Some(RecordType::Null));
        assert_eq!(RecordType::parse("MX"), None);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            DomainStrategy::parse("roundrobin"),
            Some(DomainStrategy::RoundRobin)
        );
        assert_eq!(DomainStrategy::parse("RANDOM"), Some(DomainStrategy::Random));
        assert_eq!(DomainStrategy::parse("shuffle"), None);
    }
}
