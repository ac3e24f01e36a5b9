//! Endpoint configuration.
//!
//! [`TransmissionParameters`] are the RFC 7252 §4.8 tunables plus the
//! values derived from them; [`EndpointConfig`] adds the transport
//! priority list, which can be overridden through the environment:
//!
//! - `SHRIKE_CLIENT_TRANSPORT` / `SHRIKE_SERVER_TRANSPORT`: colon-
//!   separated transport names in priority order (e.g. `oscore:udp`).
//! - `SHRIKE_EXPECT_ALL_TRANSPORTS`: when set, a requested transport
//!   that is unavailable is an error instead of a logged warning.

use std::time::Duration;

/// RFC 7252 transmission parameters with their derived bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionParameters {
    /// Initial CON retransmission timeout lower bound
    pub ack_timeout: Duration,
    /// Spread factor for the initial timeout (uniform draw up to
    /// `ack_timeout * ack_random_factor`)
    pub ack_random_factor: f64,
    /// Retransmissions (not counting the initial send) before giving up
    pub max_retransmit: u32,
    /// Outstanding CONs allowed per remote
    pub nstart: usize,
    /// Server-side grace period before promising a separate response
    pub default_leisure: Duration,
    /// NON pacing bound, bytes per second
    pub probing_rate: u32,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        TransmissionParameters {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            default_leisure: Duration::from_secs(5),
            probing_rate: 1,
        }
    }
}

impl TransmissionParameters {
    /// Worst-case time from first transmission to the last
    /// retransmission: `ACK_TIMEOUT * (2^MAX_RETRANSMIT - 1) *
    /// ACK_RANDOM_FACTOR` (45 s at the defaults).
    #[must_use]
    pub fn max_transmit_span(&self) -> Duration {
        self.ack_timeout
            .mul_f64(f64::from((1u32 << self.max_retransmit) - 1) * self.ack_random_factor)
    }

    /// Worst-case time a sender keeps waiting for an ACK:
    /// `ACK_TIMEOUT * (2^(MAX_RETRANSMIT+1) - 1) * ACK_RANDOM_FACTOR`.
    #[must_use]
    pub fn max_transmit_wait(&self) -> Duration {
        self.ack_timeout.mul_f64(
            f64::from((1u32 << (self.max_retransmit + 1)) - 1) * self.ack_random_factor,
        )
    }

    /// How long a message ID must not be reused towards a remote:
    /// `MAX_TRANSMIT_SPAN + 2 * MAX_LATENCY + PROCESSING_DELAY` (247 s
    /// at the defaults, with MAX_LATENCY = 100 s).
    #[must_use]
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + Duration::from_secs(200) + self.ack_timeout
    }

    /// Grace period before a server pre-empts with an empty ACK and
    /// promotes its reply to a separate response.
    #[must_use]
    pub fn processing_delay(&self) -> Duration {
        self.ack_timeout / 2
    }
}

/// Top-level endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Transmission tunables
    pub transmission: TransmissionParameters,
    /// Transport priority list for outgoing requests; empty means every
    /// constructed transport in construction order
    pub client_transports: Vec<String>,
    /// Transport priority list for serving
    pub server_transports: Vec<String>,
    /// Escalate missing requested transports to errors
    pub expect_all_transports: bool,
    /// Default block size exponent for blockwise transfers (szx 6 =
    /// 1024 bytes)
    pub default_szx: u8,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            transmission: TransmissionParameters::default(),
            client_transports: Vec::new(),
            server_transports: Vec::new(),
            expect_all_transports: false,
            default_szx: 6,
        }
    }
}

impl EndpointConfig {
    /// Configuration from defaults plus the `SHRIKE_*` environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = EndpointConfig::default();
        if let Ok(list) = std::env::var("SHRIKE_CLIENT_TRANSPORT") {
            config.client_transports = parse_transport_list(&list);
        }
        if let Ok(list) = std::env::var("SHRIKE_SERVER_TRANSPORT") {
            config.server_transports = parse_transport_list(&list);
        }
        config.expect_all_transports = std::env::var_os("SHRIKE_EXPECT_ALL_TRANSPORTS").is_some();
        config
    }
}

/// Split a colon-separated priority list, dropping empty entries.
fn parse_transport_list(list: &str) -> Vec<String> {
    list.split(':')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters() {
        let params = TransmissionParameters::default();
        assert_eq!(params.ack_timeout, Duration::from_secs(2));
        assert_eq!(params.max_retransmit, 4);
        assert_eq!(params.nstart, 1);
    }

    #[test]
    fn test_derived_values_at_defaults() {
        let params = TransmissionParameters::default();
        assert_eq!(params.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(params.max_transmit_wait(), Duration::from_secs(93));
        assert_eq!(params.exchange_lifetime(), Duration::from_secs(247));
        assert_eq!(params.processing_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_transport_list_parsing() {
        assert_eq!(
            parse_transport_list("oscore:udp:loopback"),
            vec!["oscore", "udp", "loopback"]
        );
        assert_eq!(parse_transport_list("udp"), vec!["udp"]);
        assert_eq!(parse_transport_list("udp::"), vec!["udp"]);
        assert!(parse_transport_list("").is_empty());
    }
}
