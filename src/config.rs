use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::psk::{derive_pskc, Pskc};
use crate::Error;

/// Longest PSK identity carried in a ClientKeyExchange.
pub const MAX_PSK_IDENTITY_LEN: usize = 64;

/// UDP port the border agent listens on for commissioners.
pub const BORDER_AGENT_PORT: u16 = 19779;

/// UDP port of the leader's commissioning endpoint.
pub const LEADER_PORT: u16 = 19780;

/// Longest network name.
pub const MAX_NETWORK_NAME_LEN: usize = 16;

/// DTLS session configuration
#[derive(Debug, Clone)]
pub struct Config {
    mtu: usize,
    max_queue_rx: usize,
    max_queue_tx: usize,
    handshake_start_rto: Duration,
    handshake_timeout: Duration,
    psk_identity: Vec<u8>,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            mtu: 1150,
            max_queue_rx: 30,
            max_queue_tx: 10,
            handshake_start_rto: Duration::from_secs(8),
            handshake_timeout: Duration::from_secs(60),
            psk_identity: b"meshcop".to_vec(),
            rng_seed: None,
        }
    }

    /// Max transmission unit.
    ///
    /// The largest size UDP packets we will produce.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Max amount of buffered out-of-order handshake messages.
    #[inline(always)]
    pub fn max_queue_rx(&self) -> usize {
        self.max_queue_rx
    }

    /// Max amount of outgoing datagrams waiting to be handed to the transport.
    ///
    /// [`DtlsSession::send`](crate::dtls::DtlsSession::send) fails with
    /// [`Error::WouldBlock`] beyond this.
    #[inline(always)]
    pub fn max_queue_tx(&self) -> usize {
        self.max_queue_tx
    }

    /// First retransmit interval of every flight (the intermediate deadline).
    ///
    /// Doubled for every retransmit with a ±0.25s jitter, capped at
    /// [`handshake_timeout`](Self::handshake_timeout).
    #[inline(always)]
    pub fn handshake_start_rto(&self) -> Duration {
        self.handshake_start_rto
    }

    /// Time after the start of a flight at which the handshake gives up (the final deadline).
    #[inline(always)]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Identity a client sends in its ClientKeyExchange.
    #[inline(always)]
    pub fn psk_identity(&self) -> &[u8] {
        &self.psk_identity
    }

    /// Seed for the non-cryptographic parts of the session, for reproducible tests.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

/// Builder for DTLS configuration.
pub struct ConfigBuilder {
    mtu: usize,
    max_queue_rx: usize,
    max_queue_tx: usize,
    handshake_start_rto: Duration,
    handshake_timeout: Duration,
    psk_identity: Vec<u8>,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the max transmission unit (MTU).
    ///
    /// Defaults to 1150.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Defaults to 30.
    pub fn max_queue_rx(mut self, max_queue_rx: usize) -> Self {
        self.max_queue_rx = max_queue_rx;
        self
    }

    /// Defaults to 10.
    pub fn max_queue_tx(mut self, max_queue_tx: usize) -> Self {
        self.max_queue_tx = max_queue_tx;
        self
    }

    /// Defaults to 8 seconds.
    pub fn handshake_start_rto(mut self, rto: Duration) -> Self {
        self.handshake_start_rto = rto;
        self
    }

    /// Defaults to 60 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Defaults to `meshcop`.
    pub fn psk_identity(mut self, identity: &[u8]) -> Self {
        self.psk_identity = identity.to_vec();
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    ///
    /// Rejects an MTU too small for a handshake flight, a start rto that is not below the
    /// handshake timeout and an oversized PSK identity.
    pub fn build(self) -> Result<Config, Error> {
        if self.mtu < 256 {
            return Err(ConfigError::Invalid("mtu must be at least 256").into());
        }
        if self.max_queue_tx == 0 {
            return Err(ConfigError::Invalid("max_queue_tx must be non-zero").into());
        }
        if self.handshake_start_rto.is_zero()
            || self.handshake_start_rto >= self.handshake_timeout
        {
            return Err(
                ConfigError::Invalid("handshake_start_rto must be below handshake_timeout").into(),
            );
        }
        if self.psk_identity.len() > MAX_PSK_IDENTITY_LEN {
            return Err(ConfigError::Invalid("psk_identity too long").into());
        }

        Ok(Config {
            mtu: self.mtu,
            max_queue_rx: self.max_queue_rx,
            max_queue_tx: self.max_queue_tx,
            handshake_start_rto: self.handshake_start_rto,
            handshake_timeout: self.handshake_timeout,
            psk_identity: self.psk_identity,
            rng_seed: self.rng_seed,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mtu: 1150,
            max_queue_rx: 30,
            max_queue_tx: 10,
            handshake_start_rto: Duration::from_secs(8),
            handshake_timeout: Duration::from_secs(60),
            psk_identity: b"meshcop".to_vec(),
            rng_seed: None,
        }
    }
}

/// Border router configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    listen_addr: SocketAddr,
    leader_addr: SocketAddr,
    network_name: String,
    ext_pan_id: String,
    pskc: Pskc,
    dtls: Arc<Config>,
}

impl RelayConfig {
    /// Create a new relay configuration builder.
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, BORDER_AGENT_PORT)),
            leader_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, LEADER_PORT)),
            passphrase: None,
            network_name: None,
            ext_pan_id: None,
            pskc: None,
            dtls: None,
        }
    }

    /// Address commissioners reach the border agent on.
    #[inline(always)]
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Where translated requests are sent.
    #[inline(always)]
    pub fn leader_addr(&self) -> SocketAddr {
        self.leader_addr
    }

    #[inline(always)]
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Extended PAN ID as 16 hex characters.
    #[inline(always)]
    pub fn ext_pan_id(&self) -> &str {
        &self.ext_pan_id
    }

    /// The commissioning PSK, derived or given.
    #[inline(always)]
    pub fn pskc(&self) -> &Pskc {
        &self.pskc
    }

    #[inline(always)]
    pub fn dtls(&self) -> &Arc<Config> {
        &self.dtls
    }
}

/// Builder for border router configuration.
pub struct RelayConfigBuilder {
    listen_addr: SocketAddr,
    leader_addr: SocketAddr,
    passphrase: Option<String>,
    network_name: Option<String>,
    ext_pan_id: Option<String>,
    pskc: Option<Pskc>,
    dtls: Option<Config>,
}

impl RelayConfigBuilder {
    /// Defaults to `0.0.0.0:19779`.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Defaults to `127.0.0.1:19780`.
    pub fn leader_addr(mut self, addr: SocketAddr) -> Self {
        self.leader_addr = addr;
        self
    }

    /// Commissioner passphrase the PSKc is derived from.
    pub fn passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(passphrase.to_string());
        self
    }

    pub fn network_name(mut self, name: &str) -> Self {
        self.network_name = Some(name.to_string());
        self
    }

    /// Extended PAN ID as 16 hex characters.
    pub fn ext_pan_id(mut self, hex: &str) -> Self {
        self.ext_pan_id = Some(hex.to_string());
        self
    }

    /// Use this PSKc instead of deriving one from the passphrase.
    pub fn pskc(mut self, pskc: Pskc) -> Self {
        self.pskc = Some(pskc);
        self
    }

    /// Defaults to [`Config::default`].
    pub fn dtls(mut self, config: Config) -> Self {
        self.dtls = Some(config);
        self
    }

    /// Build the configuration, deriving the PSKc when none was given.
    pub fn build(self) -> Result<RelayConfig, Error> {
        let network_name = self
            .network_name
            .ok_or(ConfigError::Invalid("network name required"))?;
        if network_name.is_empty() || network_name.len() > MAX_NETWORK_NAME_LEN {
            return Err(ConfigError::Invalid("network name must be 1 to 16 bytes").into());
        }

        let ext_pan_id = self
            .ext_pan_id
            .ok_or(ConfigError::Invalid("extended pan id required"))?;
        if ext_pan_id.len() != 16 || !ext_pan_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid("extended pan id must be 16 hex characters").into());
        }

        let pskc = match (self.pskc, self.passphrase) {
            (Some(pskc), _) => pskc,
            (None, Some(passphrase)) => {
                if passphrase.len() < 6 || passphrase.len() > 255 {
                    return Err(
                        ConfigError::Invalid("passphrase must be 6 to 255 bytes").into(),
                    );
                }
                derive_pskc(&passphrase, &network_name, &ext_pan_id)?
            }
            (None, None) => return Err(ConfigError::MissingPsk.into()),
        };

        Ok(RelayConfig {
            listen_addr: self.listen_addr,
            leader_addr: self.leader_addr,
            network_name,
            ext_pan_id,
            pskc,
            dtls: Arc::new(self.dtls.unwrap_or_default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_handshake_bounds() {
        let c = Config::default();
        assert_eq!(c.handshake_start_rto(), Duration::from_secs(8));
        assert_eq!(c.handshake_timeout(), Duration::from_secs(60));
        assert_eq!(c.mtu(), 1150);
    }

    #[test]
    fn builder_validates() {
        assert!(Config::builder().mtu(100).build().is_err());
        assert!(Config::builder()
            .handshake_start_rto(Duration::from_secs(60))
            .build()
            .is_err());
        assert!(Config::builder().psk_identity(&[0; 65]).build().is_err());
        assert!(Config::builder().rng_seed(7).build().is_ok());
    }

    #[test]
    fn relay_config_derives_pskc() {
        let config = RelayConfig::builder()
            .passphrase("12SECRETPASSWORD34")
            .network_name("Test Network")
            .ext_pan_id("0001020304050607")
            .build()
            .unwrap();
        assert_eq!(config.pskc().to_hex(), "c3f59368445a1b6106be420a706d4cc9");
        assert_eq!(config.listen_addr().port(), BORDER_AGENT_PORT);
        assert_eq!(config.leader_addr(), "127.0.0.1:19780".parse().unwrap());
    }

    #[test]
    fn relay_config_validates() {
        let base = || {
            RelayConfig::builder()
                .network_name("Test Network")
                .ext_pan_id("0001020304050607")
        };
        assert!(matches!(
            base().build(),
            Err(Error::Config(ConfigError::MissingPsk))
        ));
        assert!(base().passphrase("short").build().is_err());
        assert!(base()
            .pskc(Pskc::from_bytes([1; 16]))
            .ext_pan_id("00010203")
            .build()
            .is_err());
        assert!(base()
            .pskc(Pskc::from_bytes([1; 16]))
            .network_name("a network name that is too long")
            .build()
            .is_err());
        assert!(base().pskc(Pskc::from_bytes([1; 16])).build().is_ok());
    }
}
