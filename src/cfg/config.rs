// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::DriverKind;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// The carrier: DNS domain suffix and upstream resolver.
    pub carrier: CarrierConfig,
    /// Timers that govern the heartbeat-driven send/retransmit loop.
    pub timers: Timers,
    /// Which input driver to start, and its parameters.
    pub driver: DriverKind,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// DNS carrier parameters (`spec.md` §4.6/§6).
pub struct CarrierConfig {
    #[serde(rename = "DomainSuffix")]
    /// The domain this client tunnels under, e.g. `tunnel.example.com`.
    pub domain_suffix: String,

    #[serde(rename = "UpstreamHost")]
    /// Upstream DNS resolver to query.
    pub upstream_host: String,

    #[serde(rename = "UpstreamPort", default = "default_dns_port")]
    /// Upstream DNS resolver port.
    pub upstream_port: u16,
}

fn default_dns_port() -> u16 {
    53
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Heartbeat cadence (`spec.md` §4.2/§5: one heartbeat drives one send
/// opportunity per round-robin session).
pub struct Timers {
    #[serde(rename = "HeartbeatInterval", with = "serde_millis")]
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.carrier.domain_suffix.is_empty(),
            "DomainSuffix must not be empty"
        );
        ensure!(
            self.carrier.upstream_port != 0,
            "UpstreamPort must not be 0"
        );
        ensure!(
            self.timers.heartbeat_interval > Duration::ZERO,
            "HeartbeatInterval must be > 0"
        );

        match &self.driver {
            DriverKind::Console | DriverKind::Exec { .. } => {},
            DriverKind::TcpListener {
                listen_addr,
                tunnel_host,
                tunnel_port,
            } => {
                listen_addr
                    .parse::<SocketAddr>()
                    .context("driver ListenAddr is not a valid socket address")?;
                ensure!(
                    tunnel_host.is_some() == tunnel_port.is_some(),
                    "TunnelHost and TunnelPort must be given together, or not at all"
                );
            },
            DriverKind::Socks4 { listen_addr } => {
                listen_addr
                    .parse::<SocketAddr>()
                    .context("driver ListenAddr is not a valid socket address")?;
            },
        }

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            carrier: CarrierConfig {
                domain_suffix: "tunnel.example.com".to_string(),
                upstream_host: "127.0.0.1".to_string(),
                upstream_port: 53,
            },
            timers: Timers {
                heartbeat_interval: Duration::from_millis(1000),
            },
            driver: DriverKind::Console,
        }
    }

    #[test]
    fn validates_a_well_formed_config() {
        assert!(base_config().validate_and_normalize().is_ok());
    }

    #[test]
    fn rejects_empty_domain_suffix() {
        let mut cfg = base_config();
        cfg.carrier.domain_suffix.clear();
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn rejects_mismatched_tunnel_host_and_port() {
        let mut cfg = base_config();
        cfg.driver = DriverKind::TcpListener {
            listen_addr: "127.0.0.1:1080".to_string(),
            tunnel_host: Some("internal.example.com".to_string()),
            tunnel_port: None,
        };
        assert!(cfg.validate_and_normalize().is_err());
    }
}
