// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Selects which input driver the binary starts (`SPEC_FULL.md` §4.8:
/// exactly one driver is active per process).
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "Kind")]
pub enum DriverKind {
    #[serde(rename = "Console", alias = "console")]
    Console,

    #[serde(rename = "Exec", alias = "exec")]
    Exec {
        #[serde(rename = "Command")]
        command: String,
    },

    #[serde(rename = "TcpListener", alias = "tcp_listener")]
    TcpListener {
        #[serde(rename = "ListenAddr")]
        listen_addr: String,
        #[serde(rename = "TunnelHost", default)]
        tunnel_host: Option<String>,
        #[serde(rename = "TunnelPort", default)]
        tunnel_port: Option<u16>,
    },

    #[serde(rename = "Socks4", alias = "socks4")]
    Socks4 {
        #[serde(rename = "ListenAddr")]
        listen_addr: String,
    },
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverKind::Console => "Console",
            DriverKind::Exec { .. } => "Exec",
            DriverKind::TcpListener { .. } => "TcpListener",
            DriverKind::Socks4 { .. } => "Socks4",
        })
    }
}
