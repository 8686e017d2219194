// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Errors raised inside the CORE (bus, session layer, packet codec, carrier
/// adapter). Transient and unknown-session errors are handled locally by the
/// component that produced them and never escape to `main`; only
/// [`TunnelError::CarrierFatal`] and [`TunnelError::ContractViolation`]
/// propagate.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Malformed or error-coded carrier response, packet parse failure, or
    /// unexpected TXT content. Logged and dropped; state unchanged.
    #[error("transient carrier error: {0}")]
    Transient(String),

    /// PACKET_IN for a session_id the client does not track.
    #[error("unknown session: {0}")]
    UnknownSession(u16),

    /// Sequence numbers implausibly far from the current window.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The carrier's UDP socket closed unexpectedly; there is no way to
    /// rebind while preserving session identity with a stateful server.
    #[error("carrier socket closed: {0}")]
    CarrierFatal(#[from] std::io::Error),

    /// Size budget, reentrancy, or unregistered-kind violations: programming
    /// errors that must fail fast.
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_kind() {
        assert!(
            TunnelError::UnknownSession(7)
                .to_string()
                .contains("unknown session")
        );
        assert!(
            TunnelError::ProtocolViolation("seq out of window".into())
                .to_string()
                .contains("protocol violation")
        );
    }
}
