// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cell::Cell, net::SocketAddr, rc::Rc};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::{
    bus::{Bus, Message, MessageKind},
    carrier::{dns_wire, name_encoder},
    packet::Packet,
    utils::random_u16,
};

/// The DNS output driver: encodes application packets into carrier queries,
/// parses responses, and advertises the carrier's size limit. Owns the UDP
/// socket outright (`spec.md` §5's "each socket is owned by exactly one
/// component").
pub struct DnsCarrier {
    bus: Rc<Bus>,
    domain_suffix: String,
    socket: Rc<UdpSocket>,
    upstream: SocketAddr,
    max_packet_length: Cell<u32>,
}

impl DnsCarrier {
    /// Wires the carrier to `bus` (subscribes START and PACKET_OUT). Call
    /// `socket.recv_from` from the event loop to feed datagrams to
    /// [`DnsCarrier::handle_datagram`]; the adapter does not own a task of
    /// its own.
    pub fn install(
        bus: Rc<Bus>,
        domain_suffix: String,
        socket: Rc<UdpSocket>,
        upstream: SocketAddr,
    ) -> Rc<Self> {
        let carrier = Rc::new(DnsCarrier {
            bus: bus.clone(),
            domain_suffix,
            socket,
            upstream,
            max_packet_length: Cell::new(0),
        });

        let c = carrier.clone();
        bus.subscribe(MessageKind::Start, move |_| c.handle_start());

        let c = carrier.clone();
        bus.subscribe(MessageKind::PacketOut, move |msg| {
            if let Message::PacketOut { packet } = msg {
                c.handle_packet_out(packet);
            }
        });

        carrier
    }

    fn handle_start(&self) {
        let max_len = name_encoder::max_packet_length(&self.domain_suffix);
        self.max_packet_length.set(max_len);
        self.bus.post(&Message::ConfigInt {
            key: "max_packet_length",
            value: max_len as i64,
        });
    }

    fn handle_packet_out(&self, packet: &Packet) {
        let encoded = packet.encode();

        // Contract violation: the session layer must never build a packet
        // that doesn't fit, since it learned the budget from CONFIG_INT.
        assert!(
            encoded.len() as u32 <= self.max_packet_length.get(),
            "packet of {} bytes exceeds max_packet_length {}",
            encoded.len(),
            self.max_packet_length.get(),
        );

        let name = name_encoder::encode_name(&encoded, &self.domain_suffix);
        let txid = random_u16();
        let query = dns_wire::encode_query(txid, &name);

        match self.socket.try_send_to(&query, self.upstream) {
            Ok(_) => {},
            Err(e) => warn!(error = %e, "failed to send DNS query, dropping"),
        }
    }

    /// Feeds one received UDP datagram through parsing and, if it carries a
    /// real packet, publishes PACKET_IN. All rejection paths here are
    /// transient: logged and dropped, never fatal (`spec.md` §4.6).
    pub fn handle_datagram(&self, bytes: &[u8]) {
        let parsed = match dns_wire::parse_response(bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "malformed DNS response, dropping");
                return;
            },
        };

        if parsed.rcode != 0 || parsed.qdcount != 1 || parsed.ancount != 1 {
            debug!(
                rcode = parsed.rcode,
                qdcount = parsed.qdcount,
                ancount = parsed.ancount,
                "unacceptable DNS response, dropping"
            );
            return;
        }

        let decoded = match hex::decode(&parsed.txt_rdata) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "TXT rdata is not valid hex, dropping");
                return;
            },
        };

        if decoded == self.domain_suffix.as_bytes() {
            debug!("nil response, ignoring");
            return;
        }

        match Packet::decode(&decoded) {
            Ok(packet) => self.bus.post(&Message::PacketIn { packet }),
            Err(e) => debug!(error = %e, "failed to decode packet, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_advertises_max_packet_length() {
        let bus = Rc::new(Bus::new());
        let socket = Rc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
        let upstream: SocketAddr = "127.0.0.1:53".parse().expect("addr");
        let configured = Rc::new(Cell::new(0i64));

        let c = configured.clone();
        bus.subscribe(MessageKind::ConfigInt, move |msg| {
            if let Message::ConfigInt { value, .. } = msg {
                c.set(*value);
            }
        });

        DnsCarrier::install(bus.clone(), "x.example".to_string(), socket, upstream);
        bus.post(&Message::Start);

        assert!(configured.get() > 0);
        assert_eq!(
            configured.get() as u32,
            name_encoder::max_packet_length("x.example")
        );
    }
}
