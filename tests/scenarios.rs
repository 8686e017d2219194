// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Concrete scenario coverage, driven entirely through the message bus —
//! the same way the input drivers and carrier adapter would.

use std::{cell::RefCell, net::SocketAddr, rc::Rc};

use bytes::{BufMut, Bytes, BytesMut};
use covert_tunnel::{
    bus::{Bus, Message, MessageKind},
    carrier::DnsCarrier,
    packet::{Packet, SynFlags},
    session::{LastSent, SessionLayer, SessionState},
};
use tokio::net::UdpSocket;

fn packet_outs(bus: &Rc<Bus>) -> Rc<RefCell<Vec<Packet>>> {
    let out = Rc::new(RefCell::new(Vec::new()));
    let o = out.clone();
    bus.subscribe(MessageKind::PacketOut, move |msg| {
        if let Message::PacketOut { packet } = msg {
            o.borrow_mut().push(packet.clone());
        }
    });
    out
}

fn data_ins(bus: &Rc<Bus>) -> Rc<RefCell<Vec<(u16, Bytes)>>> {
    let out = Rc::new(RefCell::new(Vec::new()));
    let o = out.clone();
    bus.subscribe(MessageKind::DataIn, move |msg| {
        if let Message::DataIn { session_id, bytes } = msg {
            o.borrow_mut().push((*session_id, bytes.clone()));
        }
    });
    out
}

fn set_unbounded_packet_budget(bus: &Rc<Bus>) {
    bus.post(&Message::ConfigInt {
        key: "max_packet_length",
        value: 1_000_000,
    });
}

#[test]
fn s1_handshake() {
    let bus = Rc::new(Bus::new());
    let layer = SessionLayer::install(bus.clone());
    set_unbounded_packet_budget(&bus);
    let outs = packet_outs(&bus);

    let msg = Message::create_session(None);
    bus.post(&msg);
    let session_id = msg.take_session_id();
    layer.registry().with_session(session_id, |s| {
        s.my_seq = 0x1234;
        s.last_sent_packet = Some(LastSent::Syn {
            initial_seq: 0x1234,
            flags: SynFlags::empty(),
            name: None,
            tunnel: None,
        });
    });

    bus.post(&Message::Heartbeat);
    match &outs.borrow()[0] {
        Packet::Syn {
            session_id: sid,
            initial_seq,
            ..
        } => {
            assert_eq!(*sid, session_id);
            assert_eq!(*initial_seq, 0x1234);
        },
        other => panic!("expected SYN, got {other:?}"),
    }

    let created = Rc::new(RefCell::new(None));
    let c = created.clone();
    bus.subscribe(MessageKind::SessionCreated, move |msg| {
        if let Message::SessionCreated { session_id } = msg {
            *c.borrow_mut() = Some(*session_id);
        }
    });
    bus.post(&Message::PacketIn {
        packet: Packet::Syn {
            packet_id: 1,
            session_id,
            initial_seq: 0x9abc,
            flags: SynFlags::empty(),
            name: None,
            tunnel: None,
        },
    });
    assert_eq!(*created.borrow(), Some(session_id));
    assert_eq!(
        layer.registry().with_session(session_id, |s| s.state),
        Some(SessionState::Established)
    );

    outs.borrow_mut().clear();
    bus.post(&Message::Heartbeat);
    assert_eq!(outs.borrow().len(), 1);
    assert!(
        matches!(outs.borrow()[0], Packet::Ping { .. }),
        "idle heartbeat on an established session with no data must PING, not MSG"
    );
}

fn established_session(bus: &Rc<Bus>, layer: &Rc<SessionLayer>) -> u16 {
    let msg = Message::create_session(None);
    bus.post(&msg);
    let session_id = msg.take_session_id();
    layer.registry().with_session(session_id, |s| {
        s.state = SessionState::Established;
        s.my_seq = 0x1234;
        s.their_seq = 0x9abc;
        s.last_sent_packet = None;
    });
    session_id
}

#[test]
fn s2_echo() {
    let bus = Rc::new(Bus::new());
    let layer = SessionLayer::install(bus.clone());
    set_unbounded_packet_budget(&bus);
    let outs = packet_outs(&bus);
    let ins = data_ins(&bus);

    let session_id = established_session(&bus, &layer);

    bus.post(&Message::DataOut {
        session_id,
        bytes: Bytes::from_static(b"abc"),
    });
    bus.post(&Message::Heartbeat);
    match &outs.borrow()[0] {
        Packet::Msg {
            session_id: sid,
            seq,
            ack,
            data,
        } => {
            assert_eq!(*sid, session_id);
            assert_eq!(*seq, 0x1234);
            assert_eq!(*ack, 0x9abc);
            assert_eq!(&data[..], b"abc");
        },
        other => panic!("expected MSG, got {other:?}"),
    }

    bus.post(&Message::PacketIn {
        packet: Packet::Msg {
            packet_id: 2,
            session_id,
            seq: 0x9abc,
            ack: 0x1237,
            data: Bytes::from_static(b"ABC"),
        },
    });

    assert_eq!(ins.borrow().as_slice(), &[(session_id, Bytes::from_static(b"ABC"))]);
    layer.registry().with_session(session_id, |s| {
        assert!(s.outgoing_buffer.is_empty());
        assert_eq!(s.my_seq, 0x1237);
        assert!(s.last_sent_packet.is_none());
        // `their_seq` advances by `n = (peer_seq + len(data)) - their_seq`,
        // per `spec.md` §4.4 and the wrap-safe invariant in §8's property 5
        // (0x9abc + 3 == 0x9abf), not the value the illustrative scenario
        // text quotes verbatim.
        assert_eq!(s.their_seq, 0x9abf);
    });
}

#[test]
fn s3_duplicate_response_does_not_redeliver() {
    let bus = Rc::new(Bus::new());
    let layer = SessionLayer::install(bus.clone());
    set_unbounded_packet_budget(&bus);
    let ins = data_ins(&bus);

    let session_id = established_session(&bus, &layer);

    let packet = Packet::Msg {
        packet_id: 1,
        session_id,
        seq: 0x9abc,
        ack: 0x1234,
        data: Bytes::from_static(b"ABC"),
    };
    bus.post(&Message::PacketIn {
        packet: packet.clone(),
    });
    assert_eq!(ins.borrow().len(), 1);
    let their_seq_after_first = layer
        .registry()
        .with_session(session_id, |s| s.their_seq)
        .expect("session exists");

    bus.post(&Message::PacketIn { packet });
    assert_eq!(ins.borrow().len(), 1, "duplicate must not redeliver");
    assert_eq!(
        layer.registry().with_session(session_id, |s| s.their_seq),
        Some(their_seq_after_first)
    );
}

#[test]
fn s4_partial_acknowledgement_retransmits_the_remainder() {
    let bus = Rc::new(Bus::new());
    let layer = SessionLayer::install(bus.clone());
    // A tight budget forces the session layer to send only part of a 100
    // byte outgoing buffer in one MSG (header overhead is 9 bytes).
    bus.post(&Message::ConfigInt {
        key: "max_packet_length",
        value: 49,
    });
    let outs = packet_outs(&bus);

    let session_id = established_session(&bus, &layer);
    bus.post(&Message::DataOut {
        session_id,
        bytes: Bytes::from(vec![0xABu8; 100]),
    });

    bus.post(&Message::Heartbeat);
    let first_len = match &outs.borrow()[0] {
        Packet::Msg { data, .. } => data.len(),
        other => panic!("expected MSG, got {other:?}"),
    };
    assert_eq!(first_len, 40);

    bus.post(&Message::PacketIn {
        packet: Packet::Msg {
            packet_id: 2,
            session_id,
            seq: 0x9abc,
            ack: 0x1234u16.wrapping_add(20),
            data: Bytes::new(),
        },
    });
    layer.registry().with_session(session_id, |s| {
        assert_eq!(s.outgoing_buffer.len(), 80);
        assert_eq!(s.my_seq, 0x1234u16.wrapping_add(20));
        assert!(s.last_sent_packet.is_none());
    });

    outs.borrow_mut().clear();
    bus.post(&Message::Heartbeat);
    match &outs.borrow()[0] {
        Packet::Msg { seq, data, .. } => {
            assert_eq!(*seq, 0x1234u16.wrapping_add(20));
            assert_eq!(data.len(), 40);
            assert!(data.iter().all(|b| *b == 0xAB));
        },
        other => panic!("expected MSG, got {other:?}"),
    }
}

#[test]
fn s7_partial_overlap_delivers_only_new_suffix() {
    let bus = Rc::new(Bus::new());
    let layer = SessionLayer::install(bus.clone());
    set_unbounded_packet_budget(&bus);
    let ins = data_ins(&bus);

    // `established_session` sets `their_seq = 0x9abc`. Send a 5-byte MSG
    // whose window only partially overlaps: `peer_seq + len(data) -
    // their_seq == 2`, so only the last 2 bytes are new.
    let session_id = established_session(&bus, &layer);
    bus.post(&Message::PacketIn {
        packet: Packet::Msg {
            packet_id: 1,
            session_id,
            seq: 0x9ab9,
            ack: 0x1234,
            data: Bytes::from_static(b"ABCDE"),
        },
    });

    assert_eq!(ins.borrow().as_slice(), &[(session_id, Bytes::from_static(b"DE"))]);
    assert_eq!(
        layer.registry().with_session(session_id, |s| s.their_seq),
        Some(0x9abe)
    );
}

#[test]
fn s8_heartbeat_retransmits_unacked_msg_verbatim() {
    let bus = Rc::new(Bus::new());
    let layer = SessionLayer::install(bus.clone());
    set_unbounded_packet_budget(&bus);
    let outs = packet_outs(&bus);

    let session_id = established_session(&bus, &layer);
    bus.post(&Message::DataOut {
        session_id,
        bytes: Bytes::from_static(b"abc"),
    });

    bus.post(&Message::Heartbeat);
    let first = outs.borrow()[0].clone();

    // No ack arrives in between: the next heartbeat must replay the exact
    // same in-flight MSG (seq/ack/data unchanged, only `packet_id` is free
    // to vary), via `rebuild_last_sent`, not advance or re-slice it.
    outs.borrow_mut().clear();
    bus.post(&Message::Heartbeat);
    let second = outs.borrow()[0].clone();

    match (&first, &second) {
        (
            Packet::Msg {
                session_id: sid1,
                seq: seq1,
                ack: ack1,
                data: data1,
                ..
            },
            Packet::Msg {
                session_id: sid2,
                seq: seq2,
                ack: ack2,
                data: data2,
                ..
            },
        ) => {
            assert_eq!(sid1, sid2);
            assert_eq!(seq1, seq2);
            assert_eq!(ack1, ack2);
            assert_eq!(data1, data2);
        },
        other => panic!("expected two MSGs, got {other:?}"),
    }
    layer.registry().with_session(session_id, |s| {
        assert!(s.last_sent_packet.is_some(), "retransmit must not clear the in-flight marker");
    });
}

/// Builds a minimal well-formed DNS response carrying one TXT answer whose
/// rdata, hex-decoded, is exactly `domain`'s bytes — the carrier's "nil
/// response" marker (`spec.md` §4.6).
fn build_nil_response(domain: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(0x1234); // id
    buf.put_u16(0x8180); // QR=1, RD=1, RA=1, RCODE=0
    buf.put_u16(1); // qdcount
    buf.put_u16(1); // ancount
    buf.put_u16(0); // nscount
    buf.put_u16(0); // arcount

    for label in domain.split('.') {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    buf.put_u16(0x0010); // qtype TXT
    buf.put_u16(0x0001); // qclass IN

    buf.put_u16(0xC00C); // answer name: pointer to the question's qname
    buf.put_u16(0x0010);
    buf.put_u16(0x0001);
    buf.put_u32(0); // ttl

    let hex_domain = hex::encode(domain.as_bytes());
    let mut rdata = BytesMut::new();
    rdata.put_u8(hex_domain.len() as u8);
    rdata.put_slice(hex_domain.as_bytes());
    buf.put_u16(rdata.len() as u16);
    buf.put_slice(&rdata);

    buf.freeze()
}

#[tokio::test]
async fn s5_nil_answer_is_ignored() {
    let domain = "x.example";
    let bus = Rc::new(Bus::new());
    let socket = Rc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
    let upstream: SocketAddr = "127.0.0.1:53".parse().expect("addr");
    let carrier = DnsCarrier::install(bus.clone(), domain.to_string(), socket, upstream);

    let packet_ins = Rc::new(RefCell::new(0));
    let p = packet_ins.clone();
    bus.subscribe(MessageKind::PacketIn, move |_| *p.borrow_mut() += 1);

    carrier.handle_datagram(&build_nil_response(domain));
    assert_eq!(*packet_ins.borrow(), 0, "nil response must not post PACKET_IN");
}

#[test]
fn s6_fin_closes_session_and_discards_further_data_out() {
    let bus = Rc::new(Bus::new());
    let layer = SessionLayer::install(bus.clone());
    set_unbounded_packet_budget(&bus);

    let session_id = established_session(&bus, &layer);

    let closed = Rc::new(RefCell::new(None));
    let c = closed.clone();
    bus.subscribe(MessageKind::SessionClosed, move |msg| {
        if let Message::SessionClosed { session_id } = msg {
            *c.borrow_mut() = Some(*session_id);
        }
    });

    bus.post(&Message::PacketIn {
        packet: Packet::Fin {
            packet_id: 1,
            session_id,
            reason: "bye".to_string(),
        },
    });
    assert_eq!(*closed.borrow(), Some(session_id));
    assert!(!layer.registry().contains(session_id));

    // DATA_OUT after close must warn and discard, not panic or resurrect
    // the session.
    bus.post(&Message::DataOut {
        session_id,
        bytes: Bytes::from_static(b"too late"),
    });
    assert!(!layer.registry().contains(session_id));
}
