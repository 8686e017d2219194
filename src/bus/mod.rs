// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process, single-threaded publish/subscribe bus that decouples input
//! drivers, the session layer, and the carrier adapter.
//!
//! The bus is an explicit, constructed value (never a process-wide
//! singleton): every component receives a [`Bus`] handle at construction and
//! posts/subscribes through it. `post` dispatches synchronously, in
//! subscription order, on the calling task; a handler may itself call `post`
//! (depth-first delivery) because there is no event loop to re-enter.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use bytes::Bytes;

use crate::packet::Packet;

/// Discriminant used to key the subscriber table. Mirrors [`Message`]
/// one-to-one but carries no payload, so it can be used as a `HashMap` key
/// and as the argument to [`Bus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Start,
    Shutdown,
    Heartbeat,
    CreateSession,
    SessionCreated,
    SessionClosed,
    CloseSession,
    DataOut,
    DataIn,
    PacketOut,
    PacketIn,
    ConfigInt,
}

/// A bus event. `CreateSession` carries a reply slot: the session layer
/// fills it in synchronously from inside its handler, and the poster reads
/// it back immediately after `post` returns, giving `CREATE_SESSION` its
/// spec'd synchronous-return semantics without a special-cased bus API.
pub enum Message {
    Start,
    Shutdown,
    Heartbeat,
    CreateSession {
        tunnel: Option<(String, u16)>,
        reply: RefCell<Option<u16>>,
    },
    SessionCreated {
        session_id: u16,
    },
    SessionClosed {
        session_id: u16,
    },
    CloseSession {
        session_id: u16,
    },
    DataOut {
        session_id: u16,
        bytes: Bytes,
    },
    DataIn {
        session_id: u16,
        bytes: Bytes,
    },
    PacketOut {
        packet: Packet,
    },
    PacketIn {
        packet: Packet,
    },
    ConfigInt {
        key: &'static str,
        value: i64,
    },
}

impl Message {
    /// Builds the `CreateSession` message with an empty reply slot.
    pub fn create_session(tunnel: Option<(String, u16)>) -> Self {
        Message::CreateSession {
            tunnel,
            reply: RefCell::new(None),
        }
    }

    /// Reads back the session_id the session layer assigned. Panics (a
    /// contract violation) if called on any variant other than
    /// `CreateSession`, or if no subscriber filled the slot.
    pub fn take_session_id(&self) -> u16 {
        match self {
            Message::CreateSession { reply, .. } => reply
                .borrow_mut()
                .take()
                .expect("CREATE_SESSION was posted but no subscriber replied"),
            _ => unreachable!("take_session_id called on a non-CreateSession message"),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Start => MessageKind::Start,
            Message::Shutdown => MessageKind::Shutdown,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::CreateSession { .. } => MessageKind::CreateSession,
            Message::SessionCreated { .. } => MessageKind::SessionCreated,
            Message::SessionClosed { .. } => MessageKind::SessionClosed,
            Message::CloseSession { .. } => MessageKind::CloseSession,
            Message::DataOut { .. } => MessageKind::DataOut,
            Message::DataIn { .. } => MessageKind::DataIn,
            Message::PacketOut { .. } => MessageKind::PacketOut,
            Message::PacketIn { .. } => MessageKind::PacketIn,
            Message::ConfigInt { .. } => MessageKind::ConfigInt,
        }
    }
}

type Handler = Rc<dyn Fn(&Message)>;

/// The message bus itself. Single-threaded: `Rc`/`RefCell`, not
/// `Arc`/`Mutex`, because the whole CORE runs on one cooperative task.
#[derive(Default)]
pub struct Bus {
    subscribers: RefCell<HashMap<MessageKind, Vec<Handler>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` to be invoked, in registration order, for every
    /// message of kind `kind`.
    pub fn subscribe<F>(&self, kind: MessageKind, handler: F)
    where F: Fn(&Message) + 'static {
        self.subscribers
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push(Rc::new(handler));
    }

    /// Dispatches `message` synchronously to every subscriber of its kind,
    /// in subscription order. Delivery to a kind with no subscribers is a
    /// silent no-op, not an error.
    ///
    /// Subscribers are cloned out of the table before being invoked so that
    /// a handler which calls `subscribe`/`post` reentrantly does not
    /// deadlock on `subscribers`' `RefCell` borrow.
    pub fn post(&self, message: &Message) {
        let handlers: Vec<Handler> = self
            .subscribers
            .borrow()
            .get(&message.kind())
            .map(|v| v.clone())
            .unwrap_or_default();

        for handler in &handlers {
            handler(message);
        }
    }
}
