// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rand::Rng;

/// Generates a random 16-bit identifier, used for session_id candidates,
/// initial sequence numbers, ping_id, and DNS transaction ids. None of these
/// need to be cryptographically unpredictable, only locally unlikely to
/// collide.
pub fn random_u16() -> u16 {
    rand::rng().random::<u16>()
}
