// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Hex encoding, 63-character label chunking, and the `max_packet_length`
//! size-budget formula, grounded on `driver_dns.c`'s
//! `max_dnscat_length()`/`handle_packet_out()`.

const LABEL_MAX: usize = 63;
const TOTAL_NAME_MAX: usize = 255;

/// Solves `avail = 255 - (1 + d + ceil(avail/63) + 1)` for `avail`: the
/// number of hex characters that fit in a name alongside the domain suffix.
/// `ceil(avail/63)` only changes every 63 characters, so the fixed point is
/// reached in at most a couple of iterations.
fn max_encoded_chars(domain_len: usize) -> usize {
    let mut avail = TOTAL_NAME_MAX.saturating_sub(2 + domain_len);
    for _ in 0..8 {
        let labels = avail.div_ceil(LABEL_MAX).max(1);
        let next = TOTAL_NAME_MAX.saturating_sub(2 + domain_len + labels);
        if next == avail {
            break;
        }
        avail = next;
    }
    avail
}

/// The largest application-packet payload (in bytes, before hex expansion)
/// that fits inside one DNS query name for the given domain suffix.
pub fn max_packet_length(domain_suffix: &str) -> u32 {
    (max_encoded_chars(domain_suffix.len()) / 2) as u32
}

/// Hex-encodes `payload` and splits it into labels of at most 63 characters.
pub fn hex_labels(payload: &[u8]) -> Vec<String> {
    let hex = hex::encode(payload);
    hex.as_bytes()
        .chunks(LABEL_MAX)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

/// Builds the full query name: hex-encoded payload labels, followed by the
/// domain suffix's own labels.
pub fn encode_name(payload: &[u8], domain_suffix: &str) -> String {
    let mut labels = hex_labels(payload);
    labels.push(domain_suffix.to_string());
    labels.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_packet_length_matches_the_255_octet_budget() {
        let domain = "x.example";
        let len = max_packet_length(domain);

        // Invariant 4 from spec.md §8: a query encoding exactly that many
        // payload bytes must fit; one more must not.
        let fits = encode_name(&vec![0u8; len as usize], domain);
        let overflows = encode_name(&vec![0u8; (len + 1) as usize], domain);

        assert!(wire_name_len(&fits) <= 255);
        assert!(wire_name_len(&overflows) > 255);
    }

    /// Mirrors the wire-length accounting: one length-prefix byte per label
    /// plus its bytes, plus the trailing zero-length terminator.
    fn wire_name_len(name: &str) -> usize {
        name.split('.').map(|l| 1 + l.len()).sum::<usize>() + 1
    }

    #[test]
    fn hex_labels_respect_the_63_char_limit() {
        let payload = vec![0xABu8; 200];
        let labels = hex_labels(&payload);
        assert!(labels.iter().all(|l| l.len() <= 63));
        assert_eq!(labels.concat(), hex::encode(&payload));
    }
}
