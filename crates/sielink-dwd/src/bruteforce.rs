//! Key recovery against an endpoint with unknown keys.
//!
//! Two incremental attacks, both driven purely through stage-1
//! exchanges:
//!
//! - [`bruteforce_key2`] scans candidate key2 values with chk2 validation
//!   disabled, collecting the candidates whose challenge draws a
//!   chk1-valid response (firmware drops frames with a bad challenge).
//! - [`bruteforce_key1`] recovers key1 one byte per rotate position from
//!   the chk2 values an endpoint returns for a known key2. key3 is
//!   assumed zero here; that mirrors the firmware populations this
//!   attack was built against, not a protocol guarantee.

use std::ops::RangeInclusive;
use tracing::{debug, trace};

use sielink_core::error::{Error, Result};

use crate::client::DwdClient;
use crate::keys::{expected_chk1, key_rotate, Keyset};

/// Scan key2 candidates, collecting those that draw a chk1-valid
/// response.
///
/// The full scan covers `0x0000..=0xFFFF`; pass a narrower range to
/// bound the session time (each miss costs a response timeout on real
/// hardware).
pub async fn bruteforce_key2(
    client: &mut DwdClient,
    range: RangeInclusive<u16>,
) -> Result<Vec<u16>> {
    let mut hits = Vec::new();
    for key2 in range {
        let candidate = Keyset {
            key2,
            ..Keyset::ZERO
        };
        match client.connect1_exchange(&candidate).await {
            Ok(response) if response.chk1 == expected_chk1() => {
                debug!(key2 = format_args!("{key2:#06x}"), "candidate accepted");
                hits.push(key2);
            }
            Ok(_) => trace!(key2 = format_args!("{key2:#06x}"), "chk1 mismatch"),
            Err(Error::Timeout) => {
                trace!(key2 = format_args!("{key2:#06x}"), "no response");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(hits)
}

/// Recover key1 for a known key2 by observing `(rotate, chk2)` pairs.
///
/// With key3 zero, `chk2 == ((key1[kr] << 4) ^ 0x7F39) & 0xFFFF`, so each
/// exchange solves one byte. The endpoint varies the rotate value per
/// exchange; `max_attempts` bounds the wait for all sixteen positions.
pub async fn bruteforce_key1(
    client: &mut DwdClient,
    key2: u16,
    max_attempts: u32,
) -> Result<[u8; 16]> {
    let probe = Keyset {
        key2,
        ..Keyset::ZERO
    };
    let mut known: [Option<u8>; 16] = [None; 16];

    for attempt in 0..max_attempts {
        let response = client.connect1_exchange(&probe).await?;
        if response.chk1 != expected_chk1() {
            return Err(Error::Protocol(format!(
                "endpoint rejected the key2 candidate {key2:#06x}"
            )));
        }

        let rotate = key_rotate(response.r6);
        let byte = ((response.chk2 ^ 0x7F39) >> 4) as u8;
        if known[rotate].is_none() {
            debug!(rotate, byte = format_args!("{byte:#04x}"), attempt, "solved key1 byte");
            known[rotate] = Some(byte);
        }

        if known.iter().all(Option::is_some) {
            let mut key1 = [0u8; 16];
            for (slot, solved) in key1.iter_mut().zip(known.iter()) {
                *slot = solved.expect("all positions solved");
            }
            return Ok(key1);
        }
    }

    Err(Error::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{PhoneSim, WrongChallenge};
    use sielink_test_harness::scripted_transport;

    #[tokio::test]
    async fn key2_scan_finds_the_real_key() {
        let secret = Keyset {
            key2: 0x0042,
            ..Keyset::ZERO
        };
        let (transport, handle) = scripted_transport();
        let sim = PhoneSim::new(secret).with_wrong_challenge(WrongChallenge::Silence);
        handle.respond_with(sim.into_responder());

        let mut client = DwdClient::new(Box::new(transport));
        client.v24(true).await.unwrap();

        // A narrow window around the real key keeps miss timeouts rare.
        let hits = bruteforce_key2(&mut client, 0x0040..=0x0044).await.unwrap();
        assert_eq!(hits, vec![0x0042]);
    }

    #[tokio::test]
    async fn key1_recovery_solves_all_positions() {
        let mut secret = Keyset::ZERO;
        secret.key2 = 0x1234;
        secret.key1 = [
            0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE, 0x0F, 0x1E, 0x2D, 0x3C, 0x4B, 0x5A,
            0x69, 0x78,
        ];
        let (transport, handle) = scripted_transport();
        let sim = PhoneSim::new(secret);
        handle.respond_with(sim.into_responder());

        let mut client = DwdClient::new(Box::new(transport));
        client.v24(true).await.unwrap();

        let key1 = bruteforce_key1(&mut client, 0x1234, 64).await.unwrap();
        assert_eq!(key1, secret.key1);
    }

    #[tokio::test]
    async fn key1_recovery_bounded_by_attempts() {
        let secret = Keyset {
            key2: 0x1234,
            ..Keyset::ZERO
        };
        let (transport, handle) = scripted_transport();
        let sim = PhoneSim::new(secret);
        handle.respond_with(sim.into_responder());

        let mut client = DwdClient::new(Box::new(transport));
        client.v24(true).await.unwrap();

        // Fewer attempts than rotate positions cannot finish.
        let result = bruteforce_key1(&mut client, 0x1234, 8).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
