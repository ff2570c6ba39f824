//! A scripted DWD phone for tests.
//!
//! Decapsulates request envelopes, runs the phone side of the keyed
//! handshake, and serves a small word-addressable memory. The rotate
//! value advances on every stage-1 exchange so bruteforce loops observe
//! all sixteen positions.

use std::collections::HashMap;

use crate::envelope::{decapsulate, encapsulate};
use crate::frame::{
    make_frame, CONNECT1_REQ, CONNECT1_RESP, CONNECT2_REQ, CONNECT2_RESP, READ_REQ, READ_RESP,
    SW_RESET, SW_VERSION_REQ, SW_VERSION_RESP, WRITE_REQ, WRITE_RESP,
};
use crate::keys::{connect2_proof, expected_chk2, Keyset};

/// How the simulated phone reacts to a stage-1 challenge that does not
/// match its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrongChallenge {
    /// Respond with a valid chk1 but a corrupted chk2 (the common
    /// firmware behavior; lets callers observe the chk1/chk2 split).
    Respond,
    /// Ignore the frame entirely (firmware that drops bad challenges;
    /// what key2 bruteforcing relies on).
    Silence,
}

/// The phone side of the DWD protocol.
pub struct PhoneSim {
    keyset: Keyset,
    words: HashMap<u32, u32>,
    kr_counter: u16,
    last_kr: usize,
    wrong_challenge: WrongChallenge,
    /// Writes touching this address answer a non-zero status.
    pub fail_writes_at: Option<u32>,
}

impl PhoneSim {
    pub fn new(keyset: Keyset) -> PhoneSim {
        PhoneSim {
            keyset,
            words: HashMap::new(),
            kr_counter: 0,
            last_kr: 0,
            wrong_challenge: WrongChallenge::Respond,
            fail_writes_at: None,
        }
    }

    pub fn with_wrong_challenge(mut self, behavior: WrongChallenge) -> PhoneSim {
        self.wrong_challenge = behavior;
        self
    }

    /// Pre-load a memory word (reads elsewhere return the low address
    /// byte as a recognisable pattern).
    pub fn set_word(&mut self, addr: u32, value: u32) {
        self.words.insert(addr, value);
    }

    fn mem_byte(&self, addr: u32) -> u8 {
        let word_addr = addr & !3;
        match self.words.get(&word_addr) {
            Some(word) => word.to_le_bytes()[(addr & 3) as usize],
            None => addr as u8,
        }
    }

    /// Turn the simulator into a `ScriptedTransport` responder.
    pub fn into_responder(mut self) -> impl FnMut(&[u8]) -> Vec<u8> + Send {
        move |data: &[u8]| self.handle(data)
    }

    fn handle(&mut self, data: &[u8]) -> Vec<u8> {
        // The V24 toggle is written literally, outside the envelope.
        if data.len() == 9
            && data.starts_with(&[0x41, 0x54, 0x23])
            && (data[3] == 0xFD || data[3] == 0xFE)
        {
            // A stray byte for the caller's drain to eat.
            return vec![0x00];
        }

        let Ok(body) = decapsulate(data) else {
            return Vec::new();
        };
        if body.len() < 2 {
            return Vec::new();
        }
        let opcode = u16::from_le_bytes([body[0], body[1]]);
        let word = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]);

        match opcode {
            CONNECT1_REQ => {
                let rand1 = word(2);
                let challenge = word(4);
                let rand2 = word(6);

                let expected = (self.keyset.key4 ^ self.keyset.key2 ^ rand1)
                    .wrapping_add(rand2)
                    .wrapping_add(0x4ED5);
                let challenge_ok = challenge == expected;
                if !challenge_ok && self.wrong_challenge == WrongChallenge::Silence {
                    return Vec::new();
                }

                let rotate = (self.kr_counter & 0xF) as usize;
                self.kr_counter = self.kr_counter.wrapping_add(1);
                self.last_kr = rotate;

                let chk1 = (((rand1 as u32 * 8).wrapping_sub(rand2 as u32)) ^ 0xD427) as u16;
                let r6 = rand2.wrapping_add(rotate as u16);
                let chk2 = if challenge_ok {
                    expected_chk2(&self.keyset, rotate)
                } else {
                    expected_chk2(&self.keyset, rotate) ^ 0xFFFF
                };

                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&rand1.to_le_bytes());
                payload.extend_from_slice(&chk1.to_le_bytes());
                payload.extend_from_slice(&r6.to_le_bytes());
                payload.extend_from_slice(&chk2.to_le_bytes());
                encapsulate(&make_frame(CONNECT1_RESP, &payload))
            }
            CONNECT2_REQ => {
                let proof = word(4);
                if proof == connect2_proof(&self.keyset, self.last_kr) {
                    encapsulate(&make_frame(CONNECT2_RESP, &[0x00, 0x00]))
                } else {
                    Vec::new()
                }
            }
            READ_REQ => {
                let size = word(2) as u32;
                let addr = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let mut payload = Vec::with_capacity(2 + size as usize);
                payload.extend_from_slice(&(size as u16).to_le_bytes());
                payload.extend((0..size).map(|i| self.mem_byte(addr.wrapping_add(i))));
                encapsulate(&make_frame(READ_RESP, &payload))
            }
            WRITE_REQ => {
                let size = word(2) as usize;
                let addr = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let data = &body[8..8 + size];
                let status: u16 = if self.fail_writes_at == Some(addr) {
                    0x0001
                } else {
                    for (i, &byte) in data.iter().enumerate() {
                        let byte_addr = addr.wrapping_add(i as u32);
                        let word_addr = byte_addr & !3;
                        let mut value = self
                            .words
                            .get(&word_addr)
                            .copied()
                            .unwrap_or(0)
                            .to_le_bytes();
                        value[(byte_addr & 3) as usize] = byte;
                        self.words.insert(word_addr, u32::from_le_bytes(value));
                    }
                    0x0000
                };
                encapsulate(&make_frame(WRITE_RESP, &status.to_le_bytes()))
            }
            SW_VERSION_REQ => {
                let text = b"APOXI_2.2.0";
                let mut payload = Vec::with_capacity(2 + text.len());
                payload.extend_from_slice(&(text.len() as u16).to_le_bytes());
                payload.extend_from_slice(text);
                encapsulate(&make_frame(SW_VERSION_RESP, &payload))
            }
            SW_RESET => Vec::new(),
            _ => Vec::new(),
        }
    }
}
