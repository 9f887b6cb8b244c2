// src/checksum.rs
//
// Additive checksum over the 16-byte logical payload.
//
// The adapter protocol uses a plain modulo-256 sum with no seed or polynomial.
// The checksum is always computed over the payload BEFORE escaping; the wire
// frame carries it raw after the escaped payload.

/// sum(bytes) & 0xFF over the 16 logical payload bytes.
pub fn sum8(payload: &[u8; 16]) -> u8 {
    payload
        .iter()
        .fold(0u8, |acc, &byte| acc.wrapping_add(byte))
}
