//! Script construction helpers.
//!
//! The harness never executes scripts; it only needs to build the handful of
//! locking and unlocking scripts its wallets use and to recognise them again
//! when scanning outputs.

use crate::crypto::{sha256, COMPRESSED_PUBLIC_KEY_SIZE};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_TRUE: u8 = 0x51;
pub const OP_NOP: u8 = 0x61;
pub const OP_DROP: u8 = 0x75;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_CHECKSIG: u8 = 0xac;

// Append a minimal push of `data`
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

// Append a minimal push of a small integer, as used in coinbase heights
pub fn push_int(script: &mut Vec<u8>, value: i64) {
    if value == 0 {
        script.push(OP_0);
        return;
    }
    if value == -1 {
        script.push(OP_1NEGATE);
        return;
    }
    if (1..=16).contains(&value) {
        script.push(OP_TRUE - 1 + value as u8);
        return;
    }

    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut bytes = Vec::new();
    while abs > 0 {
        bytes.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    // Keep the sign bit free
    if bytes.last().map_or(false, |b| b & 0x80 != 0) {
        bytes.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        if let Some(last) = bytes.last_mut() {
            *last |= 0x80;
        }
    }
    push_data(script, &bytes);
}

pub fn op_true_script() -> Vec<u8> {
    vec![OP_TRUE]
}

// Version 0 witness program committing to `witness_script`
pub fn p2wsh_script(witness_script: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(34);
    script.push(OP_0);
    push_data(&mut script, &sha256(witness_script));
    script
}

pub fn p2pk_script(public_key: &[u8; COMPRESSED_PUBLIC_KEY_SIZE]) -> Vec<u8> {
    let mut script = Vec::with_capacity(35);
    push_data(&mut script, public_key);
    script.push(OP_CHECKSIG);
    script
}

// Anyone-can-spend script made unique by a tag, so distinct owners get distinct outputs
pub fn tagged_op_true_script(tag: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(tag.len() + 3);
    push_data(&mut script, tag);
    script.push(OP_DROP);
    script.push(OP_TRUE);
    script
}

pub fn op_return_script(data: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_RETURN];
    push_data(&mut script, data);
    script
}
