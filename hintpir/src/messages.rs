//! Payload codecs for the query and update messages.
//!
//! Every decoder checks the exact payload length against the session
//! parameters; a mismatch is a malformed message and aborts the session.

use crate::error::{PirError, Result};
use crate::params::Params;

/// Punctured offsets as little-endian `u16`s.
pub fn encode_offsets(offsets: &[usize]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * offsets.len());
    for &offset in offsets {
        out.extend_from_slice(&(offset as u16).to_le_bytes());
    }
    out
}

/// Decode a non-empty query into `m̄ - 1` offsets, each below `w`.
pub fn decode_offsets(params: &Params, payload: &[u8]) -> Result<Vec<usize>> {
    if payload.len() != params.query_bytes() {
        return Err(PirError::abort(format!(
            "query length {} != {}",
            payload.len(),
            params.query_bytes()
        )));
    }
    payload
        .chunks_exact(2)
        .map(|pair| {
            let offset = u16::from_le_bytes([pair[0], pair[1]]) as usize;
            if offset >= params.block_size {
                return Err(PirError::abort(format!(
                    "offset {offset} outside block of {}",
                    params.block_size
                )));
            }
            Ok(offset)
        })
        .collect()
}

/// `index (u32 LE) | delta`.
pub fn encode_update(index: usize, delta: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + delta.len());
    out.extend_from_slice(&(index as u32).to_le_bytes());
    out.extend_from_slice(delta);
    out
}

pub fn decode_update(params: &Params, payload: &[u8]) -> Result<(usize, Vec<u8>)> {
    if payload.len() != 4 + params.entry_size {
        return Err(PirError::abort(format!(
            "update length {} != {}",
            payload.len(),
            4 + params.entry_size
        )));
    }
    let index = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if index >= params.num_entries {
        return Err(PirError::abort(format!(
            "update index {index} outside database of {}",
            params.num_entries
        )));
    }
    Ok((index, payload[4..].to_vec()))
}

/// Control byte sent after each batch.
pub fn encode_refresh(refresh: bool) -> Vec<u8> {
    vec![refresh as u8]
}

pub fn decode_refresh(payload: &[u8]) -> Result<bool> {
    match payload {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(PirError::abort("malformed refresh control message")),
    }
}

#[inline]
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params::new(100, 8, None).unwrap()
    }

    #[test]
    fn offsets_wire_layout() {
        let p = params();
        let offsets: Vec<usize> = (0..p.num_blocks - 1).map(|k| k % p.block_size).collect();
        let bytes = encode_offsets(&offsets);
        assert_eq!(bytes.len(), p.query_bytes());
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(decode_offsets(&p, &bytes).unwrap(), offsets);
    }

    #[test]
    fn offsets_reject_bad_shape() {
        let p = params();
        assert!(decode_offsets(&p, &[0u8; 3]).is_err());
        let mut bytes = vec![0u8; p.query_bytes()];
        bytes[0] = p.block_size as u8;
        assert!(matches!(decode_offsets(&p, &bytes), Err(PirError::Abort(_))));
    }

    #[test]
    fn update_wire_layout() {
        let p = params();
        let bytes = encode_update(0x42, &[0xaa; 8]);
        assert_eq!(&bytes[0..4], &[0x42, 0, 0, 0]);
        let (index, delta) = decode_update(&p, &bytes).unwrap();
        assert_eq!(index, 0x42);
        assert_eq!(delta, vec![0xaa; 8]);
    }

    #[test]
    fn update_rejects_short_or_out_of_range() {
        let p = params();
        assert!(decode_update(&p, &[0u8; 11]).is_err());
        assert!(decode_update(&p, &encode_update(100, &[0u8; 8])).is_err());
    }

    #[test]
    fn refresh_control() {
        assert!(!decode_refresh(&encode_refresh(false)).unwrap());
        assert!(decode_refresh(&encode_refresh(true)).unwrap());
        assert!(decode_refresh(&[]).is_err());
        assert!(decode_refresh(&[2]).is_err());
    }

    #[test]
    fn xor_is_involutive() {
        let mut a = vec![0x12u8; 16];
        let b = vec![0x34u8; 16];
        xor_into(&mut a, &b);
        xor_into(&mut a, &b);
        assert_eq!(a, vec![0x12u8; 16]);
    }
}
