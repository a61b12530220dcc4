//! The bit-exact snapshot stream format:
//!
//! ```text
//! MAGIC(4) = "CETE"
//! VERSION(1) = 0x01
//! REPEAT until EOF:
//!   RECORD_TAG(1)  // 0x00 user-kv, 0x01 metadata, 0xFF end-of-stream
//!   KEY_LEN(varint)  KEY_BYTES
//!   VAL_LEN(varint)  VAL_BYTES
//! END
//! ```
//!
//! Records within a tag group are written in ascending key order; groups are
//! written user-kv first, then metadata, then the end-of-stream tag. A
//! reader rejects streams with an unknown version or records trailing the
//! end-of-stream tag.

use crate::error::Error;

pub const MAGIC: [u8; 4] = *b"CETE";
pub const VERSION: u8 = 0x01;

const TAG_USER_KV: u8 = 0x00;
const TAG_METADATA: u8 = 0x01;
const TAG_END: u8 = 0xFF;

/// A fully decoded snapshot stream, in the order it appeared on the wire.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecodedSnapshot {
    pub user_kv: Vec<(Vec<u8>, Vec<u8>)>,
    pub metadata_kv: Vec<(Vec<u8>, Vec<u8>)>,
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, Error> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or_else(|| Error::Other(anyhow::anyhow!("truncated varint")))?;
        *pos += 1;
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::Other(anyhow::anyhow!("varint too long")));
        }
    }
    Ok(value)
}

fn write_record(out: &mut Vec<u8>, tag: u8, key: &[u8], value: &[u8]) {
    out.push(tag);
    write_varint(out, key.len() as u64);
    out.extend_from_slice(key);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

/// Encode a full snapshot. `user_kv` and `metadata_kv` must already be in
/// ascending key order (both `sled::Tree::iter()` and the in-memory
/// `BTreeMap` mirrors used by this crate provide that for free).
pub fn encode<'a>(
    user_kv: impl Iterator<Item = (&'a [u8], &'a [u8])>,
    metadata_kv: impl Iterator<Item = (&'a [u8], &'a [u8])>,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    for (k, v) in user_kv {
        write_record(&mut out, TAG_USER_KV, k, v);
    }
    for (k, v) in metadata_kv {
        write_record(&mut out, TAG_METADATA, k, v);
    }
    out.push(TAG_END);
    out
}

/// Decode a snapshot stream, rejecting unknown versions and any record
/// found after the end-of-stream tag.
pub fn decode(bytes: &[u8]) -> Result<DecodedSnapshot, Error> {
    if bytes.len() < MAGIC.len() + 1 || bytes[..MAGIC.len()] != MAGIC {
        return Err(Error::Other(anyhow::anyhow!("snapshot stream missing CETE magic")));
    }
    let version = bytes[MAGIC.len()];
    if version != VERSION {
        return Err(Error::Other(anyhow::anyhow!("unsupported snapshot version {}", version)));
    }

    let mut pos = MAGIC.len() + 1;
    let mut out = DecodedSnapshot::default();
    let mut ended = false;

    while pos < bytes.len() {
        let tag = bytes[pos];
        pos += 1;

        if tag == TAG_END {
            ended = true;
            break;
        }
        if ended {
            return Err(Error::Other(anyhow::anyhow!("record found after end-of-stream tag")));
        }

        let key_len = read_varint(bytes, &mut pos)? as usize;
        let key = bytes
            .get(pos..pos + key_len)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("truncated snapshot key")))?
            .to_vec();
        pos += key_len;

        let val_len = read_varint(bytes, &mut pos)? as usize;
        let value = bytes
            .get(pos..pos + val_len)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("truncated snapshot value")))?
            .to_vec();
        pos += val_len;

        match tag {
            TAG_USER_KV => out.user_kv.push((key, value)),
            TAG_METADATA => out.metadata_kv.push((key, value)),
            other => return Err(Error::Other(anyhow::anyhow!("unknown record tag {:#x}", other))),
        }
    }

    if !ended {
        return Err(Error::Other(anyhow::anyhow!("snapshot stream missing end-of-stream tag")));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_empty_snapshot() {
        let bytes = encode(std::iter::empty(), std::iter::empty());
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, DecodedSnapshot::default());
    }

    #[test]
    fn round_trips_both_namespaces_in_order() {
        let user: Vec<(Vec<u8>, Vec<u8>)> =
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())];
        let meta: Vec<(Vec<u8>, Vec<u8>)> = vec![(b"node-1".to_vec(), b"{}".to_vec())];

        let bytes = encode(
            user.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
            meta.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        );
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.user_kv, user);
        assert_eq!(decoded.metadata_kv, meta);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode(std::iter::empty(), std::iter::empty());
        bytes[MAGIC.len()] = 0x02;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn rejects_missing_magic() {
        assert!(decode(b"nope").is_err());
    }

    #[test]
    fn empty_values_round_trip() {
        let user: Vec<(Vec<u8>, Vec<u8>)> = vec![(b"k".to_vec(), b"".to_vec())];
        let bytes = encode(user.iter().map(|(k, v)| (k.as_slice(), v.as_slice())), std::iter::empty());
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.user_kv, user);
    }
}
