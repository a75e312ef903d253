//! Key codecs shared by every layer of the engine.
//!
//! User keys are memcomparable-encoded (grouped bytes with padding markers)
//! before they are compared against region boundaries; the planner works on
//! decoded keys while the split and import layers work on encoded ones.
//! Every boundary crossing goes through [`encode_bytes`]/[`decode_bytes`]
//! explicitly so the two key spaces never mix.

use crate::errors::{Error, Result};

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xff;
const ENC_PAD: u8 = 0x00;

const SIGN_MASK: u64 = 0x8000_0000_0000_0000;

const TABLE_PREFIX: u8 = b't';
const ROW_PREFIX_SEP: &[u8] = b"_r";
const INDEX_PREFIX_SEP: &[u8] = b"_i";

/// Length of a decoded table prefix: `t` + 8-byte table id.
pub const TABLE_PREFIX_LEN: usize = 9;

/// Memcomparable-encode a byte key.
///
/// The key is chopped into groups of 8 bytes; every group is padded to 8
/// with zero bytes and followed by a marker `0xff - pad_count`, so encoded
/// keys compare byte-wise in the same order as the originals.
pub fn encode_bytes(key: &[u8]) -> Vec<u8> {
    let cap = (key.len() / ENC_GROUP_SIZE + 1) * (ENC_GROUP_SIZE + 1);
    let mut out = Vec::with_capacity(cap);
    let mut idx = 0;
    while idx <= key.len() {
        let remain = key.len() - idx;
        let take = remain.min(ENC_GROUP_SIZE);
        out.extend_from_slice(&key[idx..idx + take]);
        let pad = ENC_GROUP_SIZE - take;
        out.extend(std::iter::repeat(ENC_PAD).take(pad));
        out.push(ENC_MARKER - pad as u8);
        idx += ENC_GROUP_SIZE;
    }
    out
}

/// Reverse of [`encode_bytes`].
pub fn decode_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / (ENC_GROUP_SIZE + 1) * ENC_GROUP_SIZE);
    let mut idx = 0;
    loop {
        let group = data
            .get(idx..idx + ENC_GROUP_SIZE + 1)
            .ok_or_else(|| Error::InvalidKey(format!("truncated encoded key, len {}", data.len())))?;
        let marker = group[ENC_GROUP_SIZE];
        let pad = (ENC_MARKER - marker) as usize;
        if pad > ENC_GROUP_SIZE {
            return Err(Error::InvalidKey(format!("invalid key padding marker {marker:#x}")));
        }
        let take = ENC_GROUP_SIZE - pad;
        out.extend_from_slice(&group[..take]);
        if pad > 0 {
            if group[take..ENC_GROUP_SIZE].iter().any(|&b| b != ENC_PAD) {
                return Err(Error::InvalidKey("non-zero padding byte".into()));
            }
            return Ok(out);
        }
        idx += ENC_GROUP_SIZE + 1;
    }
}

/// Order-preserving encoding of a signed integer (sign bit flipped,
/// big-endian).
pub fn encode_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ SIGN_MASK).to_be_bytes()
}

/// Reverse of [`encode_i64`].
pub fn decode_i64(data: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = data
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("expected 8 bytes for int, got {}", data.len())))?;
    Ok((u64::from_be_bytes(raw) ^ SIGN_MASK) as i64)
}

/// `t{table_id}` prefix owning every key of a table.
pub fn table_prefix(table_id: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(TABLE_PREFIX_LEN);
    out.push(TABLE_PREFIX);
    out.extend_from_slice(&encode_i64(table_id));
    out
}

/// `t{table_id}_r` prefix owning the row data of a table.
pub fn table_row_prefix(table_id: i64) -> Vec<u8> {
    let mut out = table_prefix(table_id);
    out.extend_from_slice(ROW_PREFIX_SEP);
    out
}

/// `t{table_id}_i{index_id}` prefix owning one index of a table.
pub fn table_index_prefix(table_id: i64, index_id: i64) -> Vec<u8> {
    let mut out = table_prefix(table_id);
    out.extend_from_slice(INDEX_PREFIX_SEP);
    out.extend_from_slice(&encode_i64(index_id));
    out
}

/// Full row key for an integer handle.
pub fn row_key_with_handle(table_id: i64, handle: i64) -> Vec<u8> {
    let mut out = table_row_prefix(table_id);
    out.extend_from_slice(&encode_i64(handle));
    out
}

/// Extract the table id from a decoded table key, or report which byte made
/// the key unparsable.
pub fn decode_table_id(key: &[u8]) -> Result<i64> {
    if key.len() < TABLE_PREFIX_LEN || key[0] != TABLE_PREFIX {
        return Err(Error::InvalidKey(format!(
            "not a table key (len {}, first byte {:#x})",
            key.len(),
            key.first().copied().unwrap_or(0)
        )));
    }
    decode_i64(&key[1..TABLE_PREFIX_LEN])
}

/// Byte-lexicographic successor of a finite key.
///
/// Appends a zero byte unless the key ends in `0xff`; a `0xff` tail is
/// stripped and the preceding byte incremented, which lands exactly on the
/// successor prefix. An all-`0xff` key has no incrementable byte and falls
/// back to appending.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return Vec::new();
    }
    if *key.last().expect("non-empty") != 0xff {
        let mut out = Vec::with_capacity(key.len() + 1);
        out.extend_from_slice(key);
        out.push(0);
        return out;
    }
    match key.iter().rposition(|&b| b != 0xff) {
        Some(pos) => {
            let mut out = key[..=pos].to_vec();
            out[pos] += 1;
            out
        }
        None => {
            let mut out = Vec::with_capacity(key.len() + 1);
            out.extend_from_slice(key);
            out.push(0);
            out
        }
    }
}

/// Whether `key` sorts before an end bound, treating an empty bound as +inf.
pub fn before_end(key: &[u8], end: &[u8]) -> bool {
    end.is_empty() || key < end
}

/// Whether `key` falls inside the half-open interval `[start, end)`, with
/// empty bounds meaning -inf / +inf.
pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    (start.is_empty() || key >= start) && before_end(key, end)
}

/// Compare two end bounds where an empty bound means +inf.
pub fn cmp_end_key(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// Compose a commit timestamp from wall-clock milliseconds (physical part
/// shifted past the logical bits).
pub fn compose_ts(physical_ms: u64) -> u64 {
    physical_ms << 18
}

/// Current wall-clock commit timestamp.
pub fn current_ts() -> u64 {
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    compose_ts(ms)
}
