//! Wire-format types for the archive table of contents.
//!
//! The TOC is a JSON document stored as the final tar entry of the archive
//! (`stargz.index.json`). Field names and semantics follow the CRFS/eStargz
//! convention; unknown fields are ignored so newer producers stay readable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the tar entry holding the serialized TOC.
pub const TOC_TAR_NAME: &str = "stargz.index.json";

/// Name of the reserved entry marking the end of the eager-prefetch prefix.
pub const PREFETCH_LANDMARK: &str = ".prefetch.landmark";

/// The kind of a tar entry as recorded in the TOC.
///
/// `Chunk` is not a real entry kind: it marks a continuation chunk of the
/// preceding regular file and is folded into that file's chunk list during
/// index construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TocEntryKind {
    Dir,
    #[default]
    Reg,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
    Socket,
    Chunk,
}

/// One entry of the deserialized TOC.
///
/// A regular file larger than the producer's chunk size is followed by
/// `chunk`-typed entries carrying the remaining pieces. `offset` is the
/// position of the gzip member holding the entry's (or chunk's) payload
/// within the compressed blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TocEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: TocEntryKind,

    #[serde(skip_serializing_if = "is_zero_u64")]
    pub size: u64,

    /// Modification time in UTC RFC 3339 format. Empty means epoch.
    #[serde(rename = "modtime", skip_serializing_if = "String::is_empty")]
    pub mod_time: String,

    /// Link target. Set for symlinks and hardlinks.
    #[serde(rename = "linkName", skip_serializing_if = "String::is_empty")]
    pub link_name: String,

    /// Permission bits, including setuid/setgid/sticky. Type bits are
    /// carried by `kind`, not here.
    pub mode: u32,

    pub uid: u32,
    pub gid: u32,

    #[serde(rename = "devMajor", skip_serializing_if = "is_zero_u32")]
    pub dev_major: u32,

    #[serde(rename = "devMinor", skip_serializing_if = "is_zero_u32")]
    pub dev_minor: u32,

    /// Extended attributes; values are base64-encoded on the wire.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub xattrs: HashMap<String, String>,

    /// Digest of the decompressed file contents, `sha256:<hex>`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub digest: String,

    /// Offset of the gzip member holding this entry's payload in the blob.
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub offset: u64,

    /// Offset of this chunk within the decompressed file.
    #[serde(rename = "chunkOffset", skip_serializing_if = "is_zero_u64")]
    pub chunk_offset: u64,

    /// Decompressed size of this chunk. Zero on the final (or only) chunk
    /// means "up to the end of the file".
    #[serde(rename = "chunkSize", skip_serializing_if = "is_zero_u64")]
    pub chunk_size: u64,

    /// Digest of this chunk's decompressed bytes, `sha256:<hex>`.
    #[serde(rename = "chunkDigest", skip_serializing_if = "String::is_empty")]
    pub chunk_digest: String,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// The top-level TOC document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocIndex {
    pub version: u32,
    pub entries: Vec<TocEntry>,
}

/// Parse a UTC RFC 3339 timestamp into `(unix_seconds, nanos)`.
///
/// Accepts `YYYY-MM-DDTHH:MM:SS`, an optional fractional-second part, and a
/// `Z` or `±HH:MM` offset. Returns `None` on malformed input; callers treat
/// that (and the empty string) as the epoch.
pub fn parse_rfc3339(s: &str) -> Option<(i64, u32)> {
    let b = s.as_bytes();
    if b.len() < 20 {
        return None;
    }
    let num = |r: std::ops::Range<usize>| -> Option<i64> {
        s.get(r)?.parse::<i64>().ok()
    };
    if b[4] != b'-' || b[7] != b'-' || (b[10] != b'T' && b[10] != b't') {
        return None;
    }
    if b[13] != b':' || b[16] != b':' {
        return None;
    }
    let (year, month, day) = (num(0..4)?, num(5..7)?, num(8..10)?);
    let (hour, min, sec) = (num(11..13)?, num(14..16)?, num(17..19)?);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    if hour > 23 || min > 59 || sec > 60 {
        return None;
    }

    let mut idx = 19;
    let mut nanos: u32 = 0;
    if b.get(idx) == Some(&b'.') {
        idx += 1;
        let start = idx;
        while idx < b.len() && b[idx].is_ascii_digit() {
            idx += 1;
        }
        let frac = s.get(start..idx)?;
        if frac.is_empty() {
            return None;
        }
        let mut val: u64 = frac.parse().ok()?;
        // Scale to nanoseconds regardless of the written precision.
        for _ in frac.len()..9 {
            val *= 10;
        }
        for _ in 9..frac.len() {
            val /= 10;
        }
        nanos = u32::try_from(val).ok()?;
    }

    let offset_secs: i64 = match b.get(idx)? {
        b'Z' | b'z' => {
            if idx + 1 != b.len() {
                return None;
            }
            0
        }
        sign @ (b'+' | b'-') => {
            if idx + 6 != b.len() || b[idx + 3] != b':' {
                return None;
            }
            let oh = num(idx + 1..idx + 3)?;
            let om = num(idx + 4..idx + 6)?;
            let total = oh * 3600 + om * 60;
            if *sign == b'+' { total } else { -total }
        }
        _ => return None,
    };

    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hour * 3600 + min * 60 + sec - offset_secs;
    Some((secs, nanos))
}

/// Days since 1970-01-01 for a proleptic-Gregorian civil date.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
