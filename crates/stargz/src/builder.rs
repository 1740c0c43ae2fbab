//! In-memory producer of indexed gzip-chunked tar archives.
//!
//! Exists so tests (here and downstream) can synthesize legal archives
//! without shelling out to an external tool. The emitted blob is a valid
//! gzipped tar: headers and payloads are framed so that every file chunk
//! starts its own gzip member at a recorded offset, the TOC is appended as
//! the final tar entry, and the 47-byte footer points at it.

use std::collections::HashMap;
use std::io::Write as _;

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest as _, Sha256};

use crate::toc::{PREFETCH_LANDMARK, TOC_TAR_NAME, TocEntry, TocEntryKind, TocIndex};
use crate::FOOTER_SIZE;

/// Byte filling the landmark file's payload.
const LANDMARK_CONTENTS: u8 = 0xf;

/// Builds an archive entry by entry. Entries are laid out in insertion
/// order; place `add_landmark` after the files that should be eagerly
/// prefetched.
pub struct Builder {
    out: Vec<u8>,
    entries: Vec<TocEntry>,
    chunk_size: u64,
    mod_time: String,
}

impl Builder {
    /// Create a builder splitting file payloads into `chunk_size`-byte
    /// chunks.
    #[must_use]
    pub fn new(chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            out: Vec::new(),
            entries: Vec::new(),
            chunk_size,
            mod_time: String::new(),
        }
    }

    /// Timestamp recorded on subsequently added entries, UTC RFC 3339.
    pub fn set_mod_time(&mut self, mod_time: &str) {
        self.mod_time = mod_time.to_owned();
    }

    pub fn add_dir(&mut self, name: &str, mode: u32, uid: u32, gid: u32) {
        self.append_member(&tar_header(&format!("{name}/"), 0, b'5', mode));
        self.entries.push(TocEntry {
            name: name.to_owned(),
            kind: TocEntryKind::Dir,
            mode,
            uid,
            gid,
            mod_time: self.mod_time.clone(),
            ..TocEntry::default()
        });
    }

    pub fn add_file(&mut self, name: &str, data: &[u8], mode: u32) {
        self.add_file_with(name, data, mode, 0, 0, &HashMap::new());
    }

    pub fn add_file_with(
        &mut self,
        name: &str,
        data: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        xattrs: &HashMap<String, Vec<u8>>,
    ) {
        use base64::Engine as _;

        self.append_member(&tar_header(name, data.len() as u64, b'0', mode));

        let digest = sha256_digest(data);
        let size = data.len() as u64;
        let mut chunk_offset = 0_u64;
        let mut first = true;
        while chunk_offset < size || (first && size == 0) {
            let chunk_len = self.chunk_size.min(size - chunk_offset);
            let chunk =
                &data[chunk_offset as usize..(chunk_offset + chunk_len) as usize];
            let offset = if size == 0 { 0 } else { self.out.len() as u64 };
            if size > 0 {
                let last = chunk_offset + chunk_len == size;
                // Tar padding rides in the final chunk's member; readers
                // only ever pull chunk_size bytes out of it.
                let padding = if last { tar_padding_len(size) } else { 0 };
                let mut member = Vec::with_capacity(chunk.len() + padding);
                member.extend_from_slice(chunk);
                member.resize(chunk.len() + padding, 0);
                self.append_member(&member);
            }

            if first {
                let wire_xattrs = xattrs
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            base64::engine::general_purpose::STANDARD.encode(v),
                        )
                    })
                    .collect();
                self.entries.push(TocEntry {
                    name: name.to_owned(),
                    kind: TocEntryKind::Reg,
                    size,
                    mode,
                    uid,
                    gid,
                    mod_time: self.mod_time.clone(),
                    xattrs: wire_xattrs,
                    digest: digest.clone(),
                    offset,
                    chunk_size: if chunk_len == size { 0 } else { chunk_len },
                    chunk_digest: sha256_digest(chunk),
                    ..TocEntry::default()
                });
            } else {
                self.entries.push(TocEntry {
                    name: name.to_owned(),
                    kind: TocEntryKind::Chunk,
                    offset,
                    chunk_offset,
                    chunk_size: chunk_len,
                    chunk_digest: sha256_digest(chunk),
                    ..TocEntry::default()
                });
            }
            first = false;
            chunk_offset += chunk_len;
            if size == 0 {
                break;
            }
        }
    }

    pub fn add_symlink(&mut self, name: &str, target: &str) {
        self.append_member(&tar_header(name, 0, b'2', 0o777));
        self.entries.push(TocEntry {
            name: name.to_owned(),
            kind: TocEntryKind::Symlink,
            link_name: target.to_owned(),
            mode: 0o777,
            mod_time: self.mod_time.clone(),
            ..TocEntry::default()
        });
    }

    pub fn add_hardlink(&mut self, name: &str, target: &str) {
        self.append_member(&tar_header(name, 0, b'1', 0o644));
        self.entries.push(TocEntry {
            name: name.to_owned(),
            kind: TocEntryKind::Hardlink,
            link_name: target.to_owned(),
            mod_time: self.mod_time.clone(),
            ..TocEntry::default()
        });
    }

    /// Append the reserved landmark entry. Everything added before this call
    /// falls inside the eager-prefetch prefix.
    pub fn add_landmark(&mut self) {
        self.add_file(PREFETCH_LANDMARK, &[LANDMARK_CONTENTS; 512], 0o644);
    }

    /// Serialize the TOC, append the footer, and return the finished blob.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        let toc_offset = self.out.len() as u64;

        let index = TocIndex {
            version: 1,
            entries: std::mem::take(&mut self.entries),
        };
        let json = serde_json::to_vec(&index).unwrap_or_default();

        let mut toc_member = Vec::new();
        toc_member.extend_from_slice(&tar_header(TOC_TAR_NAME, json.len() as u64, b'0', 0o444));
        toc_member.extend_from_slice(&json);
        toc_member.resize(toc_member.len() + tar_padding_len(json.len() as u64), 0);
        // End-of-archive marker: two zero blocks.
        toc_member.resize(toc_member.len() + 1024, 0);
        self.append_member(&toc_member);

        self.out.extend_from_slice(&footer_bytes(toc_offset));
        self.out
    }

    fn append_member(&mut self, payload: &[u8]) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        // Writing into a Vec cannot fail.
        let _ = encoder.write_all(payload);
        let member = encoder.finish().unwrap_or_default();
        self.out.extend_from_slice(&member);
    }
}

fn sha256_digest(data: &[u8]) -> String {
    let sum = Sha256::digest(data);
    let mut out = String::with_capacity(7 + 64);
    out.push_str("sha256:");
    for byte in sum {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn tar_padding_len(size: u64) -> usize {
    ((512 - (size % 512)) % 512) as usize
}

/// A minimal ustar header block. Only the fields the TOC does not already
/// carry matter to readers; the checksum keeps external tar tools happy.
fn tar_header(name: &str, size: u64, typeflag: u8, mode: u32) -> [u8; 512] {
    let mut block = [0_u8; 512];

    let name_bytes = name.as_bytes();
    let name_len = name_bytes.len().min(100);
    block[..name_len].copy_from_slice(&name_bytes[..name_len]);

    write_octal(&mut block[100..108], u64::from(mode & 0o7777));
    write_octal(&mut block[108..116], 0); // uid
    write_octal(&mut block[116..124], 0); // gid
    write_octal(&mut block[124..136], size);
    write_octal(&mut block[136..148], 0); // mtime
    block[156] = typeflag;
    block[257..262].copy_from_slice(b"ustar");
    block[263..265].copy_from_slice(b"00");

    // Checksum is computed with the checksum field treated as spaces.
    block[148..156].fill(b' ');
    let sum: u64 = block.iter().map(|&b| u64::from(b)).sum();
    let digits = format!("{sum:06o}\0 ");
    block[148..156].copy_from_slice(digits.as_bytes());

    block
}

fn write_octal(field: &mut [u8], value: u64) {
    let width = field.len() - 1;
    let digits = format!("{value:0width$o}");
    field[..width].copy_from_slice(&digits.as_bytes()[digits.len() - width..]);
    field[width] = 0;
}

/// The fixed 47-byte footer: an empty gzip member whose header extra field
/// records the TOC offset as 16 hex digits followed by `STARGZ`.
fn footer_bytes(toc_offset: u64) -> [u8; FOOTER_SIZE as usize] {
    let mut footer = [0_u8; FOOTER_SIZE as usize];
    // Gzip header: magic, deflate, FEXTRA, zero mtime, no flags, unknown OS.
    footer[..10].copy_from_slice(&[0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff]);
    footer[10..12].copy_from_slice(&22_u16.to_le_bytes());
    let extra = format!("{toc_offset:016x}STARGZ");
    footer[12..34].copy_from_slice(extra.as_bytes());
    // Empty final stored deflate block, then zero CRC32 and ISIZE.
    footer[34..39].copy_from_slice(&[0x01, 0x00, 0x00, 0xff, 0xff]);
    footer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_footer;

    #[test]
    fn footer_round_trips() {
        let footer = footer_bytes(0xdead_beef);
        assert_eq!(parse_footer(&footer).unwrap(), 0xdead_beef);
    }

    #[test]
    fn tar_header_checksum_is_consistent() {
        let block = tar_header("etc/os-release", 300, b'0', 0o644);
        let mut copy = block;
        copy[148..156].fill(b' ');
        let sum: u64 = copy.iter().map(|&b| u64::from(b)).sum();
        let recorded = std::str::from_utf8(&block[148..154]).unwrap();
        assert_eq!(u64::from_str_radix(recorded, 8).unwrap(), sum);
    }

    #[test]
    fn empty_file_gets_no_chunks() {
        let mut builder = Builder::new(4);
        builder.add_file("empty", b"", 0o644);
        let entry = builder
            .entries
            .iter()
            .find(|e| e.name == "empty")
            .cloned()
            .unwrap();
        assert_eq!(entry.size, 0);
        assert_eq!(entry.offset, 0);
    }
}
