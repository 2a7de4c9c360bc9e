//! File header, fork header, and info-fork wire codec (C3).
//!
//! Symmetric encode/decode functions for the three header shapes the
//! transfer subchannel uses, shared by both the download and upload clients.

use std::fs::Metadata;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::{HotlineError, Result};

pub const FORK_TYPE_INFO: u32 = 0x494E_464F;
pub const FORK_TYPE_DATA: u32 = 0x4441_5441;
pub const FORK_TYPE_MACR: u32 = 0x4D41_4352;

const FILE_HEADER_RESERVED: usize = 16;
const INFO_FORK_RESERVED: usize = 32;
/// The high two bytes of `"DATA"` — a known server bug that can leak into the comment-length field.
const CORRUPT_COMMENT_LEN_MARKER: u16 = 0x4441;

/// Seconds between the Unix epoch and the Macintosh epoch (1904-01-01T00:00:00Z).
const MAC_EPOCH_OFFSET_SECONDS: i64 = 2_082_844_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub fork_count: u16,
}

pub fn encode_file_header(fork_count: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 + FILE_HEADER_RESERVED + 2);
    out.extend_from_slice(b"FILP");
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0u8; FILE_HEADER_RESERVED]);
    out.extend_from_slice(&fork_count.to_be_bytes());
    out
}

pub fn decode_file_header(bytes: &[u8]) -> Result<FileHeader> {
    if bytes.len() < 4 + 2 + FILE_HEADER_RESERVED + 2 {
        return Err(HotlineError::DecodeFailed("file header too short".to_string()));
    }
    if &bytes[0..4] != b"FILP" {
        return Err(HotlineError::DecodeFailed(format!(
            "expected FILP signature, got {:?}",
            String::from_utf8_lossy(&bytes[0..4])
        )));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != 1 {
        return Err(HotlineError::DecodeFailed(format!("unsupported FILP version {version}")));
    }
    let fork_count = u16::from_be_bytes([bytes[22], bytes[23]]);
    Ok(FileHeader { fork_count })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkHeader {
    pub fork_type: u32,
    pub data_size: u32,
}

pub fn encode_fork_header(fork_type: u32, data_size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&fork_type.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // compressionType, always 0
    out.extend_from_slice(&[0u8; 4]); // reserved
    out.extend_from_slice(&data_size.to_be_bytes());
    out
}

pub fn decode_fork_header(bytes: &[u8]) -> Result<ForkHeader> {
    if bytes.len() < 16 {
        return Err(HotlineError::DecodeFailed("fork header too short".to_string()));
    }
    let fork_type = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let data_size = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    Ok(ForkHeader { fork_type, data_size })
}

/// In-memory representation of the decoded/encoded info fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoFork {
    pub platform: u32,
    pub file_type: u32,
    pub creator: u32,
    pub flags: u32,
    pub platform_flags: u32,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub name_script: u16,
    pub name: String,
    pub comment: Option<String>,
}

impl Default for InfoFork {
    fn default() -> Self {
        let now = SystemTime::now();
        Self {
            platform: 0,
            file_type: 0,
            creator: 0,
            flags: 0,
            platform_flags: 0,
            created: now,
            modified: now,
            name_script: 0,
            name: String::new(),
            comment: None,
        }
    }
}

/// Converts a `SystemTime` to Macintosh-epoch seconds, clamping to 0 if the
/// time predates the epoch (should not happen for real filesystem metadata).
pub fn to_mac_epoch_seconds(time: SystemTime) -> u64 {
    let unix_seconds = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    (unix_seconds + MAC_EPOCH_OFFSET_SECONDS).max(0) as u64
}

/// Converts Macintosh-epoch seconds back to a `SystemTime`.
pub fn from_mac_epoch_seconds(seconds: u64) -> SystemTime {
    let unix_seconds = seconds as i64 - MAC_EPOCH_OFFSET_SECONDS;
    if unix_seconds >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(unix_seconds as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs((-unix_seconds) as u64)
    }
}

pub fn encode_info_fork(info: &InfoFork) -> Vec<u8> {
    let name_bytes = info.name.as_bytes();
    let mut out = Vec::with_capacity(64 + name_bytes.len());
    out.extend_from_slice(&info.platform.to_be_bytes());
    out.extend_from_slice(&info.file_type.to_be_bytes());
    out.extend_from_slice(&info.creator.to_be_bytes());
    out.extend_from_slice(&info.flags.to_be_bytes());
    out.extend_from_slice(&info.platform_flags.to_be_bytes());
    out.extend_from_slice(&[0u8; INFO_FORK_RESERVED]);
    out.extend_from_slice(&to_mac_epoch_seconds(info.created).to_be_bytes());
    out.extend_from_slice(&to_mac_epoch_seconds(info.modified).to_be_bytes());
    out.extend_from_slice(&info.name_script.to_be_bytes());
    out.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(name_bytes);
    if let Some(comment) = &info.comment {
        let comment_bytes = comment.as_bytes();
        out.extend_from_slice(&(comment_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(comment_bytes);
    }
    out
}

/// Decodes an info fork payload, applying a corruption guard: if the
/// two bytes immediately after the name look like the start of a `"DATA"`
/// fork header rather than a plausible comment length, treat the comment as
/// absent and leave those bytes unconsumed for the caller (they belong to
/// the next fork header, not to this one).
///
/// Returns the decoded fields together with `headerSize`: the number of
/// leading bytes of `bytes` that actually belong to this info fork. A caller
/// that read more bytes than `headerSize` (because the server's fork-header
/// `dataSize` over-reported the info fork, the exact case the corruption
/// guard targets) must treat `bytes[headerSize..]` as unconsumed and feed it
/// back into the next read, or the frame desyncs by those bytes.
pub fn decode_info_fork(bytes: &[u8]) -> Result<(InfoFork, usize)> {
    const FIXED_LEN: usize = 4 + 4 + 4 + 4 + 4 + INFO_FORK_RESERVED + 8 + 8 + 2 + 2;
    if bytes.len() < FIXED_LEN {
        return Err(HotlineError::DecodeFailed("info fork too short".to_string()));
    }

    let platform = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let file_type = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let creator = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    let flags = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
    let platform_flags = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
    let mut offset = 20 + INFO_FORK_RESERVED;
    let created = from_mac_epoch_seconds(u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap()));
    offset += 8;
    let modified = from_mac_epoch_seconds(u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap()));
    offset += 8;
    let name_script = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap());
    offset += 2;
    let name_len = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap()) as usize;
    offset += 2;

    if bytes.len() < offset + name_len {
        return Err(HotlineError::DecodeFailed("info fork name truncated".to_string()));
    }
    let (name, _, _) = encoding_rs::MACINTOSH.decode(&bytes[offset..offset + name_len]);
    let name = name.into_owned();
    offset += name_len;
    let name_end = offset;

    let (comment, header_size) = if bytes.len() >= name_end + 2 {
        let candidate_len = u16::from_be_bytes(bytes[name_end..name_end + 2].try_into().unwrap());
        if candidate_len == CORRUPT_COMMENT_LEN_MARKER {
            tracing::debug!(target: "fork", "info fork comment-length guard triggered, treating comment as absent");
            (None, name_end)
        } else if bytes.len() >= name_end + 2 + candidate_len as usize {
            let start = name_end + 2;
            let end = start + candidate_len as usize;
            let (comment, _, _) = encoding_rs::MACINTOSH.decode(&bytes[start..end]);
            (Some(comment.into_owned()), end)
        } else {
            (None, name_end)
        }
    } else {
        (None, name_end)
    };

    Ok((
        InfoFork {
            platform,
            file_type,
            creator,
            flags,
            platform_flags,
            created,
            modified,
            name_script,
            name,
            comment,
        },
        header_size,
    ))
}

/// Data-fork and resource-fork sizes on disk. This crate's reference platform
/// has no native resource fork, so `resource_fork_size` reflects a
/// `<path>.rsrc` sidecar file if one exists, and 0 otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkSizes {
    pub data_fork_size: u64,
    pub resource_fork_size: u64,
}

pub fn read_fork_sizes(fs_path: &Path) -> Result<ForkSizes> {
    let metadata = std::fs::metadata(fs_path)?;
    let data_fork_size = metadata.len();
    let sidecar = sidecar_path(fs_path);
    let resource_fork_size = std::fs::metadata(&sidecar).map(|m| m.len()).unwrap_or(0);
    Ok(ForkSizes { data_fork_size, resource_fork_size })
}

/// The sidecar path used to retain a resource fork on this platform.
pub fn sidecar_path(fs_path: &Path) -> std::path::PathBuf {
    let mut os_string = fs_path.as_os_str().to_owned();
    os_string.push(".rsrc");
    std::path::PathBuf::from(os_string)
}

/// Fixed per-fork header overhead counted in `flattened_size`: one file
/// header plus one fork header per fork actually present.
fn header_overhead(fork_count: u16) -> u64 {
    (4 + 2 + FILE_HEADER_RESERVED + 2) as u64 + (fork_count as u64) * 16
}

/// Sum of both forks' bytes, an estimated info-fork size, and header
/// overhead — used by upload clients as the magic-header `dataSize` and the
/// progress total.
pub fn flattened_size(fs_path: &Path, info_fork_len: u64) -> Result<u64> {
    let sizes = read_fork_sizes(fs_path)?;
    let fork_count: u16 = if sizes.resource_fork_size > 0 { 3 } else { 2 };
    Ok(sizes.data_fork_size + sizes.resource_fork_size + info_fork_len + header_overhead(fork_count))
}

/// Builds an [`InfoFork`] for a local file using filesystem metadata,
/// defaulting absent creator/type codes to 0.
pub fn info_fork_from_metadata(name: &str, metadata: &Metadata) -> InfoFork {
    let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
    let created = metadata.created().unwrap_or(modified);
    InfoFork {
        platform: 0,
        file_type: 0,
        creator: 0,
        flags: 0,
        platform_flags: 0,
        created,
        modified,
        name_script: 0,
        name: name.to_string(),
        comment: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_round_trips() {
        let encoded = encode_file_header(3);
        let decoded = decode_file_header(&encoded).unwrap();
        assert_eq!(decoded.fork_count, 3);
    }

    #[test]
    fn fork_header_round_trips() {
        let encoded = encode_fork_header(FORK_TYPE_DATA, 4096);
        let decoded = decode_fork_header(&encoded).unwrap();
        assert_eq!(decoded.fork_type, FORK_TYPE_DATA);
        assert_eq!(decoded.data_size, 4096);
    }

    #[test]
    fn info_fork_round_trips_with_comment() {
        let info = InfoFork {
            platform: 1,
            file_type: u32::from_be_bytes(*b"PNGf"),
            creator: u32::from_be_bytes(*b"????"),
            flags: 0,
            platform_flags: 0,
            created: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000),
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000),
            name_script: 0,
            name: "logo.png".to_string(),
            comment: Some("a comment".to_string()),
        };
        let encoded = encode_info_fork(&info);
        let (decoded, header_size) = decode_info_fork(&encoded).unwrap();
        assert_eq!(decoded.name, "logo.png");
        assert_eq!(decoded.comment.as_deref(), Some("a comment"));
        assert_eq!(decoded.file_type, info.file_type);
        assert_eq!(to_mac_epoch_seconds(decoded.created), to_mac_epoch_seconds(info.created));
        assert_eq!(header_size, encoded.len());
    }

    #[test]
    fn info_fork_corruption_guard_treats_comment_as_absent_and_leaves_bytes_unconsumed() {
        let mut info = InfoFork {
            name: "t.bin".to_string(),
            ..Default::default()
        };
        info.comment = None;
        let mut encoded = encode_info_fork(&info);
        let name_end = encoded.len();
        // Append the corrupt marker bytes where a comment length would go,
        // simulating a server that over-reported dataSize by the start of
        // the next fork header's `"DATA"` type code.
        encoded.extend_from_slice(&CORRUPT_COMMENT_LEN_MARKER.to_be_bytes());
        let (decoded, header_size) = decode_info_fork(&encoded).unwrap();
        assert_eq!(decoded.comment, None);
        assert_eq!(header_size, name_end, "guard must not consume the marker bytes");
        assert_eq!(&encoded[header_size..], &CORRUPT_COMMENT_LEN_MARKER.to_be_bytes());
    }

    #[test]
    fn mac_epoch_round_trips_unix_epoch() {
        let seconds = to_mac_epoch_seconds(SystemTime::UNIX_EPOCH);
        assert_eq!(seconds, MAC_EPOCH_OFFSET_SECONDS as u64);
        let back = from_mac_epoch_seconds(seconds);
        assert_eq!(back, SystemTime::UNIX_EPOCH);
    }
}
