//! `.nmpack` wire format: header, index records, and their little-endian
//! encoding.
//!
//! ```text
//! "NMPK" (4) | version u16 | flags u16 | resource_count u32
//! index_offset u64 | data_offset u64 | index_crc32 u32
//! [data section: concatenated payloads]
//! [index section: resource_count records, each =
//!   path_len u16 | path utf8[path_len] | type u8 | res_flags u32 |
//!   offset u64 | compressed_size u64 | original_size u64 |
//!   crc32 u32 | sha256[32] | iv[12]]
//! [optional RSA signature trailer: sig_len u32 | sig_bytes[sig_len]]
//! ```
//!
//! `offset` is absolute within the file. The IV field is always present and
//! all-zero for unencrypted resources. The header's `index_crc32` covers the
//! serialized index section exactly.

use thiserror::Error;

pub const NMPK_MAGIC: [u8; 4] = *b"NMPK";
pub const NMPK_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 2 + 4 + 8 + 8 + 4;

/// Pack-level flags (header `flags` field).
pub const PACK_FLAG_SIGNED: u16 = 0x0001;
pub const PACK_FLAG_ENCRYPTED: u16 = 0x0002;

/// Per-resource flags (`res_flags` field).
pub const RES_FLAG_COMPRESSED: u32 = 0x0000_0001;
pub const RES_FLAG_ENCRYPTED: u32 = 0x0000_0002;
pub const RES_FLAG_STREAMABLE: u32 = 0x0000_0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceType {
    Data = 0,
    Script = 1,
    Image = 2,
    Audio = 3,
    Font = 4,
    Video = 5,
    Text = 6,
}

impl ResourceType {
    pub fn from_u8(byte: u8) -> ResourceType {
        match byte {
            1 => ResourceType::Script,
            2 => ResourceType::Image,
            3 => ResourceType::Audio,
            4 => ResourceType::Font,
            5 => ResourceType::Video,
            6 => ResourceType::Text,
            _ => ResourceType::Data,
        }
    }

    /// Infer from a file extension, defaulting to opaque data.
    pub fn from_extension(path: &str) -> ResourceType {
        let ext = path.rsplit('.').next().unwrap_or_default();
        match ext {
            "nmbc" | "bin" => ResourceType::Script,
            "png" | "jpg" | "jpeg" | "webp" | "bmp" => ResourceType::Image,
            "ogg" | "wav" | "mp3" | "flac" => ResourceType::Audio,
            "ttf" | "otf" | "woff" | "woff2" => ResourceType::Font,
            "webm" | "mp4" => ResourceType::Video,
            "json" | "txt" | "csv" => ResourceType::Text,
            _ => ResourceType::Data,
        }
    }

    /// Large sequential media defaults to streamable.
    pub fn default_streamable(self) -> bool {
        matches!(self, ResourceType::Audio | ResourceType::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u16,
    pub flags: u16,
    pub resource_count: u32,
    pub index_offset: u64,
    pub data_offset: u64,
    pub index_crc32: u32,
}

/// On-disk index record for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackResource {
    pub vfs_path: String,
    pub resource_type: ResourceType,
    pub flags: u32,
    pub offset: u64,
    pub compressed_size: u64,
    pub original_size: u64,
    pub crc32: u32,
    pub sha256: [u8; 32],
    pub iv: [u8; 12],
}

impl PackResource {
    pub fn is_compressed(&self) -> bool {
        self.flags & RES_FLAG_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & RES_FLAG_ENCRYPTED != 0
    }

    pub fn is_streamable(&self) -> bool {
        self.flags & RES_FLAG_STREAMABLE != 0
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic: not an .nmpack file")]
    BadMagic,
    #[error("unsupported pack version {0}")]
    UnsupportedVersion(u16),
    #[error("corrupt index: {0}")]
    CorruptIndex(&'static str),
    #[error("corrupt index: checksum mismatch (header {expected:#010x}, computed {computed:#010x})")]
    IndexChecksum { expected: u32, computed: u32 },
}

pub fn write_header(out: &mut Vec<u8>, header: &PackHeader) {
    out.extend_from_slice(&NMPK_MAGIC);
    out.extend_from_slice(&header.version.to_le_bytes());
    out.extend_from_slice(&header.flags.to_le_bytes());
    out.extend_from_slice(&header.resource_count.to_le_bytes());
    out.extend_from_slice(&header.index_offset.to_le_bytes());
    out.extend_from_slice(&header.data_offset.to_le_bytes());
    out.extend_from_slice(&header.index_crc32.to_le_bytes());
}

pub fn read_header(bytes: &[u8]) -> Result<PackHeader, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::BadMagic);
    }
    if bytes[0..4] != NMPK_MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != NMPK_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(PackHeader {
        version,
        flags: u16::from_le_bytes([bytes[6], bytes[7]]),
        resource_count: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        index_offset: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
        data_offset: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
        index_crc32: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
    })
}

pub fn write_index(resources: &[PackResource]) -> Vec<u8> {
    let mut out = Vec::new();
    for res in resources {
        out.extend_from_slice(&(res.vfs_path.len() as u16).to_le_bytes());
        out.extend_from_slice(res.vfs_path.as_bytes());
        out.push(res.resource_type as u8);
        out.extend_from_slice(&res.flags.to_le_bytes());
        out.extend_from_slice(&res.offset.to_le_bytes());
        out.extend_from_slice(&res.compressed_size.to_le_bytes());
        out.extend_from_slice(&res.original_size.to_le_bytes());
        out.extend_from_slice(&res.crc32.to_le_bytes());
        out.extend_from_slice(&res.sha256);
        out.extend_from_slice(&res.iv);
    }
    out
}

/// Parse `count` records. Returns the records and the number of index bytes
/// consumed (so the caller can locate the signature trailer).
pub fn read_index(bytes: &[u8], count: u32) -> Result<(Vec<PackResource>, usize), FormatError> {
    let mut resources = Vec::with_capacity(count as usize);
    let mut pos = 0usize;
    let need = |pos: usize, n: usize, len: usize| -> Result<(), FormatError> {
        if pos + n > len {
            Err(FormatError::CorruptIndex("record truncated"))
        } else {
            Ok(())
        }
    };
    for _ in 0..count {
        need(pos, 2, bytes.len())?;
        let path_len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        pos += 2;
        need(pos, path_len, bytes.len())?;
        let vfs_path = std::str::from_utf8(&bytes[pos..pos + path_len])
            .map_err(|_| FormatError::CorruptIndex("path is not UTF-8"))?
            .to_string();
        pos += path_len;
        need(pos, 1 + 4 + 8 + 8 + 8 + 4 + 32 + 12, bytes.len())?;
        let resource_type = ResourceType::from_u8(bytes[pos]);
        pos += 1;
        let flags = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let offset = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let compressed_size = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let original_size = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let crc32 = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let sha256: [u8; 32] = bytes[pos..pos + 32].try_into().unwrap();
        pos += 32;
        let iv: [u8; 12] = bytes[pos..pos + 12].try_into().unwrap();
        pos += 12;
        resources.push(PackResource {
            vfs_path,
            resource_type,
            flags,
            offset,
            compressed_size,
            original_size,
            crc32,
            sha256,
            iv,
        });
    }
    Ok((resources, pos))
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_resource() -> PackResource {
        PackResource {
            vfs_path: "scripts/compiled_scripts.bin".into(),
            resource_type: ResourceType::Script,
            flags: RES_FLAG_COMPRESSED | RES_FLAG_ENCRYPTED,
            offset: 32,
            compressed_size: 100,
            original_size: 400,
            crc32: 0xdead_beef,
            sha256: [0xab; 32],
            iv: [3; 12],
        }
    }

    #[test]
    fn header_round_trip() {
        let header = PackHeader {
            version: NMPK_VERSION,
            flags: PACK_FLAG_SIGNED,
            resource_count: 3,
            index_offset: 1234,
            data_offset: 32,
            index_crc32: 0x1020_3040,
        };
        let mut bytes = Vec::new();
        write_header(&mut bytes, &header);
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(read_header(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let header = PackHeader {
            version: NMPK_VERSION,
            flags: 0,
            resource_count: 0,
            index_offset: 0,
            data_offset: 0,
            index_crc32: 0,
        };
        let mut bytes = Vec::new();
        write_header(&mut bytes, &header);
        bytes[0] = b'Z';
        assert!(matches!(read_header(&bytes), Err(FormatError::BadMagic)));

        let mut bytes = Vec::new();
        write_header(&mut bytes, &header);
        bytes[4] = 0xff;
        assert!(matches!(
            read_header(&bytes),
            Err(FormatError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn index_round_trip_and_length() {
        let resources = vec![sample_resource(), {
            let mut other = sample_resource();
            other.vfs_path = "images/bg.png".into();
            other.flags = RES_FLAG_STREAMABLE;
            other.iv = [0; 12];
            other
        }];
        let bytes = write_index(&resources);
        let (parsed, consumed) = read_index(&bytes, 2).unwrap();
        assert_eq!(parsed, resources);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn truncated_index_is_corrupt() {
        let bytes = write_index(&[sample_resource()]);
        assert!(matches!(
            read_index(&bytes[..bytes.len() - 3], 1),
            Err(FormatError::CorruptIndex(_))
        ));
    }

    #[test]
    fn resource_type_by_extension() {
        assert_eq!(ResourceType::from_extension("a/b.png"), ResourceType::Image);
        assert_eq!(ResourceType::from_extension("t.ogg"), ResourceType::Audio);
        assert_eq!(
            ResourceType::from_extension("scripts/compiled_scripts.bin"),
            ResourceType::Script
        );
        assert_eq!(ResourceType::from_extension("x.ttf"), ResourceType::Font);
        assert_eq!(ResourceType::from_extension("strings.json"), ResourceType::Text);
        assert_eq!(ResourceType::from_extension("blob"), ResourceType::Data);
    }

    #[test]
    fn streamable_defaults() {
        assert!(ResourceType::Audio.default_streamable());
        assert!(!ResourceType::Image.default_streamable());
    }
}
