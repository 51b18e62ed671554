//! Multi-pack virtual file system.
//!
//! Packs register with a declared type and priority; resolution walks layers
//! by priority descending, tie-broken by type order Mod > Language > DLC >
//! Patch > Base, and the first hit wins. Each loaded pack is an immutable
//! memory-mapped file plus its parsed index, shared behind an `Arc`; the
//! layer list itself sits in an `ArcSwap` so readers always see a consistent
//! snapshot without taking locks, while `load_pack`/`unload_pack` swap in a
//! new list.
//!
//! Load-time verification: magic and version, index CRC32 against the header
//! value, and, for signed packs, the RSA signature over everything before
//! the trailer. A pack that fails verification is rejected; other layers are
//! unaffected.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use memmap2::Mmap;
use rsa::RsaPublicKey;
use thiserror::Error;

use nm_pack::crypto::{self, CryptoError};
use nm_pack::format::{self, FormatError, PackResource, PACK_FLAG_SIGNED};
use nm_pack::path::VfsPathError;
use nm_pack::{decompress_bytes, SecureBytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackType {
    Base,
    Patch,
    Dlc,
    Language,
    Mod,
}

impl PackType {
    /// Tie-break rank when priorities are equal; higher wins.
    pub fn rank(self) -> u8 {
        match self {
            PackType::Base => 0,
            PackType::Patch => 1,
            PackType::Dlc => 2,
            PackType::Language => 3,
            PackType::Mod => 4,
        }
    }

    pub fn parse(s: &str) -> Option<PackType> {
        Some(match s {
            "base" => PackType::Base,
            "patch" => PackType::Patch,
            "dlc" => PackType::Dlc,
            "language" => PackType::Language,
            "mod" => PackType::Mod,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackType::Base => "base",
            PackType::Patch => "patch",
            PackType::Dlc => "dlc",
            PackType::Language => "language",
            PackType::Mod => "mod",
        }
    }
}

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("{0}")]
    Format(#[from] FormatError),
    #[error("failed to open pack {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("pack {} is signed but no public key is configured (set {})", .0.display(), crypto::ENV_PUBLIC_KEY)]
    PublicKeyMissing(PathBuf),
    #[error("signature verification failed for pack {}", .0.display())]
    SignatureInvalid(PathBuf),
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("CRC mismatch reading '{path}' (recorded {expected:#010x}, computed {computed:#010x})")]
    CrcMismatch {
        path: String,
        expected: u32,
        computed: u32,
    },
    #[error("GCM tag verification failed reading '{0}'")]
    GcmTagInvalid(String),
    #[error("resource '{0}' is encrypted but no AES key is configured")]
    EncryptionKeyMissing(String),
    #[error("failed to decompress '{path}': {source}")]
    Decompress {
        path: String,
        source: std::io::Error,
    },
    #[error("resource '{0}' is not flagged streamable")]
    NotStreamable(String),
    #[error(transparent)]
    Path(#[from] VfsPathError),
    #[error("pack {} data range is out of bounds for '{resource}'", path.display())]
    BadDataRange { path: PathBuf, resource: String },
}

/// One loaded pack: mapped file + parsed index. Immutable after load.
pub struct PackLayer {
    pub pack_type: PackType,
    pub priority: i32,
    pub source_path: PathBuf,
    map: Mmap,
    index: HashMap<String, PackResource>,
}

impl PackLayer {
    fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }
}

#[derive(Default)]
pub struct MultiPackVfs {
    layers: ArcSwap<Vec<Arc<PackLayer>>>,
    aes_key: Option<SecureBytes>,
    public_key: Option<RsaPublicKey>,
}

impl MultiPackVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct with key material. `aes_key` decrypts encrypted resources;
    /// `public_key_pem` verifies signed packs.
    pub fn with_keys(
        aes_key: Option<SecureBytes>,
        public_key_pem: Option<&str>,
    ) -> Result<Self, CryptoError> {
        let public_key = public_key_pem
            .map(crypto::load_public_key_pem)
            .transpose()?;
        Ok(Self {
            layers: ArcSwap::default(),
            aes_key,
            public_key,
        })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.load().len()
    }

    /// Load and verify a pack, inserting it into the layer order.
    pub fn load_pack(
        &self,
        path: impl AsRef<Path>,
        pack_type: PackType,
        priority: i32,
    ) -> Result<(), VfsError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| VfsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // The file is never written after build; a private map keeps any
        // external truncation from tearing reads mid-flight.
        let map = unsafe { Mmap::map(&file) }.map_err(|source| VfsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let header = format::read_header(&map)?;
        let index_start = header.index_offset as usize;
        if index_start > map.len() {
            return Err(FormatError::CorruptIndex("index offset past end of file").into());
        }
        let (resources, index_len) =
            format::read_index(&map[index_start..], header.resource_count)?;
        let computed = format::crc32(&map[index_start..index_start + index_len]);
        if computed != header.index_crc32 {
            return Err(VfsError::Format(FormatError::IndexChecksum {
                expected: header.index_crc32,
                computed,
            }));
        }

        if header.flags & PACK_FLAG_SIGNED != 0 {
            let trailer_start = index_start + index_len;
            let public_key = self
                .public_key
                .as_ref()
                .ok_or_else(|| VfsError::PublicKeyMissing(path.to_path_buf()))?;
            let trailer = &map[trailer_start..];
            if trailer.len() < 4 {
                return Err(FormatError::CorruptIndex("missing signature trailer").into());
            }
            let sig_len = u32::from_le_bytes(trailer[0..4].try_into().unwrap()) as usize;
            if trailer.len() < 4 + sig_len {
                return Err(FormatError::CorruptIndex("signature trailer truncated").into());
            }
            let signature = &trailer[4..4 + sig_len];
            crypto::verify(public_key, &map[..trailer_start], signature)
                .map_err(|_| VfsError::SignatureInvalid(path.to_path_buf()))?;
        }

        let mut index = HashMap::with_capacity(resources.len());
        for resource in resources {
            let key = nm_pack::normalize_vfs_path(&resource.vfs_path)?;
            index.insert(key, resource);
        }

        let layer = Arc::new(PackLayer {
            pack_type,
            priority,
            source_path: path.to_path_buf(),
            map,
            index,
        });

        // Writers briefly clone the list; readers keep their old snapshot.
        self.layers.rcu(|layers| {
            let mut next: Vec<Arc<PackLayer>> = (**layers).clone();
            next.push(Arc::clone(&layer));
            next.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(b.pack_type.rank().cmp(&a.pack_type.rank()))
            });
            next
        });
        tracing::info!(
            target: "vfs",
            path = %path.display(),
            pack_type = layer.pack_type.as_str(),
            priority,
            resources = layer.index.len(),
            "pack loaded"
        );
        Ok(())
    }

    /// Remove a previously loaded pack by its file path.
    pub fn unload_pack(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let mut removed = false;
        self.layers.rcu(|layers| {
            let next: Vec<Arc<PackLayer>> = layers
                .iter()
                .filter(|layer| layer.source_path != path)
                .cloned()
                .collect();
            removed = next.len() != layers.len();
            next
        });
        if removed {
            tracing::info!(target: "vfs", path = %path.display(), "pack unloaded");
        }
        removed
    }

    pub fn contains(&self, vfs_path: &str) -> bool {
        match nm_pack::normalize_vfs_path(vfs_path) {
            Ok(normalized) => self
                .layers
                .load()
                .iter()
                .any(|layer| layer.contains(&normalized)),
            Err(_) => false,
        }
    }

    /// Index record of the resource that currently resolves for `vfs_path`.
    pub fn resource_info(&self, vfs_path: &str) -> Option<PackResource> {
        let normalized = nm_pack::normalize_vfs_path(vfs_path).ok()?;
        let layers = self.layers.load();
        layers
            .iter()
            .find_map(|layer| layer.index.get(&normalized).cloned())
    }

    /// Read a whole resource: locate, decrypt, decompress, CRC-check.
    pub fn read_all(&self, vfs_path: &str) -> Result<Vec<u8>, VfsError> {
        let normalized = nm_pack::normalize_vfs_path(vfs_path)?;
        let layers = self.layers.load();
        let (layer, resource) = layers
            .iter()
            .find_map(|layer| layer.index.get(&normalized).map(|r| (layer, r)))
            .ok_or_else(|| VfsError::ResourceNotFound(normalized.clone()))?;
        self.decode(layer, resource, &normalized)
    }

    /// Open a streaming reader. Only resources flagged streamable in the
    /// index are eligible.
    pub fn open_stream(&self, vfs_path: &str) -> Result<ResourceStream, VfsError> {
        let normalized = nm_pack::normalize_vfs_path(vfs_path)?;
        let layers = self.layers.load();
        let (layer, resource) = layers
            .iter()
            .find_map(|layer| layer.index.get(&normalized).map(|r| (Arc::clone(layer), r.clone())))
            .ok_or_else(|| VfsError::ResourceNotFound(normalized.clone()))?;
        if !resource.is_streamable() {
            return Err(VfsError::NotStreamable(normalized));
        }
        if resource.is_encrypted() || resource.is_compressed() {
            // Transformed payloads must be decoded before they can stream.
            let bytes = self.decode(&layer, &resource, &normalized)?;
            Ok(ResourceStream::Buffered { bytes, pos: 0 })
        } else {
            let start = resource.offset as usize;
            let end = start + resource.compressed_size as usize;
            if end > layer.map.len() {
                return Err(VfsError::BadDataRange {
                    path: layer.source_path.clone(),
                    resource: normalized,
                });
            }
            Ok(ResourceStream::Mapped {
                layer,
                start,
                end,
                pos: 0,
            })
        }
    }

    fn decode(
        &self,
        layer: &PackLayer,
        resource: &PackResource,
        normalized: &str,
    ) -> Result<Vec<u8>, VfsError> {
        let start = resource.offset as usize;
        let end = start + resource.compressed_size as usize;
        if end > layer.map.len() {
            return Err(VfsError::BadDataRange {
                path: layer.source_path.clone(),
                resource: normalized.to_string(),
            });
        }
        let stored = &layer.map[start..end];

        let mut bytes = if resource.is_encrypted() {
            let key = self
                .aes_key
                .as_ref()
                .ok_or_else(|| VfsError::EncryptionKeyMissing(normalized.to_string()))?;
            crypto::decrypt_resource(key, &resource.iv, stored)
                .map_err(|_| VfsError::GcmTagInvalid(normalized.to_string()))?
        } else {
            stored.to_vec()
        };

        if resource.is_compressed() {
            bytes = decompress_bytes(&bytes, resource.original_size as usize).map_err(|source| {
                VfsError::Decompress {
                    path: normalized.to_string(),
                    source,
                }
            })?;
        }

        let computed = format::crc32(&bytes);
        if computed != resource.crc32 {
            return Err(VfsError::CrcMismatch {
                path: normalized.to_string(),
                expected: resource.crc32,
                computed,
            });
        }
        Ok(bytes)
    }
}

/// Reader over one resolved resource. Plain payloads stream straight off the
/// pack mapping; transformed payloads stream from the decoded buffer.
pub enum ResourceStream {
    Mapped {
        layer: Arc<PackLayer>,
        start: usize,
        end: usize,
        pos: usize,
    },
    Buffered {
        bytes: Vec<u8>,
        pos: usize,
    },
}

impl ResourceStream {
    pub fn len(&self) -> usize {
        match self {
            ResourceStream::Mapped { start, end, .. } => end - start,
            ResourceStream::Buffered { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for ResourceStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ResourceStream::Mapped {
                layer,
                start,
                end,
                pos,
            } => {
                let available = &layer.map[*start + *pos..*end];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                *pos += n;
                Ok(n)
            }
            ResourceStream::Buffered { bytes, pos } => {
                let available = &bytes[*pos..];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}
