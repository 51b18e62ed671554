//! Pack build pipeline.
//!
//! Stages: preflight validation, script compilation (all `.nms` sources into
//! one `scripts/compiled_scripts.bin` resource), asset collection, pack
//! assembly, and the optional signature. The pipeline itself is synchronous;
//! [`spawn_build`] runs it on a dedicated worker thread that publishes
//! progress over a channel and honors a cancellation flag between stages and
//! between files.
//!
//! Determinism: with `deterministic_build` set, resources are sorted by VFS
//! path, IVs come from a ChaCha20 stream seeded with `fixed_random_seed`,
//! and no wall-clock value enters the output, so the pack bytes are a pure
//! function of the inputs (compare by SHA-256).

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use thiserror::Error;

use crate::crypto::{self, CryptoError, IvSource};
use crate::format::{
    crc32, write_header, write_index, PackHeader, PackResource, ResourceType, HEADER_LEN,
    NMPK_VERSION, PACK_FLAG_ENCRYPTED, PACK_FLAG_SIGNED, RES_FLAG_COMPRESSED, RES_FLAG_ENCRYPTED,
    RES_FLAG_STREAMABLE,
};
use crate::path::{normalize, VfsPathError};
use crate::secure::SecureBytes;
use nm_lang::{check_source, Compiler, ValidateOptions};

/// Canonical VFS path of the compiled-script blob inside every base pack.
pub const COMPILED_SCRIPTS_PATH: &str = "scripts/compiled_scripts.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    None,
    Fast,
    #[default]
    Balanced,
    Max,
}

impl CompressionLevel {
    fn zlib(self) -> Option<Compression> {
        match self {
            CompressionLevel::None => None,
            CompressionLevel::Fast => Some(Compression::new(1)),
            CompressionLevel::Balanced => Some(Compression::new(6)),
            CompressionLevel::Max => Some(Compression::new(9)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub output_path: PathBuf,
    pub compression: CompressionLevel,
    pub encrypt: bool,
    pub sign: bool,
    /// PEM file with the RSA private key; required when `sign` is set.
    pub signing_private_key_path: Option<PathBuf>,
    pub deterministic_build: bool,
    /// Stamped into build reports instead of wall-clock time when
    /// `deterministic_build` is set.
    pub fixed_timestamp: u64,
    pub fixed_random_seed: u64,
    pub validate: ValidateOptions,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("base.nmpack"),
            compression: CompressionLevel::Balanced,
            encrypt: false,
            sign: false,
            signing_private_key_path: None,
            deterministic_build: true,
            fixed_timestamp: 0,
            fixed_random_seed: 0,
            validate: ValidateOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptSource {
    /// Display name used in diagnostics and the source map (e.g. `intro.nms`).
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub enum AssetData {
    /// Read from disk at build time.
    File(PathBuf),
    /// Supplied in memory (generated content, tests).
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct AssetSource {
    pub vfs_path: String,
    pub data: AssetData,
}

#[derive(Debug, Clone, Default)]
pub struct BuildInput {
    pub scripts: Vec<ScriptSource>,
    pub assets: Vec<AssetSource>,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub pack_path: PathBuf,
    pub resource_count: u32,
    pub total_original_bytes: u64,
    pub total_stored_bytes: u64,
    pub pack_sha256: [u8; 32],
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Preflight,
    CompileScripts,
    ProcessAssets,
    WritePack,
    Sign,
}

impl BuildStage {
    pub fn name(self) -> &'static str {
        match self {
            BuildStage::Preflight => "preflight",
            BuildStage::CompileScripts => "compile-scripts",
            BuildStage::ProcessAssets => "process-assets",
            BuildStage::WritePack => "write-pack",
            BuildStage::Sign => "sign",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StageStarted { stage: BuildStage, index: usize, total: usize },
    FileProcessed { vfs_path: String },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("project integrity check failed:\n{}", .0.join("\n"))]
    IntegrityCheckFailed(Vec<String>),
    #[error("script compilation failed: {0}")]
    ScriptCompileFailed(String),
    #[error("failed to process asset '{vfs_path}': {source}")]
    AssetProcessFailed {
        vfs_path: String,
        source: std::io::Error,
    },
    #[error("invalid resource path: {0}")]
    BadResourcePath(#[from] VfsPathError),
    #[error("failed to write pack: {0}")]
    PackWriteFailed(#[from] std::io::Error),
    #[error("encryption requested but no key was provided")]
    EncryptionKeyMissing,
    #[error("encryption failed: {0}")]
    EncryptionFailed(CryptoError),
    #[error("signing failed: {0}")]
    SigningFailed(String),
    #[error("build cancelled")]
    Cancelled,
    #[error("build worker crashed: {0}")]
    Worker(String),
}

pub fn compress_bytes(data: &[u8], compression: Compression) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), compression);
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress_bytes(data: &[u8], original_size: usize) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::with_capacity(original_size));
    decoder.write_all(data)?;
    decoder.finish()
}

struct StagedEntry {
    vfs_path: String,
    resource_type: ResourceType,
    streamable: bool,
    bytes: Vec<u8>,
}

/// Run the full pipeline synchronously. `progress` and `cancel` are optional
/// so the function is directly usable without the worker-thread wrapper.
pub fn build_pack(
    input: &BuildInput,
    config: &BuildConfig,
    key: Option<&SecureBytes>,
    progress: Option<&Sender<ProgressEvent>>,
    cancel: Option<&AtomicBool>,
) -> Result<BuildReport, BuildError> {
    let total_stages = if config.sign { 5 } else { 4 };
    let stage = |s: BuildStage, i: usize| {
        if let Some(tx) = progress {
            let _ = tx.send(ProgressEvent::StageStarted {
                stage: s,
                index: i,
                total: total_stages,
            });
        }
        tracing::info!(target: "pack.build", stage = s.name(), "build stage");
    };
    let check_cancel = || -> Result<(), BuildError> {
        match cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(BuildError::Cancelled),
            _ => Ok(()),
        }
    };
    let file_done = |vfs_path: &str| {
        if let Some(tx) = progress {
            let _ = tx.send(ProgressEvent::FileProcessed {
                vfs_path: vfs_path.to_string(),
            });
        }
    };

    if config.encrypt && key.is_none() {
        return Err(BuildError::EncryptionKeyMissing);
    }

    // Stage 1: preflight. Parse and validate every script so a broken
    // project fails before any expensive work.
    stage(BuildStage::Preflight, 0);
    let mut programs = Vec::with_capacity(input.scripts.len());
    let mut failures = Vec::new();
    for script in &input.scripts {
        check_cancel()?;
        match check_source(&script.source, config.validate) {
            Ok(program) => programs.push((script.name.clone(), program)),
            Err(err) => failures.push(format!("{}: {err}", script.name)),
        }
        file_done(&script.name);
    }
    if !failures.is_empty() {
        return Err(BuildError::IntegrityCheckFailed(failures));
    }

    // Stage 2: compile all scripts into a single bytecode resource.
    stage(BuildStage::CompileScripts, 1);
    let mut entries: Vec<StagedEntry> = Vec::new();
    if !programs.is_empty() {
        check_cancel()?;
        let mut compiler = Compiler::new();
        for (name, program) in &programs {
            compiler.add_unit(program, name);
        }
        let script = compiler.finish().map_err(|errors| {
            BuildError::ScriptCompileFailed(
                errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "),
            )
        })?;
        entries.push(StagedEntry {
            vfs_path: COMPILED_SCRIPTS_PATH.to_string(),
            resource_type: ResourceType::Script,
            streamable: false,
            bytes: script.encode(),
        });
        file_done(COMPILED_SCRIPTS_PATH);
    }

    // Stage 3: collect assets.
    stage(BuildStage::ProcessAssets, 2);
    for asset in &input.assets {
        check_cancel()?;
        let vfs_path = normalize(&asset.vfs_path)?;
        let bytes = match &asset.data {
            AssetData::File(path) => {
                std::fs::read(path).map_err(|source| BuildError::AssetProcessFailed {
                    vfs_path: vfs_path.clone(),
                    source,
                })?
            }
            AssetData::Bytes(bytes) => bytes.clone(),
        };
        let resource_type = ResourceType::from_extension(&vfs_path);
        entries.push(StagedEntry {
            vfs_path: vfs_path.clone(),
            resource_type,
            streamable: resource_type.default_streamable(),
            bytes,
        });
        file_done(&vfs_path);
    }

    // Stage 4: assemble and write. Asset processing above may one day fan
    // out across threads; the sort here is what guarantees a stable layout
    // either way.
    stage(BuildStage::WritePack, 3);
    if config.deterministic_build {
        entries.sort_by(|a, b| a.vfs_path.cmp(&b.vfs_path));
    }
    let mut iv_source = if config.deterministic_build {
        IvSource::from_seed(config.fixed_random_seed)
    } else {
        IvSource::Os
    };

    let mut data = Vec::new();
    let mut resources = Vec::with_capacity(entries.len());
    let mut total_original = 0u64;
    for entry in &entries {
        check_cancel()?;
        let original_size = entry.bytes.len() as u64;
        total_original += original_size;
        let checksum = crc32(&entry.bytes);

        let mut flags = 0u32;
        if entry.streamable {
            flags |= RES_FLAG_STREAMABLE;
        }
        let mut stored = entry.bytes.clone();
        if let Some(level) = config.compression.zlib() {
            stored = compress_bytes(&stored, level)?;
            flags |= RES_FLAG_COMPRESSED;
        }
        let mut iv = [0u8; 12];
        if config.encrypt {
            let key = key.expect("checked above");
            iv = iv_source.next_iv();
            stored = crypto::encrypt_resource(key, &iv, &stored)
                .map_err(BuildError::EncryptionFailed)?;
            flags |= RES_FLAG_ENCRYPTED;
        }

        let offset = (HEADER_LEN + data.len()) as u64;
        let sha256 = crypto::sha256(&stored);
        resources.push(PackResource {
            vfs_path: entry.vfs_path.clone(),
            resource_type: entry.resource_type,
            flags,
            offset,
            compressed_size: stored.len() as u64,
            original_size,
            crc32: checksum,
            sha256,
            iv,
        });
        data.extend_from_slice(&stored);
    }

    let index = write_index(&resources);
    let mut pack_flags = 0u16;
    if config.sign {
        pack_flags |= PACK_FLAG_SIGNED;
    }
    if config.encrypt {
        pack_flags |= PACK_FLAG_ENCRYPTED;
    }
    let header = PackHeader {
        version: NMPK_VERSION,
        flags: pack_flags,
        resource_count: resources.len() as u32,
        index_offset: (HEADER_LEN + data.len()) as u64,
        data_offset: HEADER_LEN as u64,
        index_crc32: crc32(&index),
    };

    let mut pack = Vec::with_capacity(HEADER_LEN + data.len() + index.len());
    write_header(&mut pack, &header);
    pack.extend_from_slice(&data);
    pack.extend_from_slice(&index);

    // Stage 5: signature trailer over everything written so far.
    if config.sign {
        stage(BuildStage::Sign, 4);
        check_cancel()?;
        let key_path = config
            .signing_private_key_path
            .as_ref()
            .ok_or_else(|| BuildError::SigningFailed("no signing key configured".into()))?;
        let pem = std::fs::read_to_string(key_path)
            .map_err(|e| BuildError::SigningFailed(format!("read {}: {e}", key_path.display())))?;
        let private_key = crypto::load_private_key_pem(&pem)
            .map_err(|e| BuildError::SigningFailed(e.to_string()))?;
        let signature =
            crypto::sign(&private_key, &pack).map_err(|e| BuildError::SigningFailed(e.to_string()))?;
        pack.extend_from_slice(&(signature.len() as u32).to_le_bytes());
        pack.extend_from_slice(&signature);
    }

    std::fs::write(&config.output_path, &pack)?;
    let report = BuildReport {
        pack_path: config.output_path.clone(),
        resource_count: resources.len() as u32,
        total_original_bytes: total_original,
        total_stored_bytes: data.len() as u64,
        pack_sha256: crypto::sha256(&pack),
        timestamp: config.fixed_timestamp,
    };
    tracing::info!(
        target: "pack.build",
        path = %report.pack_path.display(),
        resources = report.resource_count,
        original = report.total_original_bytes,
        stored = report.total_stored_bytes,
        "pack written"
    );
    Ok(report)
}

/// Handle to a build running on its worker thread.
pub struct BuildHandle {
    progress: Receiver<ProgressEvent>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<Result<BuildReport, BuildError>>,
}

impl BuildHandle {
    pub fn progress(&self) -> &Receiver<ProgressEvent> {
        &self.progress
    }

    /// Request cancellation; the build stops at the next stage or file
    /// boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn join(self) -> Result<BuildReport, BuildError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(BuildError::Worker("build thread panicked".into())),
        }
    }
}

/// Run [`build_pack`] on a dedicated worker thread owned by the caller.
pub fn spawn_build(
    input: BuildInput,
    config: BuildConfig,
    key: Option<SecureBytes>,
) -> BuildHandle {
    let (tx, rx) = unbounded();
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = Arc::clone(&cancel);
    let handle = std::thread::spawn(move || {
        build_pack(&input, &config, key.as_ref(), Some(&tx), Some(&cancel_flag))
    });
    BuildHandle {
        progress: rx,
        cancel,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenient() -> ValidateOptions {
        ValidateOptions {
            warn_unused: false,
            warn_unreachable: false,
        }
    }

    fn sample_input() -> BuildInput {
        BuildInput {
            scripts: vec![ScriptSource {
                name: "main.nms".into(),
                source: r#"scene main { say "hello" }"#.into(),
            }],
            assets: vec![
                AssetSource {
                    vfs_path: "Images/BG.png".into(),
                    data: AssetData::Bytes(vec![1, 2, 3, 4, 5]),
                },
                AssetSource {
                    vfs_path: "audio/theme.ogg".into(),
                    data: AssetData::Bytes(vec![9; 1000]),
                },
            ],
        }
    }

    fn config_in(dir: &std::path::Path) -> BuildConfig {
        BuildConfig {
            output_path: dir.join("test.nmpack"),
            validate: lenient(),
            ..Default::default()
        }
    }

    #[test]
    fn builds_a_pack_with_scripts_and_assets() {
        let dir = tempfile::tempdir().unwrap();
        let report = build_pack(&sample_input(), &config_in(dir.path()), None, None, None).unwrap();
        assert_eq!(report.resource_count, 3);
        let bytes = std::fs::read(&report.pack_path).unwrap();
        assert_eq!(&bytes[0..4], b"NMPK");
    }

    #[test]
    fn deterministic_builds_are_byte_identical() {
        // S4: two consecutive encrypted builds produce identical bytes.
        let dir = tempfile::tempdir().unwrap();
        let key = SecureBytes::new(vec![0x42; 32]);
        let config = BuildConfig {
            output_path: dir.path().join("a.nmpack"),
            encrypt: true,
            deterministic_build: true,
            fixed_timestamp: 1000,
            fixed_random_seed: 42,
            validate: lenient(),
            ..Default::default()
        };
        let first = build_pack(&sample_input(), &config, Some(&key), None, None).unwrap();
        let second = build_pack(&sample_input(), &config, Some(&key), None, None).unwrap();
        assert_eq!(first.pack_sha256, second.pack_sha256);
        assert_eq!(first.timestamp, 1000);
    }

    #[test]
    fn different_seed_changes_encrypted_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let key = SecureBytes::new(vec![0x42; 32]);
        let mut config = BuildConfig {
            output_path: dir.path().join("a.nmpack"),
            encrypt: true,
            fixed_random_seed: 1,
            validate: lenient(),
            ..Default::default()
        };
        let first = build_pack(&sample_input(), &config, Some(&key), None, None).unwrap();
        config.fixed_random_seed = 2;
        let second = build_pack(&sample_input(), &config, Some(&key), None, None).unwrap();
        assert_ne!(first.pack_sha256, second.pack_sha256);
    }

    #[test]
    fn encryption_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            output_path: dir.path().join("x.nmpack"),
            encrypt: true,
            validate: lenient(),
            ..Default::default()
        };
        assert!(matches!(
            build_pack(&sample_input(), &config, None, None, None),
            Err(BuildError::EncryptionKeyMissing)
        ));
    }

    #[test]
    fn broken_script_fails_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let input = BuildInput {
            scripts: vec![ScriptSource {
                name: "bad.nms".into(),
                source: "scene main { goto nowhere }".into(),
            }],
            assets: Vec::new(),
        };
        match build_pack(&input, &config_in(dir.path()), None, None, None) {
            Err(BuildError::IntegrityCheckFailed(failures)) => {
                assert!(failures[0].contains("bad.nms"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn worker_thread_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_build(sample_input(), config_in(dir.path()), None);
        let mut stages = Vec::new();
        let mut files = 0;
        while let Ok(event) = handle.progress().recv() {
            match event {
                ProgressEvent::StageStarted { stage, .. } => stages.push(stage),
                ProgressEvent::FileProcessed { .. } => files += 1,
            }
        }
        let report = handle.join().unwrap();
        assert_eq!(report.resource_count, 3);
        assert_eq!(stages[0], BuildStage::Preflight);
        assert!(stages.contains(&BuildStage::WritePack));
        assert!(files >= 4); // script preflight + compiled blob + two assets
    }

    #[test]
    fn cancellation_stops_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            build_pack(&sample_input(), &config_in(dir.path()), None, None, Some(&cancel)),
            Err(BuildError::Cancelled)
        ));
    }

    #[test]
    fn compress_round_trip() {
        let data = vec![7u8; 4096];
        let compressed = compress_bytes(&data, Compression::new(6)).unwrap();
        assert!(compressed.len() < data.len());
        let back = decompress_bytes(&compressed, data.len()).unwrap();
        assert_eq!(back, data);
    }
}
