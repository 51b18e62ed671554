//! Pack building: compile scripts, process assets, and emit `.nmpack`
//! archives with per-resource compression, encryption, and integrity
//! metadata. The runtime-side multi-pack VFS lives in `nm-vfs` and shares
//! the wire format and crypto defined here.

pub mod builder;
pub mod crypto;
pub mod format;
pub mod path;
pub mod secure;

pub use builder::{
    build_pack, compress_bytes, decompress_bytes, spawn_build, AssetData, AssetSource, BuildConfig,
    BuildError, BuildHandle, BuildInput, BuildReport, BuildStage, CompressionLevel, ProgressEvent,
    ScriptSource, COMPILED_SCRIPTS_PATH,
};
pub use crypto::{CryptoError, ENV_AES_KEY_FILE, ENV_AES_KEY_HEX, ENV_PUBLIC_KEY};
pub use format::{FormatError, PackHeader, PackResource, ResourceType};
pub use path::{normalize as normalize_vfs_path, VfsPathError};
pub use secure::SecureBytes;
