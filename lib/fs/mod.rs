//! The mounted filesystem surface.
//!
//! A mount exposes a read-only mirror of the archive with two additions:
//! overlayfs-style whiteout translation (`.wh.*` entries become character
//! device nodes, `.wh..wh..opq` becomes an opaque-directory xattr) and a
//! synthetic state directory at the root carrying a machine-readable health
//! file for the layer.

/// Mount pipeline, layer registry, and snapshotter-facing operations.
pub mod filesystem;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to the node tree.
pub mod fuser;
/// The inode-addressed node tree over a parsed archive.
pub mod node;

pub use filesystem::{
    ANNOTATION_REF_NAME, Config, Descriptor, LayerFs, MountError, TARGET_DIGEST_LABEL,
    TARGET_REF_LABEL, TARGET_SIZE_LABEL,
};
pub use node::{LayerStatus, LayerTree};

/// Prefix marking an overlayfs whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The doubly-prefixed marker declaring its directory opaque.
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

/// Extended attribute overlayfs reads to detect opaque directories.
pub const OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// Value of the opaque xattr when set.
pub const OPAQUE_XATTR_VALUE: &[u8] = b"y";

/// Name of the synthetic state directory exposed at the mount root.
pub const STATE_DIR_NAME: &str = ".stargz-snapshotter";

/// Block size reported through stat.
pub const BLOCK_SIZE: u32 = 512;
