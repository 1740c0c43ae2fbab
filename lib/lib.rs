//! stargz-fs shared library: the core of a lazy-pulling container-image
//! filesystem.

/// Content-addressed chunk caches (memory and two-tier directory).
pub mod cache;
/// FUSE node tree, adapter, and the mount orchestrator.
pub mod fs;
/// Cache-aware indexed reader over an opened archive.
pub mod reader;
/// Registry resolution and the remote range reader.
pub mod remote;
/// Priority/background task arbitration.
pub mod task;
