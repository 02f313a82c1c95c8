//! # Formats
//!
//! Binary snapshot format. Pure transformations only: file I/O lives in the
//! app layer.

pub mod snapshot;

pub use snapshot::{
    Decoded, PackageRecord, SnapshotHeader, SnapshotKind, SnapshotSummary, TypeRecord, peek_header,
    read, read_base, read_packages, snapshot_checksum, summarize, write_base, write_packages,
};
