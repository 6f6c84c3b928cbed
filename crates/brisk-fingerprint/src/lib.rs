//! Normalized fingerprints of file collections.
//!
//! A [`Fingerprinter`] reduces snapshot trees to a [`CollectionFingerprint`] under a
//! [`FingerprintingStrategy`]. Two fingerprints taken under the same strategy can be diffed with
//! [`compare`], which drives both the up-to-date check and incremental change processing.

mod compare;
mod error;
mod fingerprint;
mod hasher;
mod normalization;

pub use compare::{compare, Change, ChangeKind, FingerprintComparison};
pub use error::{FingerprintingError, IncompatibleFingerprints, ResourceHashError};
pub use fingerprint::{
    combine, normalized_keys, CollectionFingerprint, FingerprintEntry, Fingerprinter,
    FingerprintingStrategy,
};
pub use hasher::{
    CachingResourceHasher, ClasspathResourceHasher, RawContentHasher, ResourceHashCache,
    ResourceHasher,
};
pub use normalization::{
    ClassContent, ClasspathNormalization, DirectorySensitivity, FingerprintHashingStrategy,
    NonClassFiles, Normalization,
};
