#![forbid(unsafe_code)]

//! Minimal JVM class-file reader and ABI extraction.
//!
//! Only the parts of a class file that make up its public surface are decoded: names, access
//! flags, members, constant values, and declared exceptions. Method bodies and debug attributes
//! are skipped without being interpreted.

mod abi;
mod classfile;
mod constant_pool;
mod error;
mod reader;

#[cfg(any(test, feature = "test-support"))]
mod builder;

pub use crate::abi::{abi_hash, class_abi_hash, is_abi_visible};
pub use crate::classfile::{access, ClassFile, ClassMember, ConstValue};
pub use crate::error::{Error, Result};

#[cfg(any(test, feature = "test-support"))]
pub use crate::builder::{ClassFileBuilder, MemberBuilder};

/// Whether `bytes` start with the class-file magic number.
pub fn looks_like_class_file(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xCA, 0xFE, 0xBA, 0xBE])
}
