//! cmpt Capability Primitives
//!
//! This crate models the architectural capability: an unforgeable reference
//! carrying an address, bounds, permissions, a validity tag and an optional
//! seal. It is the leaf every other cmpt crate builds on.
//!
//! # Security Properties
//!
//! 1. **No widening**: no operation yields more bounds or permissions than its
//!    inputs
//! 2. **Sealed values are frozen**: changing a sealed capability clears its
//!    tag
//! 3. **Fail closed**: malformed requests produce untagged results
//!
//! # Module Organization
//!
//! - `perms` - Permission bits and the composite sets used for memory, code
//!   and sealed-pair participants
//! - `capability` - The `Capability` value type and its derivation and
//!   sealing operations
//! - `fmt` - Diagnostic rendering (`Display`)

#![no_std]
extern crate alloc;

pub mod capability;
pub mod fmt;
pub mod perms;

pub use capability::{Capability, ObjectType, RootAuthority, CAP_SIZE, OTYPE_MASK};
pub use fmt::{perms_to_string, seal_to_string};
pub use perms::Perms;
