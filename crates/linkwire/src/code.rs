//! # Identifier Codes
//!
//! Names of modules, methods and properties are never sent as strings.
//! Each is reduced to a 16-bit code with 32-bit FNV-1a folded in half.
//!
//! ## Invariants
//!
//! - The code of a name depends only on its UTF-8 bytes, so two processes
//!   built from different binaries still agree on it.
//! - Distinct names may share a code. With 65536 buckets the chance that any
//!   two of `n` names collide is roughly `n^2 / 131072`; callers that mount
//!   names side by side must check for it.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Returns the wire code for `name`.
pub const fn code(name: &str) -> u16 {
    let bytes = name.as_bytes();
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    ((hash >> 16) ^ (hash & 0xffff)) as u16
}
