//! The niks3 core library.
//!
//! Shared types for the write-coordinator/GC service: closure and pin
//! naming, hashing, and Ed25519 signing over narinfo fingerprints.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod closure_key;
pub mod error;
pub mod hash;
pub mod mime;
pub mod pin;
pub mod signing;

pub use closure_key::ClosureKey;
pub use error::{Niks3Error, Niks3Result};
pub use pin::PinName;
