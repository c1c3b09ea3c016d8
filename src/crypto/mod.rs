//! Encryption capability and local key material.
//!
//! The relay layer depends only on the [`Cipher`] trait and the [`KeyStore`]
//! accessors; [`TextbookRsa`] and [`UserProfile`] are the bundled
//! implementations.

pub mod profile;
pub mod rsa;

pub use profile::*;
pub use rsa::*;
