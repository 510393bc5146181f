mod hash;
mod key;

pub use hash::*;
pub use key::{verify_signature, KeyError, KeyPair, COMPRESSED_PUBLIC_KEY_SIZE, SIGHASH_ALL};
