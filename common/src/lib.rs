#![allow(clippy::module_inception)]
#![allow(clippy::upper_case_acronyms)]

pub mod block;
pub mod config;
pub mod crypto;
pub mod descriptor;
pub mod p2p;
pub mod script;
pub mod serializer;
pub mod time;
pub mod transaction;
pub mod utils;
