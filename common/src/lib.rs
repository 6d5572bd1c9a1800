// Copyright (c) 2018-2022 The Botho Foundation

//! Shared primitives used across the RKSync gossip engine: the PKI-id
//! identity types, the signing keypair wrapper, peer epoch/sequence time,
//! and the logging bootstrap helper.

#![warn(missing_docs)]

mod logger;
mod pki;
mod time;

#[cfg(feature = "logger")]
pub use logger::init_logger;
pub use pki::{
    pki_id_of, pubkey_serde, signature_serde, verify, KeyError, PeerIdentity, PkiId, SigningIdentity,
};
pub use time::PeerTime;

#[doc(hidden)]
pub use logger::__private;
