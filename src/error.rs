//! The error kinds raised across registration, key-shuffle, and the
//! per-round pipelines.
//!
//! Crypto-open failures and shuffle-proof rejections are fatal for the
//! round that produced them: the caller should tear the round's handler
//! task down rather than attempt to continue with unverified or
//! undecryptable data.

use displaydoc::Display;

use crate::config::ServerId;

/// Errors surfaced by a server's public (RPC) and internal pipeline APIs.
#[derive(Debug, Display)]
pub enum Error {
    /// transport failure while contacting peer {0:?}: {1}
    Transport(ServerId, String),
    /// authenticated decryption failed while opening ciphertext from client {0:?}
    CryptoOpen(crate::config::ClientId),
    /// shuffle proof rejected for the hop originating at {0:?}
    ShuffleProof(ServerId),
    /// client registration collided on id {0:?} (duplicate-registration detection is unimplemented upstream)
    RegistrationCollision(crate::config::ClientId),
    /// protocol sequence violation: {0}
    ProtocolSequence(String),
    /// failed to (de)serialize a wire message: {0}
    Serialization(String),
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
