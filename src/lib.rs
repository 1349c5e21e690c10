//! One node of an anonymous mix-network file-sharing cluster.
//!
//! A fixed set of `N` servers cooperatively runs, per protocol round, a
//! verifiable shuffle of per-client keys, a shuffle of upload requests and
//! blocks, and a PIR-style download phase.

pub mod cipher;
pub mod config;
pub mod download;
pub mod error;
pub mod group;
pub mod keyshuffle;
pub mod mask_secret;
pub mod peer;
pub mod permutation;
pub mod pipeline;
pub mod prg;
pub mod registration;
pub mod round_state;
pub mod server;
pub mod shuffle_proof;
pub mod wire;

pub use config::{ClientId, ClusterConfig, ProtocolParams, ServerId};
pub use error::Error;
pub use server::Server;
