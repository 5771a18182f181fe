//! Single-server private information retrieval with client preprocessing.
//!
//! The client streams the database once, folds it into a pool of hint
//! parities, and then reads records with sublinear server work and
//! communication. Spent hints are replaced by promoting backups; when the
//! per-epoch query budget runs out the client preprocesses again. Writes on
//! the server are pushed to the client as XOR deltas.
//!
//! - `params`: block partition and hint/budget sizing
//! - `iprf`: invertible PRF that assigns hints to offsets within a block
//! - `binomial`: derandomized binomial sampling for the iPRF tree
//! - `hint`: hint pool (primary, backup, promoted, spent)
//! - `client` / `server`: the two protocol parties
//! - `channel` / `messages`: tagged transport and payload codecs

pub mod binomial;
pub mod channel;
pub mod client;
pub mod error;
pub mod hint;
pub mod iprf;
pub mod messages;
pub mod params;
pub mod server;

pub use channel::{Channel, FramedChannel, MemoryChannel, Tag};
pub use client::Client;
pub use error::{PirError, Result};
pub use iprf::{HintOracle, Iprf};
pub use params::Params;
pub use server::Server;
