//! Jupyter wire protocol.
//!
//! Signed multi-frame envelopes on one side, [`ComposedMessage`] on the other.

pub mod codec;
pub mod message;
pub mod signer;

pub use codec::{decode, encode, DELIMITER};
pub use message::{ComposedMessage, Header, PROTOCOL_VERSION};
pub use signer::Signer;
