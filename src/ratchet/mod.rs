//! Double ratchet: a DH ratchet driving symmetric chain ratchets.

pub mod chain;
pub mod dh;

pub use chain::{ChainCiphertext, ChainRatchet};
pub use dh::{Direction, SessionRatchet};
