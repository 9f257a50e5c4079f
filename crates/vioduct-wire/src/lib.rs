//! Wire protocol shared by both ends of a vioduct tunnel.
//!
//! Everything that crosses a boundary lives here: the slot-tagged frame
//! format carried on the virtio link ([`frame`]), the connect preamble that
//! opens a stream ([`preamble`]), and the SOCKS5 subset spoken to local
//! clients ([`socks`]). The crate is pure byte-shuffling with no I/O, so
//! both proxies and their tests depend on the exact same codec.

pub mod frame;
pub mod preamble;
pub mod socks;

pub use frame::{DEFAULT_FRAME_CAP, FrameDecoder, HEADER_SIZE, WireError, encode_into};
pub use preamble::{PreambleError, TargetAddr};
