//! # sigil-protocol
//!
//! Encoding shared by every sigil component.
//!
//! This crate defines two things:
//!
//! - **Body** - the plaintext payload an application encrypts and receives
//! - **Frame** - the binary protocol spoken between a relay server and its
//!   clients, including codecs and versioning
//!
//! ## Frame Types
//!
//! - `Subscribe` / `Unsubscribe` / `Reset` - Channel membership (batch)
//! - `Send` / `Message` - Ciphertext delivery
//! - `Results` / `Tickets` / `Error` - Replies to requests
//!
//! ## Example
//!
//! ```rust
//! use sigil_protocol::{Frame, codec};
//!
//! let frame = Frame::send(1, "a1b2c3", b"sealed".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod body;
pub mod codec;
pub mod frames;
pub mod version;

pub use body::Body;
pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
