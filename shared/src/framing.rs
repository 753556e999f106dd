//! Length-prefixed framing for the reliable channel.
//!
//! Every message on the reliable stream is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   body             |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The prefix encodes the body size as a `u32` in network byte order and does
//! **not** include the 4 prefix bytes themselves. A length of 0 is a valid
//! frame and must be delivered like any other. Datagrams on the unreliable
//! channel carry no prefix at all: the datagram boundary is the frame
//! boundary.
//!
//! The codec is pure byte manipulation so that the same functions serve the
//! receive path (which reads prefixes off the socket) and the send path
//! (which writes them). Endianness is fixed regardless of the host.

use thiserror::Error;

/// Size of the length prefix on the reliable channel.
pub const HEADER_LEN: usize = 4;

/// Size of the authentication token exchanged before framing begins.
pub const TOKEN_LEN: usize = 8;

/// Errors produced while validating frame metadata.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The declared body length is at or beyond the configured maximum.
    #[error("declared frame body of {size} bytes reaches maximum {max}")]
    BodyTooLarge {
        /// The length the peer declared.
        size: u32,
        /// The configured rejection threshold.
        max: u32,
    },
}

/// Encode a body length into the 4-byte wire prefix.
pub fn encode_header(body_len: u32) -> [u8; HEADER_LEN] {
    body_len.to_be_bytes()
}

/// Decode the 4-byte wire prefix into a body length.
pub fn decode_header(header: [u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(header)
}

/// Validate a declared body length against the configured maximum.
///
/// Lengths equal to or greater than `max` are rejected; the threshold itself
/// is not a legal body size.
pub fn check_body_length(len: u32, max: u32) -> Result<usize, FrameError> {
    if len >= max {
        Err(FrameError::BodyTooLarge { size: len, max })
    } else {
        Ok(len as usize)
    }
}
