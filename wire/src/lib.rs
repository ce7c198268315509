// Platform Sync Engine — binary frame codec.
// Written for the platform sync protocol.
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code
)]

#[macro_use]
extern crate amplify_derive;

mod error;
mod header;
mod reader;
mod writer;

pub use error::Error;
pub use header::{
    aligned_len, ExtensionHeader, FrameHeader, ALIGNMENT, EXTENSION_HEADER_SIZE, FRAME_HEADER_SIZE,
};
pub use reader::MessageReader;
pub use writer::{extension_record_len, MessageWriter};

/// Size in bytes of a SHA-1 digest, used throughout the protocol for the
/// endpoint public key hash, the profile hash and the configuration hash.
pub const SHA1_LEN: usize = 20;
