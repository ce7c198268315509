// Platform Sync Engine
// Written for the platform sync protocol's wire codec.
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

/// Errors produced while reading or writing a sync frame.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// the buffer was truncated or did not contain enough bytes for the
    /// requested field
    BadFormat,

    /// frame header carries protocol id {actual:#010x}, expected
    /// {expected:#010x}
    BadProtocolId { expected: u32, actual: u32 },

    /// frame header carries protocol version {actual}, expected {expected}
    BadProtocolVersion { expected: u16, actual: u16 },

    /// requested write of {0} bytes would overflow the destination buffer
    BufferTooSmall(usize),

    /// extension payload length {0} exceeds the maximum representable in a
    /// 32-bit length field
    PayloadTooLarge(usize),
}
