// Platform Sync Engine
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use platform_wire::Error as WireError;

/// Error kinds shared by every component of the engine (§7).
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// invalid parameter passed to the call
    BadParam,

    /// allocation failed
    NoMem,

    /// requested item was not found
    NotFound,

    /// item already exists / field already set
    AlreadyExists,

    /// malformed wire data: {0}
    #[from]
    BadFormat(WireError),

    /// a sequence number or state transition moved backwards
    BadOrder,

    /// reading persisted state failed
    ReadFailed,

    /// writing persisted state failed
    WriteFailed,

    /// operation is invalid in the current state: {0}
    InvalidState(&'static str),

    /// operation timed out
    Timeout,

    /// unrecoverable failure; the session must be torn down
    Unrecoverable,
}

pub type Result<T> = std::result::Result<T, Error>;
