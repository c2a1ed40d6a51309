//! Management of the connection IDs a QUIC endpoint issues to its peer
//!
//! An endpoint hands out several CIDs so a connection can survive path migration and rotate
//! identifiers to resist linkability. [`IssuedCidSet`] tracks each issued CID from creation
//! through transmission, acknowledgment, loss and retirement, and tells the caller when
//! NEW_CONNECTION_ID or RETIRE_CONNECTION_ID frames must go on the wire. The bytes themselves
//! come from a [`CidEncryptor`] capability; a connection without one uses zero-length CIDs and
//! never issues anything.

// basic wire primitives
pub mod coding;
mod varint;
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

mod shared;
pub use crate::shared::ConnectionId;

mod token;
pub use crate::token::ResetToken;

/// used for [`ResetToken`]
mod constant_time;

// the CID encryption capability
mod cid_encryptor;
pub use crate::cid_encryptor::{CidEncryptor, CidPlaintext, HashedCidEncryptor};

// the issued-CID state machine
mod issued_cid;
pub use crate::issued_cid::{CidOutcome, IssuedCid, IssuedCidSet, IssuedCidState};

// frame serialization for the fields the set supplies
pub mod frame;

/// Maximum number of bytes in a connection ID
const MAX_CID_SIZE: usize = 20;
/// Length of a stateless reset token
const RESET_TOKEN_SIZE: usize = 16;
/// The maximum number of CIDs we bother to issue per connection
const LOC_CID_COUNT: usize = 8;
