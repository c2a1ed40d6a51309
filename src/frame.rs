//! Wire encoding for the frames that announce and retire locally issued CIDs
//!
//! Frame structs carry exactly the fields the issued-CID set supplies; scheduling them into
//! packets and accounting for their acknowledgment belongs to the connection layer.

use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt};
use crate::issued_cid::IssuedCid;
use crate::shared::ConnectionId;
use crate::token::ResetToken;
use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE};

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Type(u64);

impl coding::Codec for Type {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl Type {
            $(pub const $name: Type = Type($val);)*
        }

        impl fmt::Debug for Type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for Type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
}

pub trait FrameStruct {
    /// Smallest number of bytes this type of frame is guaranteed to fit within.
    const SIZE_BOUND: usize;
}

/// Reasons a frame failed to decode
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum FrameDecodeError {
    #[error("unexpected end of buffer")]
    UnexpectedEnd,
    #[error("malformed frame")]
    Malformed,
}

impl From<coding::UnexpectedEnd> for FrameDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// Announces a newly usable CID and its stateless reset token to the peer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NewConnectionId {
    /// Distinguishes this CID from every other issued on the connection
    pub sequence: u64,
    /// Sequence below which the peer must retire its CIDs
    ///
    /// The issued-CID set does not track this; the connection layer owns it.
    pub retire_prior_to: u64,
    pub id: ConnectionId,
    pub reset_token: ResetToken,
}

impl NewConnectionId {
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(Type::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write_var(self.retire_prior_to);
        out.put_u8(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }

    /// Decode the frame body, the type having been consumed by the caller's dispatch
    pub fn decode<R: Buf>(bytes: &mut R) -> Result<Self, FrameDecodeError> {
        let sequence = bytes.get_var()?;
        let retire_prior_to = bytes.get_var()?;
        if retire_prior_to > sequence {
            return Err(FrameDecodeError::Malformed);
        }
        let length = bytes.get::<u8>()? as usize;
        if length > MAX_CID_SIZE || length == 0 {
            return Err(FrameDecodeError::Malformed);
        }
        if bytes.remaining() < length {
            return Err(FrameDecodeError::UnexpectedEnd);
        }
        let mut stage = [0; MAX_CID_SIZE];
        bytes.copy_to_slice(&mut stage[0..length]);
        let id = ConnectionId::new(&stage[..length]);
        if bytes.remaining() < RESET_TOKEN_SIZE {
            return Err(FrameDecodeError::UnexpectedEnd);
        }
        let mut reset_token = [0; RESET_TOKEN_SIZE];
        bytes.copy_to_slice(&mut reset_token);
        Ok(Self {
            sequence,
            retire_prior_to,
            id,
            reset_token: reset_token.into(),
        })
    }
}

impl FrameStruct for NewConnectionId {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 1 + MAX_CID_SIZE + RESET_TOKEN_SIZE;
}

impl From<&IssuedCid> for NewConnectionId {
    fn from(entry: &IssuedCid) -> Self {
        Self {
            sequence: entry.sequence(),
            retire_prior_to: 0,
            id: *entry.cid(),
            reset_token: *entry.reset_token(),
        }
    }
}

/// Tells the peer a CID the local endpoint issued is no longer usable
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RetireConnectionId {
    pub sequence: u64,
}

impl RetireConnectionId {
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(Type::RETIRE_CONNECTION_ID);
        out.write_var(self.sequence);
    }

    /// Decode the frame body, the type having been consumed by the caller's dispatch
    pub fn decode<R: Buf>(bytes: &mut R) -> Result<Self, FrameDecodeError> {
        Ok(Self {
            sequence: bytes.get_var()?,
        })
    }
}

impl FrameStruct for RetireConnectionId {
    const SIZE_BOUND: usize = 1 + 8;
}
