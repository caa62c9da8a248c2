//! Command-stream framing.
//!
//! A stream is a flat slice of dwords. Each command starts with a one-dword
//! header carrying the command kind and a 16-bit argument; raw hardware
//! packets are followed by their payload dwords. The driver emits these
//! headers as it builds the command buffer and the kernel walks them at
//! submission time, which is also how the kernel learns that a DMA buffer
//! can be recycled ([`Cmd::DmaDiscard`]).
//!
//! Header layout:
//!
//! ```text
//! bits  0..8   command kind
//! bits  8..24  argument (payload dword count, buffer index, or wait flags)
//! bits 24..32  reserved, must be zero
//! ```

use bitflags::bitflags;
use thiserror::Error;

const HEADER_KIND_MASK: u32 = 0x0000_00ff;
const HEADER_ARG_SHIFT: u32 = 8;
const HEADER_ARG_MASK: u32 = 0x00ff_ff00;
const HEADER_RESERVED_MASK: u32 = 0xff00_0000;

/// Command kinds understood by the stream parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdKind {
    /// Raw hardware packet; the argument is the payload dword count.
    Packet = 1,
    /// Release of a DMA buffer; the argument is the buffer index.
    DmaDiscard = 2,
    /// Engine-drain barrier; the argument is a [`WaitFlags`] value.
    Wait = 3,
}

impl CmdKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Packet),
            2 => Some(Self::DmaDiscard),
            3 => Some(Self::Wait),
            _ => None,
        }
    }
}

bitflags! {
    /// Engines a [`CmdKind::Wait`] command drains before later commands run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        const WAIT_2D = 1 << 0;
        const WAIT_3D = 1 << 1;
    }
}

/// A decoded command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub kind: CmdKind,
    pub arg: u16,
}

impl CmdHeader {
    pub fn encode(self) -> u32 {
        (self.kind as u32) | (u32::from(self.arg) << HEADER_ARG_SHIFT)
    }

    pub fn decode(raw: u32, at: usize) -> Result<Self, CmdStreamError> {
        if raw & HEADER_RESERVED_MASK != 0 {
            return Err(CmdStreamError::ReservedBits { at });
        }
        let kind = (raw & HEADER_KIND_MASK) as u8;
        let kind = CmdKind::from_u8(kind).ok_or(CmdStreamError::UnknownKind { kind, at })?;
        let arg = ((raw & HEADER_ARG_MASK) >> HEADER_ARG_SHIFT) as u16;
        Ok(Self { kind, arg })
    }
}

/// Header for a raw packet of `count` payload dwords.
pub fn packet_header(count: u16) -> u32 {
    CmdHeader {
        kind: CmdKind::Packet,
        arg: count,
    }
    .encode()
}

/// Header releasing DMA buffer `buf_index` back to the kernel once the
/// engine has consumed every command before it in the stream.
pub fn dma_discard_header(buf_index: u16) -> u32 {
    CmdHeader {
        kind: CmdKind::DmaDiscard,
        arg: buf_index,
    }
    .encode()
}

/// Header draining the named engines.
pub fn wait_header(flags: WaitFlags) -> u32 {
    CmdHeader {
        kind: CmdKind::Wait,
        arg: flags.bits() as u16,
    }
    .encode()
}

/// A parsed command, borrowing its payload from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd<'a> {
    Packet(&'a [u32]),
    DmaDiscard { buf_index: u16 },
    Wait(WaitFlags),
}

/// Parse failures. `at` is the dword offset of the offending header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CmdStreamError {
    #[error("unknown command kind {kind:#04x} at dword {at}")]
    UnknownKind { kind: u8, at: usize },

    #[error("reserved header bits set at dword {at}")]
    ReservedBits { at: usize },

    #[error("empty raw packet at dword {at}")]
    EmptyPacket { at: usize },

    #[error("packet at dword {at} wants {need} payload dwords but {have} remain")]
    Truncated { at: usize, need: usize, have: usize },

    #[error("unknown wait flags {flags:#06x} at dword {at}")]
    UnknownWaitFlags { flags: u16, at: usize },
}

/// Iterator over the commands of a stream. Yields an error and then stops if
/// the stream is malformed.
#[derive(Debug)]
pub struct CmdStreamWalker<'a> {
    dwords: &'a [u32],
    pos: usize,
}

impl<'a> CmdStreamWalker<'a> {
    pub fn new(dwords: &'a [u32]) -> Self {
        Self { dwords, pos: 0 }
    }

    fn parse_next(&mut self) -> Result<Cmd<'a>, CmdStreamError> {
        let at = self.pos;
        let header = CmdHeader::decode(self.dwords[at], at)?;
        self.pos += 1;
        match header.kind {
            CmdKind::Packet => {
                let need = usize::from(header.arg);
                if need == 0 {
                    return Err(CmdStreamError::EmptyPacket { at });
                }
                let have = self.dwords.len() - self.pos;
                if need > have {
                    return Err(CmdStreamError::Truncated { at, need, have });
                }
                let payload = &self.dwords[self.pos..self.pos + need];
                self.pos += need;
                Ok(Cmd::Packet(payload))
            }
            CmdKind::DmaDiscard => Ok(Cmd::DmaDiscard {
                buf_index: header.arg,
            }),
            CmdKind::Wait => {
                let flags = WaitFlags::from_bits(u32::from(header.arg)).ok_or(
                    CmdStreamError::UnknownWaitFlags {
                        flags: header.arg,
                        at,
                    },
                )?;
                Ok(Cmd::Wait(flags))
            }
        }
    }
}

impl<'a> Iterator for CmdStreamWalker<'a> {
    type Item = Result<Cmd<'a>, CmdStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.dwords.len() {
            return None;
        }
        let item = self.parse_next();
        if item.is_err() {
            // Stop at the first malformed command.
            self.pos = self.dwords.len();
        }
        Some(item)
    }
}
