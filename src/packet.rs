//! The instruction-flow packet format read by [`crate::decoder::FlowDecoder`].
//!
//! A flow trace is a byte stream of packets. Each packet starts with an
//! opcode byte, followed by a fixed-size little-endian payload:
//!
//! | opcode | packet  | payload |
//! |--------|---------|---------|
//! | `0x00` | PAD     | none |
//! | `0x02` | PSB     | 15 more bytes completing the sync pattern |
//! | `0x10` | IP      | `u64` address of an executed instruction |
//! | `0x20` | PIP     | `u64` CR3 value |
//! | `0x30` | MODE    | `u8` execution mode: 16, 32 or 64 |
//! | `0x40` | ENABLE  | none |
//! | `0x41` | DISABLE | none |
//! | `0x50` | OVF     | none |
//!
//! The PSB pattern lets a reader find packet boundaries from any position in
//! the stream.

use std::io::Write;

use crate::{
    diag::Result,
    insn::ExecMode,
    status::{PtResult, Status},
};

/// Synchronization pattern.
pub const PSB: [u8; 16] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
    0x02, 0x82,
];

const OPC_PAD: u8 = 0x00;
const OPC_PSB: u8 = 0x02;
const OPC_IP: u8 = 0x10;
const OPC_PIP: u8 = 0x20;
const OPC_MODE: u8 = 0x30;
const OPC_ENABLE: u8 = 0x40;
const OPC_DISABLE: u8 = 0x41;
const OPC_OVF: u8 = 0x50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Pad,
    Psb,
    Ip(u64),
    Pip(u64),
    Mode(ExecMode),
    Enable,
    Disable,
    Ovf,
}

fn payload_u64(buf: &[u8]) -> PtResult<u64> {
    let bytes: [u8; 8] = buf
        .get(1..9)
        .ok_or(Status::Eos)?
        .try_into()
        .map_err(|_| Status::Internal)?;
    Ok(u64::from_le_bytes(bytes))
}

impl Packet {
    /// Decodes the packet at the start of `buf`, returning it with its size.
    ///
    /// # Errors
    ///
    /// Returns `Status::Eos` if `buf` is empty or ends inside the packet,
    /// `Status::BadOpc` for an unknown opcode and `Status::BadPacket` for a
    /// malformed payload.
    pub fn decode(buf: &[u8]) -> PtResult<(Packet, usize)> {
        let opcode = *buf.first().ok_or(Status::Eos)?;
        match opcode {
            OPC_PAD => Ok((Packet::Pad, 1)),
            OPC_PSB => match buf.get(..PSB.len()) {
                Some(pattern) if pattern == PSB => Ok((Packet::Psb, PSB.len())),
                Some(_) => Err(Status::BadPacket),
                None => Err(Status::Eos),
            },
            OPC_IP => Ok((Packet::Ip(payload_u64(buf)?), 9)),
            OPC_PIP => Ok((Packet::Pip(payload_u64(buf)?), 9)),
            OPC_MODE => {
                let bits = *buf.get(1).ok_or(Status::Eos)?;
                Ok((Packet::Mode(ExecMode::try_from(bits)?), 2))
            }
            OPC_ENABLE => Ok((Packet::Enable, 1)),
            OPC_DISABLE => Ok((Packet::Disable, 1)),
            OPC_OVF => Ok((Packet::Ovf, 1)),
            _ => Err(Status::BadOpc),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Packet::Pad => out.push(OPC_PAD),
            Packet::Psb => out.extend_from_slice(&PSB),
            Packet::Ip(ip) => {
                out.push(OPC_IP);
                out.extend_from_slice(&ip.to_le_bytes());
            }
            Packet::Pip(cr3) => {
                out.push(OPC_PIP);
                out.extend_from_slice(&cr3.to_le_bytes());
            }
            Packet::Mode(mode) => out.extend_from_slice(&[OPC_MODE, mode.bits()]),
            Packet::Enable => out.push(OPC_ENABLE),
            Packet::Disable => out.push(OPC_DISABLE),
            Packet::Ovf => out.push(OPC_OVF),
        }
    }
}

/// Position of the first PSB at or after `from`.
#[must_use]
pub fn find_psb(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(PSB.len())
        .position(|window| window == PSB)
        .map(|position| position + from)
}

/// Streams packets to `W`, tracking the output offset.
pub struct Writer<W: Write> {
    out: W,
    offset: u64,
    scratch: Vec<u8>,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            offset: 0,
            scratch: Vec::with_capacity(PSB.len()),
        }
    }

    /// Number of bytes written so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// # Errors
    ///
    /// Returns an `Err` if writing to the underlying output fails.
    pub fn write(&mut self, packet: &Packet) -> Result<()> {
        self.scratch.clear();
        packet.encode(&mut self.scratch);
        self.out.write_all(&self.scratch)?;
        self.offset += self.scratch.len() as u64;
        Ok(())
    }

    /// Writes a PSB followed by the state a decoder needs to resume there.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if writing to the underlying output fails.
    pub fn sync(&mut self, mode: ExecMode, cr3: Option<u64>) -> Result<()> {
        self.write(&Packet::Psb)?;
        self.write(&Packet::Mode(mode))?;
        if let Some(cr3) = cr3 {
            self.write(&Packet::Pip(cr3))?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an `Err` if flushing the underlying output fails.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
