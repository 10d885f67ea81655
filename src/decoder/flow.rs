use std::{mem, ops::Range, sync::Arc};

use tracing::trace;

use crate::{
    asm::Parsers,
    decoder::PacketDecoder,
    image::ImageStore,
    insn::{ExecMode, Insn, InsnFlags, MAX_INSN_LEN},
    packet::{self, Packet, PSB},
    status::{PtResult, Status, StatusFlags},
};

/// [`PacketDecoder`] for the flow format described in [`crate::packet`].
///
/// Every IP packet is one executed instruction. Its bytes come from the
/// image store; capstone sizes and classifies it in the current execution
/// mode. Status packets following a PSB are consumed at sync time so that
/// mode and CR3 are known before the first instruction.
pub struct FlowDecoder {
    trace: Arc<[u8]>,
    begin: usize,
    end: usize,
    pos: usize,
    synced: bool,
    sync: Option<usize>,
    cr3: Option<u64>,
    mode: ExecMode,
    enabled: bool,
    pending: InsnFlags,
    status: StatusFlags,
    ip: Option<u64>,
    parsers: Parsers,
}

impl FlowDecoder {
    fn packet_at(&self, pos: usize) -> PtResult<(Packet, usize)> {
        if pos >= self.end {
            return Err(Status::Eos);
        }
        Packet::decode(&self.trace[pos..self.end])
    }

    fn synchronize(&mut self, psb: usize) -> u64 {
        self.synced = true;
        self.sync = Some(psb);
        self.pos = psb + PSB.len();
        self.cr3 = None;
        self.mode = ExecMode::default();
        self.enabled = true;
        self.pending = InsnFlags::empty();
        self.status = StatusFlags::empty();
        self.read_header();

        trace!("synchronized at {psb:#x}");
        psb as u64
    }

    fn read_header(&mut self) {
        while let Ok((packet, size)) = self.packet_at(self.pos) {
            match packet {
                Packet::Psb | Packet::Ip(_) | Packet::Ovf => break,
                _ => {
                    self.apply(packet, self.pos);
                    self.pos += size;
                }
            }
        }
    }

    fn apply(&mut self, packet: Packet, at: usize) {
        match packet {
            // Same state as a fresh sync at `at`.
            Packet::Psb => {
                self.sync = Some(at);
                self.cr3 = None;
                self.mode = ExecMode::default();
                self.enabled = true;
            }
            Packet::Pip(cr3) => self.cr3 = Some(cr3),
            Packet::Mode(mode) => self.mode = mode,
            Packet::Enable => {
                self.enabled = true;
                self.pending |= InsnFlags::ENABLED;
            }
            Packet::Disable => self.enabled = false,
            Packet::Pad | Packet::Ip(_) | Packet::Ovf => {}
        }
    }

    /// Drops sync after a malformed packet. The next `sync_forward` scans
    /// from the byte after it.
    fn lose_sync(&mut self) {
        self.synced = false;
        self.pos = (self.pos + 1).min(self.end);
        self.status = StatusFlags::empty();
    }

    fn decode_at(&mut self, ip: u64, image: &ImageStore) -> PtResult<Insn> {
        let mut raw = [0u8; MAX_INSN_LEN];
        let len = image.read(ip, &mut raw)?;
        let instruction = self
            .parsers
            .get(self.mode)
            .map_err(|_| Status::Internal)?
            .get_instruction_from(&raw[..len], ip)
            .map_err(|_| Status::BadInsn)?;

        let mut insn = Insn::new(ip, &raw[..instruction.size()], instruction.class(), self.mode);
        insn.flags = mem::take(&mut self.pending);
        Ok(insn)
    }

    /// Peeks past `insn` to report what follows it, without consuming
    /// anything.
    fn lookahead(&self, insn: &mut Insn) -> StatusFlags {
        let mut pos = self.pos;
        loop {
            match self.packet_at(pos) {
                Ok((Packet::Pad, size)) => pos += size,
                Ok((Packet::Ip(next), _)) => {
                    if !insn.iclass.changes_flow() && next != insn.next_ip() {
                        insn.flags |= InsnFlags::INTERRUPTED;
                    }
                    return StatusFlags::empty();
                }
                Ok((Packet::Disable, _)) => {
                    insn.flags |= InsnFlags::DISABLED;
                    return StatusFlags::EVENT_PENDING;
                }
                Ok(_) => return StatusFlags::EVENT_PENDING,
                Err(Status::Eos) => return StatusFlags::EOS,
                // Reported by the next call.
                Err(_) => return StatusFlags::empty(),
            }
        }
    }
}

impl PacketDecoder for FlowDecoder {
    fn new(trace: Arc<[u8]>, range: Range<usize>) -> PtResult<Self> {
        if range.start > range.end || range.end > trace.len() {
            return Err(Status::BadConfig);
        }

        Ok(Self {
            trace,
            begin: range.start,
            end: range.end,
            pos: range.start,
            synced: false,
            sync: None,
            cr3: None,
            mode: ExecMode::default(),
            enabled: true,
            pending: InsnFlags::empty(),
            status: StatusFlags::empty(),
            ip: None,
            parsers: Parsers::default(),
        })
    }

    fn sync_forward(&mut self) -> PtResult<u64> {
        if let Some(psb) = packet::find_psb(&self.trace[..self.end], self.pos) {
            Ok(self.synchronize(psb))
        } else {
            self.pos = self.end;
            self.status = StatusFlags::EOS;
            Err(Status::Eos)
        }
    }

    fn sync_set(&mut self, offset: u64) -> PtResult<()> {
        let at = usize::try_from(offset).map_err(|_| Status::Eos)?;
        if at < self.begin || at >= self.end {
            return Err(Status::Eos);
        }
        if !self.trace[at..self.end].starts_with(&PSB) {
            return Err(Status::Nosync);
        }

        self.synchronize(at);
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.pos as u64
    }

    fn sync_offset(&self) -> PtResult<u64> {
        self.sync.map(|sync| sync as u64).ok_or(Status::Nosync)
    }

    fn status(&self) -> StatusFlags {
        if self.enabled {
            self.status
        } else {
            self.status | StatusFlags::TRACING_DISABLED
        }
    }

    fn next_insn(&mut self, image: &ImageStore) -> PtResult<(Insn, StatusFlags)> {
        if !self.synced {
            return Err(Status::Nosync);
        }

        let ip = loop {
            let at = self.pos;
            let (packet, size) = match self.packet_at(at) {
                Ok(decoded) => decoded,
                Err(Status::Eos) => {
                    self.pos = self.end;
                    self.status = StatusFlags::EOS;
                    return Err(Status::Eos);
                }
                Err(status) => {
                    trace!("{} at {at:#x}", status.name());
                    self.lose_sync();
                    return Err(status);
                }
            };
            self.pos += size;

            match packet {
                Packet::Ip(ip) => break ip,
                Packet::Ovf => {
                    self.pending |= InsnFlags::RESYNCED;
                    self.status = StatusFlags::empty();
                    return Err(Status::Overflow);
                }
                packet => self.apply(packet, at),
            }
        };

        self.ip = Some(ip);
        if !self.enabled {
            return Err(Status::NoEnable);
        }

        let mut insn = self.decode_at(ip, image)?;
        let flags = self.lookahead(&mut insn);
        self.status = flags;
        Ok((insn, flags))
    }

    fn ip(&self) -> Option<u64> {
        self.ip
    }

    fn cr3(&self) -> PtResult<u64> {
        if !self.synced {
            return Err(Status::Nosync);
        }
        self.cr3.ok_or(Status::Nomap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{insn::InsnClass, packet::Writer};

    // 0x1000 mov %rsp,%rbp; 0x1003 xor %eax,%eax; 0x1005 call 0x100a;
    // 0x100a ret; 0x100b invalid in 64-bit mode.
    const CODE: [u8; 12] = [
        0x48, 0x89, 0xe5, 0x31, 0xc0, 0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3, 0x06,
    ];

    fn images() -> ImageStore {
        let mut images = ImageStore::new();
        images.add_buffer("code", CODE.to_vec(), 0x1000).expect("add");
        images
    }

    fn encode(packets: &[Packet]) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());
        for packet in packets {
            writer.write(packet).expect("write");
        }
        writer.into_inner()
    }

    fn decoder(packets: &[Packet]) -> FlowDecoder {
        let trace: Arc<[u8]> = encode(packets).into();
        let len = trace.len();
        FlowDecoder::new(trace, 0..len).expect("decoder")
    }

    #[test]
    fn test_nosync_before_sync() {
        let mut decoder = decoder(&[Packet::Psb, Packet::Ip(0x1000)]);
        assert_eq!(decoder.next_insn(&images()), Err(Status::Nosync));
        assert_eq!(decoder.sync_offset(), Err(Status::Nosync));
        assert_eq!(decoder.cr3(), Err(Status::Nosync));
    }

    #[test]
    fn test_no_psb_is_eos() {
        let mut decoder = decoder(&[Packet::Ip(0x1000), Packet::Ip(0x1003)]);
        assert_eq!(decoder.sync_forward(), Err(Status::Eos));
        assert_eq!(decoder.sync_forward(), Err(Status::Eos));
        assert_eq!(decoder.next_insn(&images()), Err(Status::Nosync));
    }

    #[test]
    fn test_straight_line_then_eos() {
        let mut decoder = decoder(&[Packet::Psb, Packet::Ip(0x1000), Packet::Ip(0x1003)]);
        let images = images();
        assert_eq!(decoder.sync_forward(), Ok(0));

        let (first, flags) = decoder.next_insn(&images).expect("first");
        assert_eq!(first.ip, 0x1000);
        assert_eq!(first.size, 3);
        assert_eq!(first.bytes(), &[0x48, 0x89, 0xe5]);
        assert!(flags.is_empty());

        let (second, flags) = decoder.next_insn(&images).expect("second");
        assert_eq!(second.ip, 0x1003);
        assert_eq!(second.size, 2);
        assert_eq!(flags, StatusFlags::EOS);

        assert_eq!(decoder.next_insn(&images), Err(Status::Eos));
        assert_eq!(decoder.next_insn(&images), Err(Status::Eos));
        assert!(decoder.status().contains(StatusFlags::EOS));
    }

    #[test]
    fn test_header_is_read_at_sync() {
        let mut decoder = decoder(&[
            Packet::Pad,
            Packet::Psb,
            Packet::Mode(ExecMode::Bit64),
            Packet::Pip(0xabc000),
            Packet::Ip(0x1000),
        ]);
        assert_eq!(decoder.sync_forward(), Ok(1));
        assert_eq!(decoder.cr3(), Ok(0xabc000));
        assert_eq!(decoder.sync_offset(), Ok(1));
        assert_eq!(decoder.offset(), 1 + 16 + 2 + 9);
    }

    #[test]
    fn test_cr3_untracked() {
        let mut decoder = decoder(&[Packet::Psb, Packet::Ip(0x1000)]);
        decoder.sync_forward().expect("sync");
        assert_eq!(decoder.cr3(), Err(Status::Nomap));
    }

    #[test]
    fn test_branches_and_interruptions() {
        let mut decoder = decoder(&[
            Packet::Psb,
            Packet::Ip(0x1005),
            Packet::Ip(0x100a),
            Packet::Ip(0x1000),
            Packet::Ip(0x1005),
        ]);
        let images = images();
        decoder.sync_forward().expect("sync");

        let (call, _) = decoder.next_insn(&images).expect("call");
        assert_eq!(call.iclass, InsnClass::Call);
        assert!(!call.flags.contains(InsnFlags::INTERRUPTED));

        let (ret, _) = decoder.next_insn(&images).expect("ret");
        assert_eq!(ret.iclass, InsnClass::Return);

        let (mov, _) = decoder.next_insn(&images).expect("mov");
        assert_eq!(mov.iclass, InsnClass::Other);
        assert!(mov.flags.contains(InsnFlags::INTERRUPTED));
    }

    #[test]
    fn test_missing_and_invalid_bytes() {
        let mut decoder = decoder(&[
            Packet::Psb,
            Packet::Ip(0x2000),
            Packet::Ip(0x100b),
            Packet::Ip(0x1000),
        ]);
        let images = images();
        decoder.sync_forward().expect("sync");

        assert_eq!(decoder.next_insn(&images), Err(Status::Nomap));
        assert_eq!(decoder.ip(), Some(0x2000));
        assert_eq!(decoder.next_insn(&images), Err(Status::BadInsn));
        assert_eq!(decoder.ip(), Some(0x100b));
        assert_eq!(decoder.next_insn(&images).expect("mov").0.ip, 0x1000);
    }

    #[test]
    fn test_overflow_resyncs() {
        let mut decoder = decoder(&[
            Packet::Psb,
            Packet::Ip(0x1000),
            Packet::Ovf,
            Packet::Ip(0x1003),
        ]);
        let images = images();
        decoder.sync_forward().expect("sync");

        let (_, flags) = decoder.next_insn(&images).expect("mov");
        assert_eq!(flags, StatusFlags::EVENT_PENDING);
        assert_eq!(decoder.next_insn(&images), Err(Status::Overflow));
        let (xor, _) = decoder.next_insn(&images).expect("xor");
        assert!(xor.flags.contains(InsnFlags::RESYNCED));
    }

    #[test]
    fn test_disable_enable() {
        let mut decoder = decoder(&[
            Packet::Psb,
            Packet::Ip(0x1000),
            Packet::Disable,
            Packet::Ip(0x1003),
            Packet::Enable,
            Packet::Ip(0x1003),
        ]);
        let images = images();
        decoder.sync_forward().expect("sync");

        let (mov, flags) = decoder.next_insn(&images).expect("mov");
        assert!(mov.flags.contains(InsnFlags::DISABLED));
        assert_eq!(flags, StatusFlags::EVENT_PENDING);

        assert_eq!(decoder.next_insn(&images), Err(Status::NoEnable));
        assert!(decoder.status().contains(StatusFlags::TRACING_DISABLED));

        let (xor, _) = decoder.next_insn(&images).expect("xor");
        assert!(xor.flags.contains(InsnFlags::ENABLED));
        assert!(!decoder.status().contains(StatusFlags::TRACING_DISABLED));
    }

    #[test]
    fn test_bad_opcode_drops_sync() {
        let mut bytes = encode(&[Packet::Psb, Packet::Ip(0x1000)]);
        bytes.push(0xff);
        bytes.extend(encode(&[Packet::Psb, Packet::Ip(0x1003)]));
        let len = bytes.len();
        let mut decoder = FlowDecoder::new(bytes.into(), 0..len).expect("decoder");
        let images = images();

        decoder.sync_forward().expect("sync");
        decoder.next_insn(&images).expect("mov");
        assert_eq!(decoder.next_insn(&images), Err(Status::BadOpc));
        assert_eq!(decoder.next_insn(&images), Err(Status::Nosync));
        assert_eq!(decoder.sync_forward(), Ok(16 + 9 + 1));
        assert_eq!(decoder.next_insn(&images).expect("xor").0.ip, 0x1003);
    }

    #[test]
    fn test_sync_set() {
        let bytes = encode(&[Packet::Psb, Packet::Ip(0x1000), Packet::Psb, Packet::Ip(0x1003)]);
        let len = bytes.len();
        let mut decoder = FlowDecoder::new(bytes.into(), 0..len).expect("decoder");
        let images = images();

        assert_eq!(decoder.sync_set(3), Err(Status::Nosync));
        assert_eq!(decoder.sync_set(len as u64), Err(Status::Eos));
        decoder.sync_set(25).expect("second psb");
        assert_eq!(decoder.next_insn(&images).expect("xor").0.ip, 0x1003);
        decoder.sync_set(0).expect("first psb");
        assert_eq!(decoder.next_insn(&images).expect("mov").0.ip, 0x1000);
    }

    #[test]
    fn test_mid_stream_psb_updates_sync_offset() {
        let mut decoder = decoder(&[
            Packet::Psb,
            Packet::Ip(0x1000),
            Packet::Psb,
            Packet::Ip(0x1003),
        ]);
        let images = images();
        decoder.sync_forward().expect("sync");
        decoder.next_insn(&images).expect("mov");
        assert_eq!(decoder.sync_offset(), Ok(0));
        decoder.next_insn(&images).expect("xor");
        assert_eq!(decoder.sync_offset(), Ok(25));
    }

    #[test]
    fn test_mid_stream_psb_resets_header_state() {
        let mut decoder = decoder(&[
            Packet::Psb,
            Packet::Mode(ExecMode::Bit32),
            Packet::Pip(0xabc000),
            Packet::Ip(0x1003),
            Packet::Psb,
            Packet::Ip(0x1000),
        ]);
        let images = images();
        decoder.sync_forward().expect("sync");

        let (xor, _) = decoder.next_insn(&images).expect("xor");
        assert_eq!(xor.mode, ExecMode::Bit32);
        assert_eq!(decoder.cr3(), Ok(0xabc000));

        let (mov, _) = decoder.next_insn(&images).expect("mov");
        assert_eq!(mov.mode, ExecMode::Bit64);
        assert_eq!(mov.size, 3);
        assert_eq!(decoder.cr3(), Err(Status::Nomap));
    }

    #[test]
    fn test_range_restriction() {
        let bytes = encode(&[Packet::Psb, Packet::Ip(0x1000), Packet::Psb, Packet::Ip(0x1003)]);
        let len = bytes.len();
        let trace: Arc<[u8]> = bytes.into();

        let mut first = FlowDecoder::new(Arc::clone(&trace), 0..25).expect("decoder");
        let images = images();
        assert_eq!(first.sync_forward(), Ok(0));
        let (_, flags) = first.next_insn(&images).expect("mov");
        assert_eq!(flags, StatusFlags::EOS);
        assert_eq!(first.sync_forward(), Err(Status::Eos));

        let mut second = FlowDecoder::new(trace, 25..len).expect("decoder");
        assert_eq!(second.sync_forward(), Ok(25));
        assert_eq!(second.next_insn(&images).expect("xor").0.ip, 0x1003);

        assert!(FlowDecoder::new(Arc::from(vec![0u8; 4]), 0..5).is_err());
    }

    #[test]
    fn test_mode_switch() {
        let mut images = ImageStore::new();
        images.add_buffer("code32", vec![0x40, 0x90], 0x8000).expect("add");
        let mut decoder = decoder(&[
            Packet::Psb,
            Packet::Mode(ExecMode::Bit32),
            Packet::Ip(0x8000),
        ]);
        decoder.sync_forward().expect("sync");

        let (inc, _) = decoder.next_insn(&images).expect("inc");
        assert_eq!(inc.mode, ExecMode::Bit32);
        assert_eq!(inc.size, 1);
    }
}
