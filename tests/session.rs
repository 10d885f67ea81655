use std::{ops::Range, sync::Arc};

use ipt_rs::{
    config::Config,
    decoder::PacketDecoder,
    image::ImageStore,
    insn::{Insn, InsnClass, InsnFlags},
    packet::Packet,
    session::Session,
    status::{PtResult, Status, StatusFlags},
};

pub mod testlib;

/// A backend driven by a one-letter script: `P` is a sync point, `i` a
/// straight-line instruction, `j` a jump, `x` an undecodable instruction and
/// `m` an unmapped one. Instructions are laid out one byte apart.
struct Script {
    script: Arc<[u8]>,
    end: usize,
    pos: usize,
    synced: bool,
    sync: Option<usize>,
    ip: u64,
    last_ip: Option<u64>,
}

impl Script {
    fn flags_after(&self) -> StatusFlags {
        match self.script.get(self.pos) {
            _ if self.pos >= self.end => StatusFlags::EOS,
            Some(b'P') => StatusFlags::EVENT_PENDING,
            _ => StatusFlags::empty(),
        }
    }
}

impl PacketDecoder for Script {
    fn new(script: Arc<[u8]>, range: Range<usize>) -> PtResult<Self> {
        if range.end > script.len() {
            return Err(Status::BadConfig);
        }
        Ok(Self {
            script,
            end: range.end,
            pos: range.start,
            synced: false,
            sync: None,
            ip: 0x40_0000,
            last_ip: None,
        })
    }

    fn sync_forward(&mut self) -> PtResult<u64> {
        let found = (self.pos..self.end).find(|&pos| self.script[pos] == b'P');
        let Some(pos) = found else {
            self.pos = self.end;
            return Err(Status::Eos);
        };
        self.sync_set(pos as u64)?;
        Ok(pos as u64)
    }

    fn sync_set(&mut self, offset: u64) -> PtResult<()> {
        let pos = usize::try_from(offset).map_err(|_| Status::Eos)?;
        if pos >= self.end {
            return Err(Status::Eos);
        }
        if self.script[pos] != b'P' {
            return Err(Status::Nosync);
        }
        self.synced = true;
        self.sync = Some(pos);
        self.pos = pos + 1;
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.pos as u64
    }

    fn sync_offset(&self) -> PtResult<u64> {
        self.sync.map(|sync| sync as u64).ok_or(Status::Nosync)
    }

    fn status(&self) -> StatusFlags {
        self.flags_after()
    }

    fn next_insn(&mut self, _image: &ImageStore) -> PtResult<(Insn, StatusFlags)> {
        if !self.synced {
            return Err(Status::Nosync);
        }
        while self.pos < self.end && self.script[self.pos] == b'P' {
            self.sync = Some(self.pos);
            self.pos += 1;
        }
        if self.pos >= self.end {
            return Err(Status::Eos);
        }

        let command = self.script[self.pos];
        self.pos += 1;
        let ip = self.ip;
        self.ip += 1;
        self.last_ip = Some(ip);

        let iclass = match command {
            b'i' => InsnClass::Other,
            b'j' => InsnClass::Jump,
            b'x' => return Err(Status::BadInsn),
            b'm' => return Err(Status::Nomap),
            _ => return Err(Status::BadOpc),
        };
        let insn = Insn::new(ip, &[0x90], iclass, Default::default());
        Ok((insn, self.flags_after()))
    }

    fn ip(&self) -> Option<u64> {
        self.last_ip
    }

    fn cr3(&self) -> PtResult<u64> {
        if self.synced {
            Ok(0x1000)
        } else {
            Err(Status::Nosync)
        }
    }
}

fn scripted(script: &str) -> Session<Script> {
    let mut session = Session::<Script>::with_backend();
    session
        .open_buffer(script.as_bytes(), &Config::default())
        .expect("Failed to open script");
    session
}

#[test]
fn test_backend_nosync_and_eos() {
    let mut session = scripted("iiPii");
    assert_eq!(session.decode_instruction(), Err(Status::Nosync));
    assert_eq!(session.decode_block(), Err(Status::Nosync));
    assert_eq!(session.get_current_cr3(), Err(Status::Nosync));

    assert_eq!(session.get_sync_offset(), Ok(2));
    assert_eq!(session.get_current_cr3(), Ok(0x1000));
    assert_eq!(session.get_sync_offset(), Err(Status::Eos));

    let mut empty = scripted("iiii");
    assert_eq!(empty.get_sync_offset(), Err(Status::Eos));
}

#[test]
fn test_backend_blocks_match_instructions() {
    let script = "PiiijiixiimiPiijPii";

    let mut by_insn = scripted(script);
    by_insn.get_sync_offset().expect("Failed to sync");
    let mut ips = Vec::new();
    let mut errors = Vec::new();
    loop {
        match by_insn.decode_instruction() {
            Ok(insn) => ips.push(insn.ip),
            Err(Status::Eos) => break,
            Err(status) => errors.push(status),
        }
    }

    let mut by_block = scripted(script);
    by_block.get_sync_offset().expect("Failed to sync");
    let mut block_ips = Vec::new();
    let mut block_errors = Vec::new();
    let mut ninsn = 0;
    loop {
        match by_block.decode_block() {
            Ok(block) => {
                assert_eq!(u64::from(block.ninsn), block.end_ip - block.ip);
                block_ips.extend(block.ip..block.end_ip);
                ninsn += block.ninsn;
            }
            Err(Status::Eos) => break,
            Err(status) => block_errors.push(status),
        }
    }

    assert_eq!(ips.len(), 14);
    assert_eq!(block_ips, ips);
    assert_eq!(ninsn as usize, ips.len());
    assert_eq!(errors, [Status::BadInsn, Status::Nomap]);
    assert_eq!(block_errors, errors);
}

#[test]
fn test_backend_blocks_end_at_branches_and_sync_points() {
    let mut session = scripted("PiijiiPi");
    session.get_sync_offset().expect("Failed to sync");

    let jump = session.decode_block().expect("Failed to decode block");
    assert_eq!((jump.ninsn, jump.iclass), (3, InsnClass::Jump));
    let before_psb = session.decode_block().expect("Failed to decode block");
    assert_eq!(before_psb.ninsn, 2);
    let last = session.decode_block().expect("Failed to decode block");
    assert_eq!(last.ninsn, 1);
    assert_eq!(session.get_last_sync_offset(), Ok(6));
    assert!(session.get_status().contains(StatusFlags::EOS));
    assert_eq!(session.decode_block(), Err(Status::Eos));
}

#[test]
fn test_backend_offset_is_monotone() {
    let mut session = scripted("iPiixiPmii");
    let mut last = session.get_offset();
    session.get_sync_offset().expect("Failed to sync");
    loop {
        let result = session.decode_block();
        let offset = session.get_offset();
        assert!(offset >= last, "{offset} < {last}");
        last = offset;
        if result == Err(Status::Eos) {
            break;
        }
    }
    assert_eq!(last, 10);
}

#[test]
fn test_flow_trace_from_file() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let path = testlib::write_trace(dir.path(), &testlib::two_rounds());

    let mut session = Session::new();
    session
        .add_image(testlib::CODE.to_vec(), testlib::CODE_BASE)
        .expect("Failed to add image");
    session
        .open(&path, &Config::default())
        .expect("Failed to open trace");
    assert_eq!(session.get_size(), 2 * (16 + 4 * 9));

    assert_eq!(session.get_sync_offset(), Ok(0));
    let mut blocks = Vec::new();
    loop {
        match session.decode_block() {
            Ok(block) => blocks.push((block.ip, block.end_ip, block.ninsn)),
            Err(Status::Eos) => break,
            Err(status) => panic!("unexpected {status}"),
        }
    }
    assert_eq!(
        blocks,
        [
            (0x1000, 0x100a, 3),
            (0x100a, 0x100b, 1),
            (0x1000, 0x100a, 3),
            (0x100a, 0x100b, 1),
        ]
    );
}

#[test]
fn test_flow_trace_resumes_from_sync_offset() {
    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let path = testlib::write_trace(dir.path(), &testlib::two_rounds());

    let mut session = Session::new();
    session
        .add_image(testlib::CODE.to_vec(), testlib::CODE_BASE)
        .expect("Failed to add image");
    session
        .open(&path, &Config::new(52, 0))
        .expect("Failed to open trace");

    assert_eq!(session.set_sync_offset(0), Err(Status::Eos));
    session.set_sync_offset(52).expect("Failed to sync");
    let insn = session.decode_instruction().expect("Failed to decode");
    assert_eq!(insn.ip, 0x1000);
    assert!(!insn.flags.contains(InsnFlags::INTERRUPTED));
}

#[test]
fn test_nomap_only_outside_images() {
    let mut packets = vec![Packet::Psb];
    let addrs: Vec<u64> = vec![0x0fff, 0x1000, 0x100a, 0x100b, 0x1003, 0xdead_0000];
    packets.extend(addrs.iter().copied().map(Packet::Ip));

    let mut session = Session::new();
    session
        .add_image(testlib::CODE.to_vec(), testlib::CODE_BASE)
        .expect("Failed to add image");
    session
        .open_buffer(&testlib::encode(&packets), &Config::default())
        .expect("Failed to open trace");
    session.get_sync_offset().expect("Failed to sync");

    for addr in addrs {
        let mapped = (0x1000..0x100b).contains(&addr);
        match session.decode_instruction() {
            Ok(insn) => assert!(mapped && insn.ip == addr),
            Err(status) => {
                assert!(!mapped);
                assert_eq!(status, Status::Nomap);
                assert_eq!(session.get_last_ip(), Some(addr));
            }
        }
    }
}
