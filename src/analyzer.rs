//! Trace enumeration on top of a [`Session`].
//!
//! The analyzer owns the decode loop: it synchronizes on demand, maps code
//! through an [`ImageLoader`] the first time an address misses, skips decode
//! errors it can recover from and reports progress.

use std::{collections::HashSet, ops::RangeInclusive};

use tracing::{debug, info, warn};

use crate::{
    cache::BlockEntry,
    decoder::{FlowDecoder, PacketDecoder},
    insn::{Block, Insn},
    manifest::ImageLoader,
    session::Session,
    status::Status,
};

/// Selects the instructions [`Analyzer::instructions`] yields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsnFilter {
    /// Only yield instructions inside one of these address ranges. Empty
    /// means every address.
    pub ranges: Vec<RangeInclusive<u64>>,
    /// Stop after the first instruction at this address.
    pub stop_address: Option<u64>,
    /// Only yield the instruction decoded at exactly this trace offset.
    pub offset: Option<u64>,
    /// Stop once an instruction at the end address of every range was
    /// yielded.
    pub until_range_ends: bool,
}

impl InsnFilter {
    #[must_use]
    pub fn matches(&self, ip: u64) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(&ip))
    }
}

pub struct Analyzer<D: PacketDecoder = FlowDecoder> {
    session: Session<D>,
    loader: Option<Box<dyn ImageLoader>>,
    error_locations: HashSet<u64>,
    progress_interval: usize,
}

impl<D: PacketDecoder> Analyzer<D> {
    #[must_use]
    pub fn new(session: Session<D>) -> Self {
        Self {
            session,
            loader: None,
            error_locations: HashSet::new(),
            progress_interval: 0,
        }
    }

    /// Maps code through `loader` when decoding hits unmapped addresses.
    #[must_use]
    pub fn with_loader(mut self, loader: impl ImageLoader + 'static) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    /// Logs progress every `interval` items. 0 disables it.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval;
        self
    }

    #[must_use]
    pub fn session(&self) -> &Session<D> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<D> {
        &mut self.session
    }

    #[must_use]
    pub fn into_session(self) -> Session<D> {
        self.session
    }

    /// Every PSB offset from the cursor to the end of the trace. Leaves the
    /// cursor exhausted; use [`Session::set_sync_offset`] to go back.
    pub fn sync_offsets(&mut self) -> Vec<u64> {
        std::iter::from_fn(|| self.session.get_sync_offset().ok()).collect()
    }

    /// Iterates over the instructions selected by `filter`.
    pub fn instructions(&mut self, filter: InsnFilter) -> Instructions<'_, D> {
        let ends = if filter.until_range_ends {
            filter.ranges.iter().map(|range| *range.end()).collect()
        } else {
            HashSet::new()
        };
        Instructions {
            analyzer: self,
            filter,
            ends,
            count: 0,
            done: false,
        }
    }

    /// Iterates over blocks, each with its cache record.
    pub fn blocks(&mut self) -> Blocks<'_, D> {
        Blocks {
            analyzer: self,
            sync_offset: None,
            count: 0,
            done: false,
        }
    }

    /// Iterates over the blocks decoded under the PSB at `sync_offset`.
    /// Synchronizes there first and stops at the next PSB.
    pub fn blocks_under(&mut self, sync_offset: u64) -> Blocks<'_, D> {
        let done = match self.session.set_sync_offset(sync_offset) {
            Ok(()) => false,
            Err(status) => {
                warn!("cannot synchronize at {sync_offset:#x}: {status}");
                true
            }
        };
        Blocks {
            analyzer: self,
            sync_offset: Some(sync_offset),
            count: 0,
            done,
        }
    }

    /// Decodes every remaining block and returns their cache records.
    pub fn record_blocks(&mut self) -> Vec<BlockEntry> {
        self.blocks().map(|(_, entry)| entry).collect()
    }

    /// Handles a failed decode call. Returns whether decoding can go on.
    fn recover(&mut self, status: Status) -> bool {
        match status {
            Status::Eos => false,
            Status::Nosync => match self.session.get_sync_offset() {
                Ok(offset) => {
                    debug!("synchronized at {offset:#x}");
                    true
                }
                Err(_) => false,
            },
            Status::Nomap => {
                self.load_image();
                true
            }
            status if status.is_fatal() => {
                warn!("{:#x}: {status}", self.session.get_offset());
                false
            }
            status => {
                warn!("{:#x}: {status}", self.session.get_offset());
                true
            }
        }
    }

    fn load_image(&mut self) {
        let Some(ip) = self.session.get_last_ip() else {
            return;
        };
        if !self.error_locations.insert(ip) {
            return;
        }

        let loaded = match self.loader.as_mut() {
            Some(loader) => loader.load(ip, self.session.images_mut()),
            None => false,
        };
        if !loaded {
            warn!("{:#x}: no image for {ip:#x}", self.session.get_offset());
        }
    }

    fn report_progress(&self, what: &str, count: usize) {
        if self.progress_interval == 0 || count % self.progress_interval != 0 {
            return;
        }
        let size = self.session.get_size();
        let done = self
            .session
            .get_offset()
            .saturating_sub(self.session.get_begin());
        let percent = done.saturating_mul(100) / size.max(1);
        info!("{what}: {count} decoded, {done:#x}/{size:#x} ({percent}%)");
    }
}

pub struct Instructions<'a, D: PacketDecoder> {
    analyzer: &'a mut Analyzer<D>,
    filter: InsnFilter,
    /// Range ends not reached yet.
    ends: HashSet<u64>,
    count: usize,
    done: bool,
}

impl<D: PacketDecoder> Instructions<'_, D> {
    /// Trace offset right after the last yielded instruction.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.analyzer.session.get_offset()
    }
}

impl<D: PacketDecoder> Iterator for Instructions<'_, D> {
    type Item = Insn;

    fn next(&mut self) -> Option<Insn> {
        while !self.done {
            let insn = match self.analyzer.session.decode_instruction() {
                Ok(insn) => insn,
                Err(status) => {
                    self.done = !self.analyzer.recover(status);
                    continue;
                }
            };

            self.analyzer.report_progress("instructions", self.count);
            self.count += 1;
            if self.filter.stop_address == Some(insn.ip) {
                self.done = true;
            }

            if let Some(target) = self.filter.offset {
                let offset = self.analyzer.session.get_offset();
                if offset == target {
                    self.done = true;
                    return Some(insn);
                }
                if offset > target {
                    self.done = true;
                }
            } else if self.filter.matches(insn.ip) {
                if self.ends.remove(&insn.ip) && self.ends.is_empty() {
                    self.done = true;
                }
                return Some(insn);
            }
        }
        None
    }
}

pub struct Blocks<'a, D: PacketDecoder> {
    analyzer: &'a mut Analyzer<D>,
    sync_offset: Option<u64>,
    count: usize,
    done: bool,
}

impl<D: PacketDecoder> Iterator for Blocks<'_, D> {
    type Item = (Block, BlockEntry);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.analyzer.session.decode_block() {
                Ok(block) => {
                    let session = &self.analyzer.session;
                    let entry = BlockEntry {
                        ip: block.ip,
                        end_ip: block.end_ip,
                        sync_offset: session.get_last_sync_offset().unwrap_or(0),
                        offset: session.get_offset(),
                        cr3: session.get_current_cr3().unwrap_or(0),
                    };
                    self.analyzer.report_progress("blocks", self.count);
                    self.count += 1;
                    match self.sync_offset {
                        Some(target) if entry.sync_offset > target => self.done = true,
                        Some(target) if entry.sync_offset != target => {}
                        _ => return Some((block, entry)),
                    }
                }
                Err(status) => self.done = !self.analyzer.recover(status),
            }
        }
        None
    }
}
