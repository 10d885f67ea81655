//! A trace session: one open trace, one decoder cursor and the images the
//! decoder reads instruction bytes from.
//!
//! A [`Session`] moves through four states. It starts closed; `open` makes it
//! opened but unsynced; a successful sync starts decoding; running off the
//! end of the trace exhausts it, after which every decode call keeps
//! returning [`Status::Eos`]. Errors are returned, never retried.

use std::{fs, path::Path, sync::Arc};

use tracing::debug;

use crate::{
    config::Config,
    decoder::{FlowDecoder, PacketDecoder},
    image::ImageStore,
    insn::{Block, Insn, InsnClass, InsnFlags},
    status::{PtResult, Status, StatusFlags},
};

struct Stream<D> {
    decoder: D,
    begin: u64,
    size: u64,
}

/// Decoding session over a packet decoder `D`.
pub struct Session<D: PacketDecoder = FlowDecoder> {
    stream: Option<Stream<D>>,
    images: ImageStore,
    decode_status: Status,
    /// Error hit while extending a block, reported by the next decode call.
    pending: Option<Status>,
}

impl Session<FlowDecoder> {
    /// Creates a closed session decoding the flow format.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend()
    }
}

impl<D: PacketDecoder> Default for Session<D> {
    fn default() -> Self {
        Self::with_backend()
    }
}

fn ends_block(insn: &Insn, flags: StatusFlags) -> bool {
    !flags.is_empty()
        || insn.iclass != InsnClass::Other
        || insn
            .flags
            .intersects(InsnFlags::INTERRUPTED | InsnFlags::DISABLED)
}

impl<D: PacketDecoder> Session<D> {
    /// Creates a closed session decoding with `D`.
    #[must_use]
    pub fn with_backend() -> Self {
        Self::with_images(ImageStore::new())
    }

    /// Creates a closed session that starts with `images` registered.
    #[must_use]
    pub fn with_images(images: ImageStore) -> Self {
        Self {
            stream: None,
            images,
            decode_status: Status::Ok,
            pending: None,
        }
    }

    /// Opens the trace file at `path`. Any previously open trace is closed
    /// first; registered images are kept.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadFile` if the file cannot be read and
    /// `Status::BadConfig` if `config` does not fit the trace.
    pub fn open(&mut self, path: &Path, config: &Config) -> PtResult<()> {
        self.close();
        let data = fs::read(path).map_err(|err| {
            debug!("cannot read {}: {err}", path.display());
            Status::BadFile
        })?;
        self.open_shared(data.into(), config)
    }

    /// Opens a trace held in memory.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadConfig` if `config` does not fit the trace.
    pub fn open_buffer(&mut self, trace: &[u8], config: &Config) -> PtResult<()> {
        self.open_shared(Arc::from(trace), config)
    }

    /// Opens a trace shared with other sessions.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadConfig` if `config` does not fit the trace.
    pub fn open_shared(&mut self, trace: Arc<[u8]>, config: &Config) -> PtResult<()> {
        self.close();
        let range = config.range(trace.len())?;
        let size = (range.end - range.start) as u64;
        debug!("open trace {:#x}..{:#x}", range.start, range.end);

        let decoder = D::new(trace, range.clone())?;
        self.stream = Some(Stream {
            decoder,
            begin: range.start as u64,
            size,
        });
        Ok(())
    }

    /// Releases the open trace, if any.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("close trace");
        }
        self.pending = None;
        self.decode_status = Status::Ok;
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Synchronizes onto the next PSB after the current position and
    /// returns its offset.
    ///
    /// # Errors
    ///
    /// Returns `Status::Invalid` if no trace is open and `Status::Eos` if no
    /// PSB is left.
    pub fn get_sync_offset(&mut self) -> PtResult<u64> {
        let stream = self.stream.as_mut().ok_or(Status::Invalid)?;
        self.pending = None;
        stream.decoder.sync_forward()
    }

    /// Synchronizes onto the PSB at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Status::Invalid` if no trace is open, `Status::Eos` if
    /// `offset` is outside the configured range and `Status::Nosync` if no
    /// PSB starts there.
    pub fn set_sync_offset(&mut self, offset: u64) -> PtResult<()> {
        let stream = self.stream.as_mut().ok_or(Status::Invalid)?;
        self.pending = None;
        stream.decoder.sync_set(offset)
    }

    /// Offset of the PSB the cursor last passed.
    ///
    /// # Errors
    ///
    /// Returns `Status::Invalid` if no trace is open and `Status::Nosync`
    /// before the first synchronization.
    pub fn get_last_sync_offset(&self) -> PtResult<u64> {
        self.stream
            .as_ref()
            .ok_or(Status::Invalid)?
            .decoder
            .sync_offset()
    }

    /// Absolute position of the decoder in the trace, 0 when closed.
    #[must_use]
    pub fn get_offset(&self) -> u64 {
        self.stream
            .as_ref()
            .map_or(0, |stream| stream.decoder.offset())
    }

    /// Start of the configured trace range, 0 when closed.
    #[must_use]
    pub fn get_begin(&self) -> u64 {
        self.stream.as_ref().map_or(0, |stream| stream.begin)
    }

    /// Size of the configured trace range, 0 when closed.
    #[must_use]
    pub fn get_size(&self) -> u64 {
        self.stream.as_ref().map_or(0, |stream| stream.size)
    }

    #[must_use]
    pub fn get_status(&self) -> StatusFlags {
        self.stream
            .as_ref()
            .map_or_else(StatusFlags::empty, |stream| stream.decoder.status())
    }

    /// Maps `bytes` at `base`.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadImage` if `bytes` is empty or does not fit the
    /// address space.
    pub fn add_image(&mut self, bytes: impl Into<Arc<[u8]>>, base: u64) -> PtResult<()> {
        self.images.add_buffer(&format!("buffer@{base:#x}"), bytes, base)
    }

    /// Maps the whole file at `path` at `base`.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadFile` if the file cannot be read and
    /// `Status::BadImage` if it is empty.
    pub fn add_image_file(&mut self, path: &Path, base: u64) -> PtResult<()> {
        self.images.add_file(path, 0, None, base)
    }

    /// Maps `size` bytes of the file at `path`, from file `offset`, at `base`.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadFile` if the file cannot be read and
    /// `Status::BadImage` if `offset` lies outside the file.
    pub fn add_image_file_range(
        &mut self,
        path: &Path,
        offset: u64,
        size: u64,
        base: u64,
    ) -> PtResult<()> {
        self.images.add_file(path, offset, Some(size), base)
    }

    /// Maps the executable segments of an ELF file, shifted by `bias`.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadFile` if the file cannot be read and
    /// `Status::BadImage` if it is not an ELF file with code.
    pub fn add_elf(&mut self, path: &Path, bias: u64) -> PtResult<usize> {
        self.images.add_elf(path, bias)
    }

    #[must_use]
    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut ImageStore {
        &mut self.images
    }

    fn step(&mut self) -> PtResult<(Insn, StatusFlags)> {
        if let Some(status) = self.pending.take() {
            return Err(status);
        }
        let stream = self.stream.as_mut().ok_or(Status::Nosync)?;
        stream.decoder.next_insn(&self.images)
    }

    fn next_block(&mut self) -> PtResult<Block> {
        let (first, mut flags) = self.step()?;
        let mut block = Block::new(&first);
        let mut last = first;

        while !ends_block(&last, flags) {
            match self.step() {
                Ok((insn, next)) => {
                    block.push(&insn);
                    last = insn;
                    flags = next;
                }
                Err(status) => {
                    self.pending = Some(status);
                    break;
                }
            }
        }
        Ok(block)
    }

    /// Decodes the next instruction.
    ///
    /// # Errors
    ///
    /// Returns `Status::Nosync` before a successful sync, `Status::Eos` once
    /// the trace is exhausted, `Status::Nomap` if no image maps the
    /// instruction's address and `Status::BadInsn` if its bytes do not
    /// decode.
    pub fn decode_instruction(&mut self) -> PtResult<Insn> {
        let result = self.step().map(|(insn, _)| insn);
        self.decode_status = Status::from(&result);
        result
    }

    /// Decodes instructions up to the next flow change, event, discontinuity
    /// or end of stream. An error hit after the first instruction is
    /// returned by the next call instead, so no instruction is lost.
    ///
    /// # Errors
    ///
    /// Same as [`Session::decode_instruction`] for the block's first
    /// instruction.
    pub fn decode_block(&mut self) -> PtResult<Block> {
        let result = self.next_block();
        self.decode_status = Status::from(&result);
        result
    }

    /// Status of the most recent decode call.
    #[must_use]
    pub fn get_decode_status(&self) -> Status {
        self.decode_status
    }

    /// Address the most recent decode attempt was at, decoded or not.
    #[must_use]
    pub fn get_last_ip(&self) -> Option<u64> {
        self.stream.as_ref().and_then(|stream| stream.decoder.ip())
    }

    /// CR3 in effect at the cursor.
    ///
    /// # Errors
    ///
    /// Returns `Status::Nosync` if not synchronized and `Status::Nomap` if no
    /// PIP was seen since the last sync.
    pub fn get_current_cr3(&self) -> PtResult<u64> {
        self.stream
            .as_ref()
            .ok_or(Status::Nosync)?
            .decoder
            .cr3()
    }
}
