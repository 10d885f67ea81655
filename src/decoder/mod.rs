use std::{ops::Range, sync::Arc};

use crate::{
    image::ImageStore,
    insn::Insn,
    status::{PtResult, StatusFlags},
};

pub mod flow;

pub use flow::FlowDecoder;

/// An instruction-flow decoder a [`crate::session::Session`] drives.
///
/// Implementations own the trace format: finding synchronization points,
/// following packets and producing one instruction per `next_insn` call.
/// They never own instruction memory; bytes are read from the image store
/// the session passes in.
///
/// All offsets are absolute byte offsets into the trace buffer handed to
/// [`PacketDecoder::new`], even when decoding is restricted to a sub-range.
pub trait PacketDecoder: Sized {
    /// Builds a decoder over `trace[range]`. The decoder starts unsynced.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadConfig` if `range` does not fit `trace`.
    fn new(trace: Arc<[u8]>, range: Range<usize>) -> PtResult<Self>;

    /// Synchronizes onto the next sync point after the current position and
    /// returns its offset.
    ///
    /// # Errors
    ///
    /// Returns `Status::Eos` when no sync point is left.
    fn sync_forward(&mut self) -> PtResult<u64>;

    /// Synchronizes onto the sync point at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Status::Eos` if `offset` is outside the decoded range and
    /// `Status::Nosync` if there is no sync point at `offset`.
    fn sync_set(&mut self, offset: u64) -> PtResult<()>;

    /// Current position in the trace.
    fn offset(&self) -> u64;

    /// Offset of the last sync point passed.
    ///
    /// # Errors
    ///
    /// Returns `Status::Nosync` before the first synchronization.
    fn sync_offset(&self) -> PtResult<u64>;

    /// Stream status as of the last operation.
    fn status(&self) -> StatusFlags;

    /// Decodes the next instruction, returning it with the status flags that
    /// hold right after it.
    ///
    /// # Errors
    ///
    /// Returns `Status::Nosync` when not synchronized, `Status::Eos` at the
    /// end of the stream, `Status::Nomap`/`Status::BadInsn` when the
    /// instruction bytes are missing or invalid, or any other status the
    /// trace format can raise.
    fn next_insn(&mut self, image: &ImageStore) -> PtResult<(Insn, StatusFlags)>;

    /// IP of the most recent instruction `next_insn` attempted, decoded or
    /// not.
    fn ip(&self) -> Option<u64>;

    /// CR3 value in effect at the current position.
    ///
    /// # Errors
    ///
    /// Returns `Status::Nosync` when not synchronized and `Status::Nomap` if
    /// the trace does not track CR3 here.
    fn cr3(&self) -> PtResult<u64>;
}
