use thiserror::Error;

/// Outcome of a decoder operation.
///
/// The codes and their numbering follow libipt's `pt_error_code`. Callers
/// branch on the exact variant, so no operation ever folds one code into
/// another. `Ok` is the only success value; it shows up where a status is
/// reported as data (see [`crate::session::Session::get_decode_status`]).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    #[error("OK")]
    Ok = 0,
    #[error("internal error")]
    Internal,
    #[error("invalid argument")]
    Invalid,
    #[error("decoder out of sync")]
    Nosync,
    #[error("unknown opcode")]
    BadOpc,
    #[error("unknown packet")]
    BadPacket,
    #[error("unexpected packet context")]
    BadContext,
    #[error("reached end of trace stream")]
    Eos,
    #[error("trace stream does not match query")]
    BadQuery,
    #[error("not enough memory")]
    Nomem,
    #[error("bad configuration")]
    BadConfig,
    #[error("no ip")]
    Noip,
    #[error("ip has been suppressed")]
    IpSuppressed,
    #[error("no memory mapped at this address")]
    Nomap,
    #[error("unknown instruction")]
    BadInsn,
    #[error("no timing information")]
    NoTime,
    #[error("no core:bus ratio")]
    NoCbr,
    #[error("bad image")]
    BadImage,
    #[error("locking error")]
    BadLock,
    #[error("not supported")]
    NotSupported,
    #[error("compressed return without call")]
    RetstackEmpty,
    #[error("bad compressed return")]
    BadRetcomp,
    #[error("bad status update")]
    BadStatusUpdate,
    #[error("expected tracing enabled event")]
    NoEnable,
    #[error("event ignored")]
    EventIgnored,
    #[error("overflow packet")]
    Overflow,
    #[error("bad file")]
    BadFile,
    #[error("unknown cpu")]
    BadCpu,
}

/// Result of a decoder-level operation.
pub type PtResult<T> = Result<T, Status>;

impl Status {
    /// Every status, indexed by its numeric code.
    pub const ALL: [Status; 28] = [
        Status::Ok,
        Status::Internal,
        Status::Invalid,
        Status::Nosync,
        Status::BadOpc,
        Status::BadPacket,
        Status::BadContext,
        Status::Eos,
        Status::BadQuery,
        Status::Nomem,
        Status::BadConfig,
        Status::Noip,
        Status::IpSuppressed,
        Status::Nomap,
        Status::BadInsn,
        Status::NoTime,
        Status::NoCbr,
        Status::BadImage,
        Status::BadLock,
        Status::NotSupported,
        Status::RetstackEmpty,
        Status::BadRetcomp,
        Status::BadStatusUpdate,
        Status::NoEnable,
        Status::EventIgnored,
        Status::Overflow,
        Status::BadFile,
        Status::BadCpu,
    ];

    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }

    /// The libipt identifier of this status, e.g. `pte_nosync`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "pte_ok",
            Status::Internal => "pte_internal",
            Status::Invalid => "pte_invalid",
            Status::Nosync => "pte_nosync",
            Status::BadOpc => "pte_bad_opc",
            Status::BadPacket => "pte_bad_packet",
            Status::BadContext => "pte_bad_context",
            Status::Eos => "pte_eos",
            Status::BadQuery => "pte_bad_query",
            Status::Nomem => "pte_nomem",
            Status::BadConfig => "pte_bad_config",
            Status::Noip => "pte_noip",
            Status::IpSuppressed => "pte_ip_suppressed",
            Status::Nomap => "pte_nomap",
            Status::BadInsn => "pte_bad_insn",
            Status::NoTime => "pte_no_time",
            Status::NoCbr => "pte_no_cbr",
            Status::BadImage => "pte_bad_image",
            Status::BadLock => "pte_bad_lock",
            Status::NotSupported => "pte_not_supported",
            Status::RetstackEmpty => "pte_retstack_empty",
            Status::BadRetcomp => "pte_bad_retcomp",
            Status::BadStatusUpdate => "pte_bad_status_update",
            Status::NoEnable => "pte_no_enable",
            Status::EventIgnored => "pte_event_ignored",
            Status::Overflow => "pte_overflow",
            Status::BadFile => "pte_bad_file",
            Status::BadCpu => "pte_bad_cpu",
        }
    }

    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Steady-state outcomes a caller is expected to loop on.
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        matches!(self, Status::Nosync | Status::Eos | Status::Nomap)
    }

    /// Misuse of the session or its environment; the session should be
    /// abandoned rather than retried.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Status::Internal | Status::BadConfig | Status::BadFile)
    }
}

impl<T> From<&PtResult<T>> for Status {
    fn from(result: &PtResult<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(status) => *status,
        }
    }
}

flag_set! {
    /// Stream-level decoder status, as of the last operation.
    ///
    /// The first three flags carry libipt's `pts_*` values.
    pub struct StatusFlags {
        /// An event (mode change, paging, enable/disable, overflow) is
        /// waiting before the next instruction.
        const EVENT_PENDING = 1 << 0;
        /// The next IP has been suppressed.
        const IP_SUPPRESSED = 1 << 1;
        /// No more instructions follow.
        const EOS = 1 << 2;
        /// Tracing is currently disabled.
        const TRACING_DISABLED = 1 << 3;
    }
}
