//! Records a flow trace of a command by single-stepping it under ptrace.
//!
//! Every executed instruction becomes one IP packet. A PSB and MODE header
//! is emitted every `psb_period` instructions so the trace can be decoded
//! from the middle. Executable mappings of the tracee are collected into a
//! [`Manifest`] as new code shows up.

use nix::{
    sys::{
        ptrace,
        signal::Signal,
        wait::{waitpid, WaitStatus},
    },
    unistd::{execve, fork, ForkResult, Pid},
};
use std::{ffi::CString, io::Write, ops::Range, process};

use tracing::{debug, info};

use crate::{
    diag::Result,
    insn::ExecMode,
    manifest::Manifest,
    packet::{Packet, Writer},
};

pub const DEFAULT_PSB_PERIOD: u64 = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recording {
    /// Number of instructions written to the trace.
    pub instructions: u64,
    /// Exit code of the command, or the number of the signal that killed it.
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorder {
    psb_period: u64,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(DEFAULT_PSB_PERIOD)
    }
}

fn tracee(args: &[CString], env: &[CString]) -> Result<()> {
    ptrace::traceme()?;
    execve(&args[0], args, env)?;
    Ok(())
}

/// The exit or signal code if `status` denotes termination.
#[must_use]
pub fn terminated(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Signaled(_, signal, coredump) => {
            let coredump = if coredump { " (core dumped)" } else { "" };
            info!("killed by {signal:?}{coredump}");
            Some(signal as i32)
        }
        WaitStatus::Exited(_, code) => {
            info!("exited with {code}");
            Some(code)
        }
        _ => None,
    }
}

impl Recorder {
    /// A `psb_period` of 0 writes a single header at the start.
    #[must_use]
    pub fn new(psb_period: u64) -> Self {
        Self { psb_period }
    }

    fn needs_sync(&self, instructions: u64) -> bool {
        instructions == 0 || (self.psb_period != 0 && instructions % self.psb_period == 0)
    }

    /// Runs `args` with `env` to completion, tracing it into `writer` and
    /// listing its code mappings in `manifest`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the fork fails, on any ptrace or wait failure and
    /// if writing the trace fails.
    pub fn record<W: Write>(
        &self,
        args: &[CString],
        env: &[CString],
        writer: &mut Writer<W>,
        manifest: &mut Manifest,
    ) -> Result<Recording> {
        match unsafe { fork() }? {
            ForkResult::Parent { child } => self.trace(child, writer, manifest),
            ForkResult::Child => {
                if let Err(err) = tracee(args, env) {
                    eprintln!("cannot run {:?}: {err:?}", args.first());
                }
                process::exit(127)
            }
        }
    }

    /// Steps the stopped tracee until the next instruction boundary. Returns
    /// the exit code if it terminated instead.
    fn step(pid: Pid, mut signal: Option<Signal>) -> Result<Option<i32>> {
        loop {
            ptrace::step(pid, signal)?;
            let status = waitpid(pid, None)?;
            if let Some(code) = terminated(status) {
                return Ok(Some(code));
            }
            signal = match status {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => return Ok(None),
                // Delivered on the next step.
                WaitStatus::Stopped(_, signal) => {
                    debug!("forward {signal:?}");
                    Some(signal)
                }
                _ => None,
            };
        }
    }

    fn trace<W: Write>(
        &self,
        pid: Pid,
        writer: &mut Writer<W>,
        manifest: &mut Manifest,
    ) -> Result<Recording> {
        let status = waitpid(pid, None)?;
        if let Some(exit_code) = terminated(status) {
            return Ok(Recording {
                instructions: 0,
                exit_code,
            });
        }

        let mut code: Vec<Range<u64>> = manifest.scan(pid)?;
        let mut instructions = 0;
        loop {
            let ip = ptrace::getregs(pid)?.rip;
            if !code.iter().any(|range| range.contains(&ip)) {
                code = manifest.scan(pid)?;
            }

            if self.needs_sync(instructions) {
                writer.sync(ExecMode::Bit64, None)?;
            }
            writer.write(&Packet::Ip(ip))?;
            instructions += 1;

            if let Some(exit_code) = Self::step(pid, None)? {
                writer.flush()?;
                debug!("{instructions} instructions, {} bytes", writer.offset());
                return Ok(Recording {
                    instructions,
                    exit_code,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_signaled() {
        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(terminated(status), Some(Signal::SIGKILL as i32));
    }

    #[test]
    fn test_terminated_exited() {
        assert_eq!(terminated(WaitStatus::Exited(Pid::from_raw(1), 3)), Some(3));
    }

    #[test]
    fn test_terminated_other() {
        let status = WaitStatus::Stopped(Pid::from_raw(1), Signal::SIGSTOP);
        assert!(terminated(status).is_none());
    }

    #[test]
    fn test_sync_period() {
        let recorder = Recorder::new(4);
        assert!(recorder.needs_sync(0));
        assert!(!recorder.needs_sync(3));
        assert!(recorder.needs_sync(8));

        let once = Recorder::new(0);
        assert!(once.needs_sync(0));
        assert!(!once.needs_sync(4096));
    }
}
