//! Executable mappings of a recorded process.
//!
//! The recorder writes a manifest next to the trace; the analyzer uses it to
//! map code lazily, the first time the decoder hits an address no image
//! covers.

use nix::unistd::Pid;
use procfs::process::{MMPermissions, MMapPath, Process};
use serde_derive::{Deserialize, Serialize};
use std::{fs, ops::Range, path::Path, path::PathBuf};

use tracing::debug;

use crate::{
    diag::Result,
    image::ImageStore,
    status::{PtResult, Status},
};

/// A file-backed executable mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
    /// Offset of `start` in the file.
    pub offset: u64,
}

impl Mapping {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Maps this mapping's file bytes into `images`.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadImage` if the mapping is empty or inverted or lies
    /// outside the file, and `Status::BadFile` if the file cannot be read.
    pub fn load(&self, images: &mut ImageStore) -> PtResult<()> {
        let size = self
            .end
            .checked_sub(self.start)
            .filter(|&size| size != 0)
            .ok_or(Status::BadImage)?;
        images.add_file(&self.path, self.offset, Some(size), self.start)
    }
}

/// Lazily supplies instruction bytes to an analyzer.
pub trait ImageLoader {
    /// Called when decoding hit `ip` with no image mapped there. Returns
    /// whether anything was added to `images`.
    fn load(&mut self, ip: u64, images: &mut ImageStore) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub mappings: Vec<Mapping>,
}

impl Manifest {
    /// # Errors
    ///
    /// Returns an `Err` if the file cannot be read or is not a manifest.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// # Errors
    ///
    /// Returns an `Err` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Adds `mapping` unless it is already listed. Returns whether it was
    /// added.
    pub fn insert(&mut self, mapping: Mapping) -> bool {
        if self.mappings.contains(&mapping) {
            return false;
        }
        self.mappings.push(mapping);
        true
    }

    /// The most recently added mapping containing `addr`.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&Mapping> {
        self.mappings.iter().rev().find(|mapping| mapping.contains(addr))
    }

    /// Maps every listed mapping into `images`, skipping the ones whose file
    /// is gone. Returns how many were mapped.
    pub fn load_all(&self, images: &mut ImageStore) -> usize {
        self.mappings
            .iter()
            .filter(|mapping| match mapping.load(images) {
                Ok(()) => true,
                Err(status) => {
                    debug!("skip {}: {status}", mapping.path.display());
                    false
                }
            })
            .count()
    }

    /// Reads the executable mappings of `pid` from procfs. File-backed ones
    /// are added to the manifest; the ranges of all of them, anonymous ones
    /// included, are returned.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the process maps cannot be read.
    pub fn scan(&mut self, pid: Pid) -> Result<Vec<Range<u64>>> {
        let process = Process::new(pid.into())?;
        let maps = process.maps()?;

        let mut ranges = Vec::new();
        for map in maps {
            if !map.perms.contains(MMPermissions::EXECUTE) {
                continue;
            }
            let (start, end) = map.address;
            ranges.push(start..end);

            if let MMapPath::Path(path) = &map.pathname {
                let mapping = Mapping {
                    path: path.clone(),
                    start,
                    end,
                    offset: map.offset,
                };
                if self.insert(mapping) {
                    debug!("mapping {start:#x}..{end:#x} {}", path.display());
                }
            }
        }
        Ok(ranges)
    }
}

impl ImageLoader for Manifest {
    fn load(&mut self, ip: u64, images: &mut ImageStore) -> bool {
        let Some(mapping) = self.find(ip) else {
            return false;
        };
        match mapping.load(images) {
            Ok(()) => {
                debug!("loaded {} for {ip:#x}", mapping.path.display());
                true
            }
            Err(status) => {
                debug!("cannot load {} for {ip:#x}: {status}", mapping.path.display());
                false
            }
        }
    }
}
