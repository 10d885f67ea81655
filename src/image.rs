//! The address space decoders read instruction bytes from.
//!
//! An [`ImageStore`] is a list of sections, each a run of bytes mapped at a
//! base address. Sections may overlap; a lookup always resolves to the most
//! recently added section containing the address.

use std::{fs, path::Path, sync::Arc};

use tracing::debug;

use crate::{
    elf::Elf,
    status::{PtResult, Status},
};

/// Bytes mapped at a base address.
#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    base: u64,
    bytes: Arc<[u8]>,
}

impl Section {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// First address past the section.
    #[must_use]
    pub fn end(&self) -> u64 {
        // Checked on insertion.
        self.base + self.bytes.len() as u64
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        (self.base..self.end()).contains(&addr)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Section map consulted while decoding. Cloning is cheap: section bytes are
/// shared.
#[derive(Debug, Clone, Default)]
pub struct ImageStore {
    sections: Vec<Section>,
}

impl ImageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadImage` if `bytes` is empty or the section would
    /// wrap around the address space.
    pub fn add_buffer(
        &mut self,
        name: &str,
        bytes: impl Into<Arc<[u8]>>,
        base: u64,
    ) -> PtResult<()> {
        let bytes = bytes.into();
        let len = u64::try_from(bytes.len()).map_err(|_| Status::BadImage)?;
        if len == 0 || base.checked_add(len).is_none() {
            return Err(Status::BadImage);
        }

        debug!("add image section {name} at {base:#x} ({len} bytes)");
        self.sections.push(Section {
            name: name.to_string(),
            base,
            bytes,
        });
        Ok(())
    }

    /// Maps `size` bytes of the file at `path`, starting at file `offset`, at
    /// `base`. A `size` of `None`, or one running past the end of the file,
    /// maps up to the end of the file.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadFile` if the file cannot be read and
    /// `Status::BadImage` if `offset` lies outside the file.
    pub fn add_file(
        &mut self,
        path: &Path,
        offset: u64,
        size: Option<u64>,
        base: u64,
    ) -> PtResult<()> {
        let data = fs::read(path).map_err(|_| Status::BadFile)?;
        let start = usize::try_from(offset).map_err(|_| Status::BadImage)?;
        if start >= data.len() {
            return Err(Status::BadImage);
        }
        let end = size
            .and_then(|size| usize::try_from(size).ok())
            .map_or(data.len(), |size| start.saturating_add(size).min(data.len()));

        self.add_buffer(&path.to_string_lossy(), &data[start..end], base)
    }

    /// Maps every executable segment of the ELF file at `path`, shifted by
    /// `bias`. Returns the number of sections added.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadFile` if the file cannot be read and
    /// `Status::BadImage` if it is not an ELF file or maps no code.
    pub fn add_elf(&mut self, path: &Path, bias: u64) -> PtResult<usize> {
        let data = fs::read(path).map_err(|_| Status::BadFile)?;
        let elf = Elf::parse(data).map_err(|_| Status::BadImage)?;

        let name = path.to_string_lossy();
        let mut added = 0;
        for segment in elf.segments() {
            let Some(bytes) = elf.segment_data(segment) else {
                continue;
            };
            if bytes.is_empty() {
                continue;
            }
            let base = segment
                .vaddr
                .checked_add(bias)
                .ok_or(Status::BadImage)?;
            self.add_buffer(&name, bytes, base)?;
            added += 1;
        }

        if added == 0 {
            return Err(Status::BadImage);
        }
        Ok(added)
    }

    /// Unmaps every section based at `base`. Returns how many were removed.
    pub fn remove(&mut self, base: u64) -> usize {
        let before = self.sections.len();
        self.sections.retain(|section| section.base != base);
        before - self.sections.len()
    }

    fn resolve(&self, addr: u64) -> Option<usize> {
        self.sections.iter().rposition(|section| section.contains(addr))
    }

    /// The section `addr` resolves to.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&Section> {
        self.resolve(addr).map(|index| &self.sections[index])
    }

    /// Copies the bytes mapped from `addr` on into `buf`, across section
    /// boundaries, stopping at the first unmapped address. Every byte comes
    /// from the section it resolves to. Returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Returns `Status::Nomap` if no section contains `addr`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> PtResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            let Some(at) = addr.checked_add(done as u64) else {
                break;
            };
            let Some(index) = self.resolve(at) else {
                break;
            };
            let section = &self.sections[index];
            // A later section starting inside this run takes over from there.
            let end = self.sections[index + 1..]
                .iter()
                .map(Section::base)
                .filter(|&base| base > at)
                .fold(section.end(), u64::min);

            let start = usize::try_from(at - section.base).map_err(|_| Status::Internal)?;
            let len = usize::try_from(end - at)
                .unwrap_or(usize::MAX)
                .min(buf.len() - done);
            buf[done..done + len].copy_from_slice(&section.bytes[start..start + len]);
            done += len;
        }

        if done == 0 {
            return Err(Status::Nomap);
        }
        Ok(done)
    }

    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
