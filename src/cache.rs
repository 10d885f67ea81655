//! Block-offset cache.
//!
//! A cache maps basic blocks to where they were decoded in the trace: the
//! PSB to synchronize on and the offset reached right after the block. It is
//! generated once per trace, possibly in parallel over chunks of PSBs, and
//! then queried by address without decoding again.

use rayon::{prelude::*, ThreadPoolBuilder};
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    analyzer::Analyzer,
    config::Config,
    decoder::FlowDecoder,
    diag::Result,
    image::ImageStore,
    manifest::Manifest,
    session::Session,
    status::{PtResult, Status},
};

/// Where a block was decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockEntry {
    pub ip: u64,
    pub end_ip: u64,
    pub sync_offset: u64,
    pub offset: u64,
    /// 0 when the trace does not track CR3.
    pub cr3: u64,
}

/// # Errors
///
/// Returns an `Err` if the file cannot be written.
pub fn save(entries: &[BlockEntry], path: &Path) -> Result<()> {
    fs::write(path, serde_json::to_string(entries)?)?;
    Ok(())
}

/// # Errors
///
/// Returns an `Err` if the file cannot be read or is not a cache.
pub fn load(path: &Path) -> Result<Vec<BlockEntry>> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Combines caches generated separately, e.g. one per chunk or per machine.
#[derive(Debug, Default)]
pub struct Merger {
    entries: Vec<BlockEntry>,
}

impl Merger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entries: impl IntoIterator<Item = BlockEntry>) {
        self.entries.extend(entries);
    }

    /// Adds the entries of one cache file. Returns how many were read.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the file cannot be read or is not a cache.
    pub fn add_file(&mut self, path: &Path) -> Result<usize> {
        let entries = load(path)?;
        let count = entries.len();
        debug!("{count} entries from {}", path.display());
        self.add(entries);
        Ok(count)
    }

    /// Adds every `*.cache` file in `dir`, skipping the ones that fail to
    /// load. Returns how many files were merged.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if `dir` cannot be listed.
    pub fn add_directory(&mut self, dir: &Path) -> Result<usize> {
        let mut paths = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "cache"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut merged = 0;
        for path in paths {
            match self.add_file(&path) {
                Ok(_) => merged += 1,
                Err(err) => warn!("skip {}: {err:?}", path.display()),
            }
        }
        Ok(merged)
    }

    /// The merged entries, ordered by offset and without duplicates.
    #[must_use]
    pub fn entries(&self) -> Vec<BlockEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|entry| (entry.offset, entry.sync_offset, entry.ip));
        entries.dedup();
        entries
    }

    /// # Errors
    ///
    /// Returns an `Err` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        save(&self.entries(), path)
    }
}

/// Address lookups over cache entries, per CR3.
#[derive(Debug, Default)]
pub struct Index {
    by_cr3: HashMap<u64, BTreeMap<u64, Vec<BlockEntry>>>,
}

impl Index {
    pub fn insert(&mut self, entry: BlockEntry) {
        self.by_cr3
            .entry(entry.cr3)
            .or_default()
            .entry(entry.ip)
            .or_default()
            .push(entry);
    }

    /// Blocks of `cr3` starting in `start..=end`, ordered by address.
    #[must_use]
    pub fn block_range(&self, cr3: u64, start: u64, end: u64) -> Vec<&BlockEntry> {
        if start > end {
            return Vec::new();
        }
        self.by_cr3.get(&cr3).map_or_else(Vec::new, |blocks| {
            blocks.range(start..=end).flat_map(|(_, entries)| entries).collect()
        })
    }

    /// Blocks of `cr3` whose instructions cover `addr`.
    #[must_use]
    pub fn containing(&self, cr3: u64, addr: u64) -> Vec<&BlockEntry> {
        self.by_cr3.get(&cr3).map_or_else(Vec::new, |blocks| {
            blocks
                .range(..=addr)
                .flat_map(|(_, entries)| entries)
                .filter(|entry| addr < entry.end_ip)
                .collect()
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_cr3
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<BlockEntry> for Index {
    fn from_iter<I: IntoIterator<Item = BlockEntry>>(iter: I) -> Self {
        let mut index = Self::default();
        for entry in iter {
            index.insert(entry);
        }
        index
    }
}

fn decode_chunk(
    trace: Arc<[u8]>,
    images: &ImageStore,
    manifest: Option<&Manifest>,
    config: &Config,
) -> PtResult<Vec<BlockEntry>> {
    let mut session = Session::<FlowDecoder>::with_images(images.clone());
    session.open_shared(trace, config)?;
    let mut analyzer = Analyzer::new(session);
    if let Some(manifest) = manifest {
        analyzer = analyzer.with_loader(manifest.clone());
    }
    Ok(analyzer.record_blocks())
}

/// Decodes the whole trace into cache entries, ordered by offset.
///
/// The PSBs of the trace are split into chunks of `chunk` PSBs. Each chunk
/// is decoded by its own session, on a pool of `jobs` threads.
///
/// # Errors
///
/// Returns `Status::BadConfig` if the trace cannot be split and
/// `Status::Internal` if the thread pool cannot be built.
pub fn generate(
    trace: &Arc<[u8]>,
    images: &ImageStore,
    manifest: Option<&Manifest>,
    jobs: usize,
    chunk: usize,
) -> PtResult<Vec<BlockEntry>> {
    let mut session = Session::new();
    session.open_shared(Arc::clone(trace), &Config::default())?;
    let offsets = Analyzer::new(session).sync_offsets();

    let chunk = chunk.max(1);
    let configs = offsets
        .iter()
        .step_by(chunk)
        .enumerate()
        .map(|(i, &begin)| Config::new(begin, offsets.get((i + 1) * chunk).copied().unwrap_or(0)))
        .collect::<Vec<_>>();
    info!("{} PSBs in {} chunks on {jobs} threads", offsets.len(), configs.len());

    let pool = ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .map_err(|err| {
            warn!("cannot start {jobs} threads: {err}");
            Status::Internal
        })?;
    let chunks = pool.install(|| {
        configs
            .par_iter()
            .enumerate()
            .map(|(i, config)| {
                let blocks = decode_chunk(Arc::clone(trace), images, manifest, config)?;
                debug!("chunk {i}: {} blocks from {:#x}", blocks.len(), config.begin);
                Ok(blocks)
            })
            .collect::<PtResult<Vec<_>>>()
    })?;

    let mut entries = chunks.into_iter().flatten().collect::<Vec<_>>();
    entries.sort_by_key(|entry| (entry.offset, entry.sync_offset));
    Ok(entries)
}
