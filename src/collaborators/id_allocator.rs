use anyhow::bail;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::marker::PhantomData;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::util::random::{Random, RngRandom};

/// Supplies session ids that this local instance never used before
#[cfg_attr(test, automock)]
pub trait IdAllocator: Send + 'static {
    fn allocate(&mut self) -> anyhow::Result<u32>;
}

pub const ID_RANGE: RangeInclusive<u32> = 1..=1_000_000;

/// Keeps all ids ever handed out in a flat file, one decimal number per line. Lines that are
///  not numbers are ignored.
pub struct FileIdAllocator<R: Random = RngRandom> {
    path: PathBuf,
    used: FxHashSet<u32>,
    _random: PhantomData<R>,
}

impl FileIdAllocator {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<FileIdAllocator> {
        FileIdAllocator::open_with_random(path)
    }
}

impl<R: Random> FileIdAllocator<R> {
    pub fn open_with_random(path: impl AsRef<Path>) -> anyhow::Result<FileIdAllocator<R>> {
        let path = path.as_ref().to_path_buf();

        let used = if path.exists() {
            std::fs::read_to_string(&path)?
                .lines()
                .filter_map(|line| line.trim().parse::<u32>().ok())
                .collect::<FxHashSet<_>>()
        }
        else {
            FxHashSet::default()
        };
        debug!("loaded {} used session ids from {:?}", used.len(), path);

        Ok(FileIdAllocator {
            path,
            used,
            _random: PhantomData,
        })
    }

    fn persist(&self, id: u32) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", id)?;
        Ok(())
    }
}

impl<R: Random + Send + 'static> IdAllocator for FileIdAllocator<R> {
    fn allocate(&mut self) -> anyhow::Result<u32> {
        let capacity = (ID_RANGE.end() - ID_RANGE.start() + 1) as usize;
        if self.used.iter().filter(|id| ID_RANGE.contains(id)).count() >= capacity {
            bail!("all session ids in {:?} were used before - remove {:?} to start over", ID_RANGE, self.path);
        }

        loop {
            let candidate = R::gen_u32_range(ID_RANGE);
            if self.used.insert(candidate) {
                self.persist(candidate)?;
                info!("allocated session id {}", candidate);
                return Ok(candidate);
            }
            debug!("session id {} was used before - retrying", candidate);
        }
    }
}
