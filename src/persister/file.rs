use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entry::{Entry, IndexTimestamp};
use crate::error::{Error, Result};

use super::{resolve_range, Persister, PersisterIter};

const HEAD_PREFIX: &str = "#HEAD\t";

/// Durability knob for the file persister: whether every `publish`/
/// `update_head` call fsyncs the append handle before returning.
#[derive(Debug, Clone)]
pub struct FilePersisterConfig {
    pub fsync_every_publish: bool,
}

impl Default for FilePersisterConfig {
    fn default() -> Self {
        Self {
            fsync_every_publish: true,
        }
    }
}

struct State {
    file: File,
    size: u64,
    last_us: i64,
    head_us: i64,
}

/// Append-only text log: `<idxts-json>\t<payload-json>\n` per entry, with
/// optional `#HEAD\t<20-digit zero-padded us>\n` lines recording watermark
/// advances. On open, the file is scanned end-to-end to rebuild
/// `(size, last_us, head_us)` and validate contiguity.
pub struct FilePersister<E> {
    path: PathBuf,
    state: Mutex<State>,
    config: FilePersisterConfig,
    _marker: PhantomData<fn() -> E>,
}

impl<E> FilePersister<E>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, FilePersisterConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: FilePersisterConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (size, last_us, head_us) = scan::<E>(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(State {
                file,
                size,
                last_us,
                head_us,
            }),
            config,
            _marker: PhantomData,
        })
    }
}

impl<E> Persister<E> for FilePersister<E>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn publish(&self, payload: E, us: i64) -> Result<IndexTimestamp> {
        let mut state = self.state.lock().unwrap();
        if state.size > 0 && us <= state.last_us {
            return Err(Error::InconsistentTimestamp);
        }
        let index = state.size;
        let idxts = IndexTimestamp::new(index, us);
        let idxts_json =
            serde_json::to_string(&idxts).map_err(|e| Error::MalformedEntry(e.to_string()))?;
        let payload_json =
            serde_json::to_string(&payload).map_err(|e| Error::MalformedEntry(e.to_string()))?;
        let line = format!("{idxts_json}\t{payload_json}\n");
        state.file.write_all(line.as_bytes())?;
        if self.config.fsync_every_publish {
            state.file.sync_all()?;
        }
        state.size += 1;
        state.last_us = us;
        if us > state.head_us {
            state.head_us = us;
        }
        Ok(idxts)
    }

    fn update_head(&self, us: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if us <= state.last_us || us <= state.head_us {
            return Err(Error::InconsistentTimestamp);
        }
        let line = format!("{HEAD_PREFIX}{}\n", format_head_us(us));
        state.file.write_all(line.as_bytes())?;
        if self.config.fsync_every_publish {
            state.file.sync_all()?;
        }
        state.head_us = us;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.state.lock().unwrap().size
    }

    fn head(&self) -> i64 {
        self.state.lock().unwrap().head_us
    }

    fn last_idxts(&self) -> IndexTimestamp {
        let state = self.state.lock().unwrap();
        if state.size == 0 {
            IndexTimestamp::UNINITIALIZED
        } else {
            IndexTimestamp::new(state.size - 1, state.last_us)
        }
    }

    fn iterate(&self, begin: u64, end: u64) -> Result<PersisterIter<E>> {
        let size = self.size();
        let (begin, end) = resolve_range(begin, end, size)?;
        let file = File::open(&self.path)?;
        Ok(Box::new(FileIter::<E> {
            reader: BufReader::new(file),
            to_skip: begin,
            to_yield: end - begin,
            _marker: PhantomData,
        }))
    }
}

struct FileIter<E> {
    reader: BufReader<File>,
    to_skip: u64,
    to_yield: u64,
    _marker: PhantomData<fn() -> E>,
}

impl<E: DeserializeOwned> Iterator for FileIter<E> {
    type Item = Result<Entry<E>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.to_yield == 0 {
                return None;
            }
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
            let line = line.trim_end_matches('\n');
            if line.is_empty() || line.starts_with(HEAD_PREFIX) {
                continue;
            }
            if self.to_skip > 0 {
                self.to_skip -= 1;
                continue;
            }
            self.to_yield -= 1;
            return Some(parse_entry_line(line));
        }
    }
}

fn parse_entry_line<E: DeserializeOwned>(line: &str) -> Result<Entry<E>> {
    let (idxts_json, payload_json) = line
        .split_once('\t')
        .ok_or_else(|| Error::MalformedEntry(format!("no tab separator: {line:?}")))?;
    let idxts: IndexTimestamp = serde_json::from_str(idxts_json)
        .map_err(|e| Error::MalformedEntry(format!("bad idxts json: {e}")))?;
    let payload: E = serde_json::from_str(payload_json)
        .map_err(|e| Error::MalformedEntry(format!("bad payload json: {e}")))?;
    Ok(Entry::new(idxts, payload))
}

fn format_head_us(us: i64) -> String {
    format!("{us:020}")
}

/// Scans the file end-to-end, validating contiguity and strict
/// timestamp order, and rebuilds `(size, last_us, head_us)`.
fn scan<E: DeserializeOwned>(path: &Path) -> Result<(u64, i64, i64)> {
    if !path.exists() {
        return Ok((0, i64::MIN, 0));
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.is_empty() {
        return Ok((0, i64::MIN, 0));
    }
    if !contents.ends_with('\n') {
        return Err(Error::MalformedEntry("unterminated tail line".into()));
    }

    let mut size: u64 = 0;
    let mut last_us: i64 = i64::MIN;
    let mut head_us: i64 = 0;
    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(HEAD_PREFIX) {
            let us: i64 = rest
                .parse()
                .map_err(|_| Error::MalformedEntry(format!("bad head value: {rest:?}")))?;
            if us < head_us {
                return Err(Error::InconsistentTimestamp);
            }
            head_us = us;
            continue;
        }
        let entry: Entry<E> = parse_entry_line(line)?;
        if entry.idxts.index != size {
            return Err(Error::InconsistentIndex);
        }
        if size > 0 && entry.idxts.us <= last_us {
            return Err(Error::InconsistentTimestamp);
        }
        last_us = entry.idxts.us;
        size += 1;
        if entry.idxts.us > head_us {
            head_us = entry.idxts.us;
        }
    }
    Ok((size, last_us, head_us))
}
