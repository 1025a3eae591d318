#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::segment::FileSegment;
use crate::primitives::io::FileOpener;
use crate::types::{FileId, Result, StoreError};

const REGISTRY_FILE: &str = "files.json";

#[derive(Default, Serialize, Deserialize)]
struct RegistryImage {
    next_id: u32,
    files: Vec<RegistryEntry>,
}

#[derive(Serialize, Deserialize)]
struct RegistryEntry {
    id: u32,
    name: String,
}

#[derive(Default)]
struct RegistryState {
    next_id: u32,
    by_name: FxHashMap<String, FileId>,
    segments: FxHashMap<FileId, Arc<FileSegment>>,
}

/// Persistent name to [`FileId`] map for the data files of one storage.
///
/// Ids are never reused, so a double-write record naming a deleted file can be told
/// apart from one naming a newer file.
pub struct FileRegistry {
    dir: PathBuf,
    page_size: usize,
    opener: Arc<dyn FileOpener>,
    state: RwLock<RegistryState>,
}

impl FileRegistry {
    /// Loads `files.json` from `dir` (if present) and opens every listed file.
    pub fn open(dir: &Path, page_size: usize, opener: Arc<dyn FileOpener>) -> Result<Self> {
        let image = match fs::read(dir.join(REGISTRY_FILE)) {
            Ok(bytes) => serde_json::from_slice::<RegistryImage>(&bytes)
                .map_err(|_| StoreError::Corruption("file registry unreadable"))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => RegistryImage {
                next_id: 1,
                files: Vec::new(),
            },
            Err(err) => return Err(err.into()),
        };
        let mut state = RegistryState {
            next_id: image.next_id.max(1),
            ..RegistryState::default()
        };
        for entry in image.files {
            let id = FileId(entry.id);
            let segment =
                FileSegment::open(id, &entry.name, dir.join(&entry.name), page_size, &*opener)?;
            state.next_id = state.next_id.max(entry.id + 1);
            state.by_name.insert(entry.name, id);
            state.segments.insert(id, Arc::new(segment));
        }
        info!(dir = %dir.display(), files = state.segments.len(), "registry.open");
        Ok(Self {
            dir: dir.to_path_buf(),
            page_size,
            opener,
            state: RwLock::new(state),
        })
    }

    /// Creates a new empty file and records it.
    pub fn add_file(&self, name: &str) -> Result<Arc<FileSegment>> {
        validate_name(name)?;
        let mut state = self.state.write();
        if state.by_name.contains_key(name) {
            return Err(StoreError::Invalid("file already registered"));
        }
        let path = self.dir.join(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let id = FileId(state.next_id);
        let segment = Arc::new(FileSegment::open(
            id,
            name,
            path,
            self.page_size,
            &*self.opener,
        )?);
        state.next_id += 1;
        state.by_name.insert(name.to_owned(), id);
        state.segments.insert(id, Arc::clone(&segment));
        self.persist(&state)?;
        debug!(file = id.0, name, "registry.add_file");
        Ok(segment)
    }

    /// Id of the file called `name`.
    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.state.read().by_name.get(name).copied()
    }

    /// Segment registered under `id`.
    pub fn segment(&self, id: FileId) -> Result<Arc<FileSegment>> {
        self.try_segment(id)
            .ok_or(StoreError::Invalid("unknown file id"))
    }

    /// Segment registered under `id`, if it still exists.
    pub fn try_segment(&self, id: FileId) -> Option<Arc<FileSegment>> {
        self.state.read().segments.get(&id).cloned()
    }

    /// Unregisters `id` and removes its file from disk.
    pub fn delete_file(&self, id: FileId) -> Result<()> {
        let mut state = self.state.write();
        let segment = state
            .segments
            .remove(&id)
            .ok_or(StoreError::Invalid("unknown file id"))?;
        state.by_name.remove(segment.name());
        self.persist(&state)?;
        segment.delete()?;
        debug!(file = id.0, name = segment.name(), "registry.delete_file");
        Ok(())
    }

    /// Every registered segment, ordered by id.
    pub fn segments(&self) -> Vec<Arc<FileSegment>> {
        let mut all: Vec<_> = self.state.read().segments.values().cloned().collect();
        all.sort_unstable_by_key(|seg| seg.id());
        all
    }

    /// Fsyncs every registered file.
    pub fn sync_all(&self) -> Result<()> {
        for segment in self.segments() {
            segment.sync()?;
        }
        Ok(())
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        let mut files: Vec<RegistryEntry> = state
            .by_name
            .iter()
            .map(|(name, id)| RegistryEntry {
                id: id.0,
                name: name.clone(),
            })
            .collect();
        files.sort_unstable_by_key(|entry| entry.id);
        let image = RegistryImage {
            next_id: state.next_id,
            files,
        };
        let bytes = serde_json::to_vec_pretty(&image).map_err(io::Error::other)?;
        let tmp = self.dir.join(format!("{REGISTRY_FILE}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(REGISTRY_FILE))?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == REGISTRY_FILE
        || name.contains(['/', '\\'])
        || name.starts_with('.')
    {
        return Err(StoreError::Invalid("bad file name"));
    }
    Ok(())
}
