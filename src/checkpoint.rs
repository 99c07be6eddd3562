use crate::common::*;

const INDEX_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: u64,
    pub file_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointIndex {
    save_counter: u64,
    last_preserved: DateTime<Utc>,
    /// The rolling window, oldest first.
    checkpoints: Vec<CheckpointEntry>,
    /// Long-term snapshots that left the rolling window.
    preserved: Vec<CheckpointEntry>,
}

#[derive(Debug, Clone)]
pub struct CheckpointManagerInit {
    pub dir: PathBuf,
    pub max_to_keep: usize,
    pub keep_every_n_hours: Option<f64>,
}

impl CheckpointManagerInit {
    /// Opens the checkpoint directory, creating it if needed.
    pub fn open(self) -> Result<CheckpointManager> {
        self.open_at(Utc::now())
    }

    fn open_at(self, now: DateTime<Utc>) -> Result<CheckpointManager> {
        let Self {
            dir,
            max_to_keep,
            keep_every_n_hours,
        } = self;
        ensure!(max_to_keep > 0, "max_to_keep must be positive");
        if let Some(hours) = keep_every_n_hours {
            ensure!(hours > 0.0, "keep_every_n_hours must be positive");
        }

        fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create directory {}", dir.display()))?;

        let index_file = dir.join(INDEX_FILE);
        let index = if index_file.exists() {
            let text = fs::read_to_string(&index_file)?;
            serde_json::from_str(&text)
                .with_context(|| format!("unable to parse {}", index_file.display()))?
        } else {
            CheckpointIndex {
                save_counter: 0,
                last_preserved: now,
                checkpoints: vec![],
                preserved: vec![],
            }
        };

        Ok(CheckpointManager {
            dir,
            max_to_keep,
            keep_every_n_hours,
            index,
        })
    }
}

/// Versioned tensor snapshots with a bounded rolling window plus periodic
/// long-term snapshots.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
    keep_every_n_hours: Option<f64>,
    index: CheckpointIndex,
}

impl CheckpointManager {
    pub fn latest(&self) -> Option<&CheckpointEntry> {
        self.index.checkpoints.last()
    }

    /// All checkpoints on disk, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &CheckpointEntry> {
        let index = &self.index;
        index
            .preserved
            .iter()
            .chain(&index.checkpoints)
            .sorted_by_key(|entry| entry.id)
    }

    pub fn path_of(&self, entry: &CheckpointEntry) -> PathBuf {
        self.dir.join(&entry.file_name)
    }

    pub fn save(&mut self, tensors: &[(String, Tensor)]) -> Result<CheckpointEntry> {
        self.save_at(tensors, Utc::now())
    }

    fn save_at(
        &mut self,
        tensors: &[(String, Tensor)],
        timestamp: DateTime<Utc>,
    ) -> Result<CheckpointEntry> {
        let id = self.index.save_counter + 1;
        let entry = CheckpointEntry {
            id,
            file_name: format!("ckpt-{}.ot", id),
            timestamp,
        };
        let path = self.path_of(&entry);

        write_atomic(&path, |tmp| {
            Tensor::save_multi(tensors, tmp)?;
            Ok(())
        })
        .with_context(|| format!("unable to write checkpoint {}", path.display()))?;

        self.index.save_counter = id;
        self.index.checkpoints.push(entry.clone());
        let expired = self.sweep();
        self.write_index()?;

        // files are removed only after the index stops referring to them
        for entry in expired {
            let path = self.path_of(&entry);
            if let Err(err) = fs::remove_file(&path) {
                warn!("unable to remove {}: {}", path.display(), err);
            }
        }

        Ok(entry)
    }

    /// Loads the tensors of checkpoint `id` onto `device`.
    pub fn load(&self, id: u64, device: Device) -> Result<IndexMap<String, Tensor>> {
        let entry = self
            .entries()
            .find(|entry| entry.id == id)
            .ok_or_else(|| format_err!("checkpoint {} does not exist", id))?;
        let path = self.path_of(entry);
        let tensors = Tensor::load_multi_with_device(&path, device)
            .with_context(|| format!("unable to load checkpoint {}", path.display()))?;
        Ok(tensors.into_iter().collect())
    }

    /// Moves checkpoints beyond `max_to_keep` out of the rolling window and
    /// returns the ones to be deleted.
    fn sweep(&mut self) -> Vec<CheckpointEntry> {
        let Self {
            max_to_keep,
            keep_every_n_hours,
            ref mut index,
            ..
        } = *self;
        let mut expired = vec![];

        while index.checkpoints.len() > max_to_keep {
            let oldest = index.checkpoints.remove(0);

            let preserve = keep_every_n_hours
                .map(|hours| {
                    let interval = ChronoDuration::seconds((hours * 3600.0) as i64);
                    oldest.timestamp - interval >= index.last_preserved
                })
                .unwrap_or(false);

            if preserve {
                index.last_preserved = oldest.timestamp;
                index.preserved.push(oldest);
            } else {
                expired.push(oldest);
            }
        }

        expired
    }

    fn write_index(&self) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let text = serde_json::to_string_pretty(&self.index)?;
        write_atomic(&path, |tmp| {
            fs::write(tmp, &text)?;
            Ok(())
        })
    }
}

/// Writes to a sibling temporary file and renames it over `path`.
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tmp = {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    };

    write(&tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
