use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ql::model::NetWeights;

const WEIGHTS_FILE: &str = "model.json";
const STATE_FILE: &str = "state.json";

/// Named checkpoint slots.
///
/// `Latest` is overwritten periodically, `Best` only on an improved rolling
/// average. `Backup` holds the previous `Latest` contents one generation deep;
/// it is produced by rotation only and never written directly or auto-loaded.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Slot {
    Latest,
    Best,
    Backup,
}

impl Slot {
    fn dir_name(&self) -> &'static str {
        match self {
            Slot::Latest => "latest",
            Slot::Best => "best",
            Slot::Backup => "backup",
        }
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Training progress co-located with the weights in every slot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epsilon: f32,
    pub total_steps: usize,
    pub episode: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_avg_reward: Option<f32>,
}

/// Durable, crash-safe persistence of net weights plus training progress.
///
/// Writes go to a temporary directory first and are promoted into the slot with
/// an atomic rename, so a slot always holds either the old or the new complete
/// checkpoint, never a partial write.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("cannot create checkpoint directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every slot directory only ever holds a complete checkpoint. A crash
    /// between the two renames of a `Latest` save leaves `latest` absent with
    /// the previous checkpoint intact under `backup`; the next resume then
    /// starts fresh unless `backup` is renamed back to `latest` by hand.
    pub fn save(&self, slot: Slot, weights: &NetWeights, state: &TrainingState) -> Result<()> {
        if slot == Slot::Backup {
            bail!("the backup slot is written by rotation only");
        }

        let tmp = self.root.join(format!("{}.tmp", slot.dir_name()));
        remove_dir_if_present(&tmp)?;
        fs::create_dir_all(&tmp)?;
        write_json(&tmp.join(WEIGHTS_FILE), weights)?;
        write_json(&tmp.join(STATE_FILE), state)?;

        let target = self.root.join(slot.dir_name());
        if target.exists() {
            if slot == Slot::Latest {
                // keep the previous "latest" one generation deep
                let backup = self.root.join(Slot::Backup.dir_name());
                remove_dir_if_present(&backup)?;
                fs::rename(&target, &backup)
                    .with_context(|| format!("cannot rotate {} to backup", target.display()))?;
            } else {
                remove_dir_if_present(&target)?;
            }
        }
        fs::rename(&tmp, &target)
            .with_context(|| format!("cannot promote checkpoint to slot '{}'", slot))?;
        Ok(())
    }

    /// `Ok(None)` when the slot holds no checkpoint; an `Err` means the slot
    /// exists but is unreadable - the caller decides whether that is fatal.
    pub fn load(&self, slot: Slot) -> Result<Option<(NetWeights, TrainingState)>> {
        let dir = self.root.join(slot.dir_name());
        if !dir.exists() {
            return Ok(None);
        }
        let weights: NetWeights = read_json(&dir.join(WEIGHTS_FILE))?;
        let state: TrainingState = read_json(&dir.join(STATE_FILE))?;
        Ok(Some((weights, state)))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), value)
        .with_context(|| format!("cannot write {}", path.display()))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("corrupt checkpoint file {}", path.display()))
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
    }
}

#[cfg(test)]
mod test {
    use crate::ql::model::{MlpQNet, QFunction};

    use super::*;

    fn state(steps: usize) -> TrainingState {
        TrainingState {
            epsilon: 0.5,
            total_steps: steps,
            episode: steps / 100,
            best_avg_reward: None,
        }
    }

    #[test]
    fn round_trip_preserves_weights_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = MlpQNet::with_seed(0.001, 7);
        let state = TrainingState {
            epsilon: 0.123,
            total_steps: 4567,
            episode: 89,
            best_avg_reward: Some(12.5),
        };

        store.save(Slot::Latest, &net.weights(), &state).unwrap();
        let (weights, loaded) = store.load(Slot::Latest).unwrap().unwrap();

        assert_eq!(weights, net.weights());
        assert_eq!(loaded, state);
    }

    #[test]
    fn absent_slot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        assert!(store.load(Slot::Latest).unwrap().is_none());
        assert!(store.load(Slot::Best).unwrap().is_none());
    }

    #[test]
    fn corrupt_slot_is_a_recoverable_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = MlpQNet::with_seed(0.001, 1);
        store.save(Slot::Latest, &net.weights(), &state(0)).unwrap();
        fs::write(dir.path().join("latest").join(STATE_FILE), b"not json").unwrap();

        assert!(store.load(Slot::Latest).is_err());
    }

    #[test]
    fn latest_rotates_one_backup_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = MlpQNet::with_seed(0.001, 2);

        store.save(Slot::Latest, &net.weights(), &state(100)).unwrap();
        assert!(store.load(Slot::Backup).unwrap().is_none());

        store.save(Slot::Latest, &net.weights(), &state(200)).unwrap();
        let (_, backup) = store.load(Slot::Backup).unwrap().unwrap();
        assert_eq!(backup.total_steps, 100);

        // only one generation retained
        store.save(Slot::Latest, &net.weights(), &state(300)).unwrap();
        let (_, backup) = store.load(Slot::Backup).unwrap().unwrap();
        assert_eq!(backup.total_steps, 200);
        let (_, latest) = store.load(Slot::Latest).unwrap().unwrap();
        assert_eq!(latest.total_steps, 300);
    }

    #[test]
    fn interrupted_rotation_leaves_a_complete_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = MlpQNet::with_seed(0.001, 5);
        store.save(Slot::Latest, &net.weights(), &state(100)).unwrap();

        // crash window of a follow-up save: rotated to backup, not yet promoted
        fs::rename(dir.path().join("latest"), dir.path().join("backup")).unwrap();

        assert!(store.load(Slot::Latest).unwrap().is_none());
        let (weights, backup) = store.load(Slot::Backup).unwrap().unwrap();
        assert_eq!(weights, net.weights());
        assert_eq!(backup.total_steps, 100);
    }

    #[test]
    fn best_slot_is_overwritten_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = MlpQNet::with_seed(0.001, 3);

        store.save(Slot::Best, &net.weights(), &state(100)).unwrap();
        store.save(Slot::Best, &net.weights(), &state(200)).unwrap();

        let (_, best) = store.load(Slot::Best).unwrap().unwrap();
        assert_eq!(best.total_steps, 200);
        assert!(store.load(Slot::Backup).unwrap().is_none());
    }

    #[test]
    fn direct_backup_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = MlpQNet::with_seed(0.001, 4);
        assert!(store.save(Slot::Backup, &net.weights(), &state(0)).is_err());
    }
}
