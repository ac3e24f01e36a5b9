//! On-disk context state.
//!
//! A context directory holds two files:
//!
//! - `secret.json`: the provisioned parameters (master secret and salt,
//!   IDs, algorithms), hex-encoded. Written once at creation.
//! - `sequence.json`: the sender sequence bound and the replay window.
//!   Rewritten whenever the bound advances (every `batch` allocations).
//!
//! Both are replaced atomically by writing a `.tmp` sibling and renaming
//! it over the target, so a crash leaves either the old or the new state,
//! never a torn file. A missing or unreadable `sequence.json` at load
//! time triggers the B.1 skip-ahead instead of failing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::algorithms::{AeadAlgorithm, HkdfAlgorithm};
use crate::context::{ContextParameters, SecurityContext};
use crate::error::SecurityError;
use crate::replay::ReplayWindow;

/// Default persistence batch: flush on every allocation.
pub const DEFAULT_BATCH: u64 = 1;

const SECRET_FILE: &str = "secret.json";
const SEQUENCE_FILE: &str = "sequence.json";

/// Handle on a context directory.
#[derive(Debug, Clone)]
pub struct ContextStore {
    dir: PathBuf,
    batch: u64,
}

#[derive(Serialize, Deserialize)]
struct SecretFile {
    master_secret: String,
    master_salt: String,
    sender_id: String,
    recipient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_context: Option<String>,
    aead_algorithm: String,
    hkdf_algorithm: String,
}

#[derive(Serialize, Deserialize)]
struct SequenceFile {
    next_seq: u64,
    replay_high: u64,
    replay_window: u32,
}

impl ContextStore {
    /// A store over `dir` with the default batch size.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ContextStore {
            dir: dir.into(),
            batch: DEFAULT_BATCH,
        }
    }

    /// Set the persistence batch: the sequence file is rewritten once
    /// every `batch` allocations, trading disk traffic for burned
    /// numbers after a crash.
    #[must_use]
    pub fn with_batch(mut self, batch: u64) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// The configured batch size.
    #[must_use]
    pub fn batch(&self) -> u64 {
        self.batch
    }

    /// Provision a fresh context into this directory.
    ///
    /// # Errors
    ///
    /// Derivation failures or I/O errors writing the two files.
    pub fn create(self, params: ContextParameters) -> Result<SecurityContext, SecurityError> {
        fs::create_dir_all(&self.dir)?;
        self.write_secret(&params)?;
        self.write_sequence(0, &ReplayWindow::new())?;

        let mut context = SecurityContext::new(params)?;
        context.store = Some(self);
        Ok(context)
    }

    /// Load a context previously written by [`create`](Self::create).
    ///
    /// A valid `sequence.json` restores the sender bound (advanced by one
    /// batch, so a crash mid-write can never replay a number) and the
    /// replay window. A missing or corrupt one starts B.1 recovery:
    /// the sequence number skips ahead and requests are Echo-challenged
    /// until the window is re-established.
    ///
    /// # Errors
    ///
    /// I/O or format errors on `secret.json`; derivation failures.
    pub fn load(self) -> Result<SecurityContext, SecurityError> {
        let secret: SecretFile =
            serde_json::from_slice(&fs::read(self.dir.join(SECRET_FILE))?)?;
        let params = ContextParameters {
            master_secret: hex::decode(&secret.master_secret)?,
            master_salt: hex::decode(&secret.master_salt)?,
            sender_id: hex::decode(&secret.sender_id)?,
            recipient_id: hex::decode(&secret.recipient_id)?,
            id_context: secret
                .id_context
                .as_deref()
                .map(hex::decode)
                .transpose()?,
            aead: AeadAlgorithm::from_name(&secret.aead_algorithm)?,
            hkdf: HkdfAlgorithm::from_name(&secret.hkdf_algorithm)?,
        };

        let mut context = SecurityContext::new(params)?;
        match self.read_sequence() {
            Ok(sequence) => {
                context.sender_seq = sequence.next_seq + self.batch;
                context.persisted_next = 0; // flush before first use
                context.replay =
                    ReplayWindow::from_parts(sequence.replay_high, sequence.replay_window);
                context.store = Some(self);
            }
            Err(error) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    %error,
                    "sequence state unreadable, entering recovery"
                );
                context.store = Some(self);
                context.start_recovery()?;
            }
        }
        Ok(context)
    }

    /// Rewrite `sequence.json` with a new sender bound and the current
    /// replay window.
    ///
    /// # Errors
    ///
    /// I/O errors; the write is atomic, the old state survives failures.
    pub fn write_sequence(
        &self,
        next_seq: u64,
        replay: &ReplayWindow,
    ) -> Result<(), SecurityError> {
        let (replay_high, replay_window) = replay.parts();
        let file = SequenceFile {
            next_seq,
            replay_high,
            replay_window,
        };
        atomic_write(
            &self.dir.join(SEQUENCE_FILE),
            serde_json::to_vec_pretty(&file)?.as_slice(),
        )?;
        Ok(())
    }

    fn write_secret(&self, params: &ContextParameters) -> Result<(), SecurityError> {
        let file = SecretFile {
            master_secret: hex::encode(&params.master_secret),
            master_salt: hex::encode(&params.master_salt),
            sender_id: hex::encode(&params.sender_id),
            recipient_id: hex::encode(&params.recipient_id),
            id_context: params.id_context.as_ref().map(hex::encode),
            aead_algorithm: params.aead.name().to_string(),
            hkdf_algorithm: params.hkdf.name().to_string(),
        };
        atomic_write(
            &self.dir.join(SECRET_FILE),
            serde_json::to_vec_pretty(&file)?.as_slice(),
        )?;
        Ok(())
    }

    fn read_sequence(&self) -> Result<SequenceFile, SecurityError> {
        Ok(serde_json::from_slice(&fs::read(
            self.dir.join(SEQUENCE_FILE),
        )?)?)
    }
}

/// Write-to-temp then rename.
fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ContextParameters {
        ContextParameters::new(vec![0x42; 16], vec![0x01, 0x02], vec![0xA1], vec![0xB2])
    }

    #[test]
    fn test_create_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let _context = ContextStore::new(dir.path()).create(params()).unwrap();

        assert!(dir.path().join("secret.json").exists());
        assert!(dir.path().join("sequence.json").exists());
        // no stray temp files
        assert!(!dir.path().join("sequence.json.tmp").exists());
    }

    #[test]
    fn test_load_restores_parameters() {
        let dir = tempfile::tempdir().unwrap();
        ContextStore::new(dir.path()).create(params()).unwrap();

        let context = ContextStore::new(dir.path()).load().unwrap();
        assert_eq!(context.sender_id(), &[0xA1]);
        assert_eq!(context.recipient_id(), &[0xB2]);
        assert!(!context.recovery_pending());
    }

    #[test]
    fn test_sequence_monotone_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut highest = None;

        for _ in 0..5 {
            let mut context = match highest {
                None => ContextStore::new(dir.path()).create(params()).unwrap(),
                Some(_) => ContextStore::new(dir.path()).load().unwrap(),
            };
            for _ in 0..3 {
                let seq = context.allocate_sequence_number().unwrap();
                if let Some(prev) = highest {
                    assert!(seq > prev, "sequence {seq} not above {prev}");
                }
                highest = Some(seq);
            }
            // context dropped without a clean shutdown
        }
    }

    #[test]
    fn test_persisted_bound_covers_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = ContextStore::new(dir.path())
            .with_batch(8)
            .create(params())
            .unwrap();

        let mut last = 0;
        for _ in 0..20 {
            last = context.allocate_sequence_number().unwrap();
        }

        let stored: SequenceFile = serde_json::from_slice(
            &fs::read(dir.path().join("sequence.json")).unwrap(),
        )
        .unwrap();
        assert!(
            stored.next_seq > last,
            "stored bound {} must exceed last used {last}",
            stored.next_seq
        );
    }

    #[test]
    fn test_missing_sequence_file_enters_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = ContextStore::new(dir.path()).create(params()).unwrap();
        for _ in 0..10 {
            context.allocate_sequence_number().unwrap();
        }
        drop(context);

        fs::remove_file(dir.path().join("sequence.json")).unwrap();
        let context = ContextStore::new(dir.path()).load().unwrap();
        assert!(context.recovery_pending());
        assert!(context.next_sequence_number() >= ReplayWindow::SIZE);
    }

    #[test]
    fn test_corrupt_sequence_file_enters_recovery() {
        let dir = tempfile::tempdir().unwrap();
        ContextStore::new(dir.path()).create(params()).unwrap();
        fs::write(dir.path().join("sequence.json"), b"{ not json").unwrap();

        let context = ContextStore::new(dir.path()).load().unwrap();
        assert!(context.recovery_pending());
    }

    #[test]
    fn test_replay_window_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = ContextStore::new(dir.path()).create(params()).unwrap();
        context.replay.commit(17);
        context.persist().unwrap();
        drop(context);

        let context = ContextStore::new(dir.path()).load().unwrap();
        assert!(!context.replay.check(17));
        assert!(context.replay.check(18));
    }

    #[test]
    fn test_id_context_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = params();
        p.id_context = Some(vec![0xDE, 0xAD]);
        ContextStore::new(dir.path()).create(p).unwrap();

        let context = ContextStore::new(dir.path()).load().unwrap();
        assert_eq!(context.params.id_context.as_deref(), Some(&[0xDE, 0xAD][..]));
    }
}
