//! Write-once on-disk transaction cache
//!
//! One file per signature under `<root>/transactions`, holding the pretty
//! rendered codec text. Entries are never rewritten: new entries are staged
//! in a dot-prefixed temporary file and linked into place only if no entry
//! exists yet, so concurrent writers (in this process or another) cannot
//! clobber each other. Within the process a per-signature async lock keeps
//! concurrent callers for one signature down to a single load.
//!
//! A stored entry that cannot be decoded or validated is never treated as a
//! miss. It is reported through [`CacheFault`], separate from the ordinary
//! [`PipelineError`] results.

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use super::codec::{self, DeserializeError};
use super::errors::PipelineError;
use crate::metrics::{PipelineMetrics, Timer};
use crate::structured_logging::PipelineLogger;
use crate::types::Transaction;

/// Directory below the cache root that holds transaction entries
pub const TRANSACTIONS_DIR: &str = "transactions";

const PENDING_PREFIX: &str = ".pending-";

/// Why a stored entry was rejected
#[derive(Debug, Error)]
pub enum CorruptionCause {
    #[error(transparent)]
    Decode(#[from] DeserializeError),

    #[error("entry holds transaction {found}, expected {expected}")]
    SignatureMismatch { expected: String, found: String },
}

/// Fatal cache conditions
///
/// Any of these aborts the operation for that signature. They are never
/// converted into a refetch.
#[derive(Debug, Error)]
pub enum CacheFault {
    #[error("corrupt cache entry for {signature} at {}: {cause}", .path.display())]
    Corrupt {
        signature: String,
        path: PathBuf,
        /// Stored bytes exactly as read, kept for recovery
        raw: Vec<u8>,
        #[source]
        cause: CorruptionCause,
    },

    #[error("cache storage failure at {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {signature} for the cache: {source}")]
    Encode {
        signature: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-signature on-disk cache
pub struct TransactionCache {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    metrics: Option<Arc<PipelineMetrics>>,
    logger: PipelineLogger,
}

impl TransactionCache {
    /// Open the cache below `root`, creating the entry directory if needed
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CacheFault> {
        let dir = root.as_ref().join(TRANSACTIONS_DIR);
        std::fs::create_dir_all(&dir).map_err(|source| CacheFault::Storage {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
            metrics: None,
            logger: PipelineLogger::default(),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_logger(mut self, logger: PipelineLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the entry for `signature`
    ///
    /// Signatures are base58, an alphabet without path separators or dots,
    /// so they are used as file names directly.
    pub fn entry_path(&self, signature: &str) -> PathBuf {
        self.dir.join(signature)
    }

    pub async fn contains(&self, signature: &str) -> Result<bool, CacheFault> {
        let path = self.entry_path(signature);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| CacheFault::Storage { path, source })
    }

    /// Number of cached transactions
    pub async fn len(&self) -> Result<usize, CacheFault> {
        let storage = |source| CacheFault::Storage {
            path: self.dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(storage)?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.map_err(storage)? {
            if !entry.file_name().to_string_lossy().starts_with('.') {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool, CacheFault> {
        Ok(self.len().await? == 0)
    }

    /// Read and validate the entry for `signature`, `Ok(None)` on a miss
    pub async fn lookup(&self, signature: &str) -> Result<Option<Transaction>, CacheFault> {
        let path = self.entry_path(signature);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheFault::Storage { path, source }),
        };

        let cause = match codec::deserialize_bytes(&raw) {
            Ok(tx) if tx.signature() == signature => return Ok(Some(tx)),
            Ok(tx) => CorruptionCause::SignatureMismatch {
                expected: signature.to_string(),
                found: tx.signature().to_string(),
            },
            Err(err) => CorruptionCause::Decode(err),
        };

        self.logger.log_corruption(
            signature,
            &path.display().to_string(),
            &raw,
            &cause.to_string(),
        );
        if let Some(metrics) = &self.metrics {
            metrics.corruptions.inc();
        }
        Err(CacheFault::Corrupt {
            signature: signature.to_string(),
            path,
            raw,
            cause,
        })
    }

    /// Return the cached transaction, or run `load` and persist its result
    ///
    /// Only a successfully validated transaction whose primary signature is
    /// `signature` is persisted. Failures from `load` are returned as-is in
    /// the inner result and leave the cache untouched.
    pub async fn get<F, Fut>(
        &self,
        signature: &str,
        load: F,
    ) -> Result<Result<Transaction, PipelineError>, CacheFault>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Transaction, PipelineError>>,
    {
        if !is_valid_signature(signature) {
            return Ok(Err(PipelineError::InvalidSignature {
                signature: signature.to_string(),
            }));
        }
        if let Some(tx) = self.lookup(signature).await? {
            self.record_hit(signature);
            return Ok(Ok(tx));
        }

        let lock = self
            .locks
            .entry(signature.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;
        let result = self.load_and_persist(signature, load).await;
        drop(guard);

        // Holders: the map and this call. Anyone else still waiting keeps it.
        self.locks
            .remove_if(signature, |_, entry| Arc::strong_count(entry) <= 2);
        result
    }

    async fn load_and_persist<F, Fut>(
        &self,
        signature: &str,
        load: F,
    ) -> Result<Result<Transaction, PipelineError>, CacheFault>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Transaction, PipelineError>>,
    {
        // Another caller may have filled the entry while we waited
        if let Some(tx) = self.lookup(signature).await? {
            self.record_hit(signature);
            return Ok(Ok(tx));
        }

        self.logger.log_cache_miss(signature);
        if let Some(metrics) = &self.metrics {
            metrics.cache_misses.inc();
        }

        let timer = Timer::start();
        let tx = match load().await {
            Ok(tx) => tx,
            Err(err) => return Ok(Err(err)),
        };
        if tx.signature() != signature {
            return Ok(Err(PipelineError::SignatureMismatch {
                requested: signature.to_string(),
                primary: tx.signature().to_string(),
            }));
        }

        if self.persist(&tx, &timer).await? {
            return Ok(Ok(tx));
        }

        // Lost a create race against another process: serve its entry
        self.logger.log_persist_race(signature);
        match self.lookup(signature).await? {
            Some(existing) => Ok(Ok(existing)),
            None => Err(CacheFault::Storage {
                path: self.entry_path(signature),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "entry vanished after a concurrent create",
                ),
            }),
        }
    }

    /// Write a new entry; `false` if one already existed
    async fn persist(&self, tx: &Transaction, timer: &Timer) -> Result<bool, CacheFault> {
        let signature = tx.signature().to_string();
        let text = codec::serialize(tx, true).map_err(|source| CacheFault::Encode {
            signature: signature.clone(),
            source,
        })?;
        let bytes = text.len();

        let dir = self.dir.clone();
        let path = self.entry_path(&signature);
        let target = path.clone();
        let created = tokio::task::spawn_blocking(move || write_new(&dir, &target, text.as_bytes()))
            .await
            .map_err(io::Error::other)
            .and_then(|written| written)
            .map_err(|source| CacheFault::Storage { path, source })?;

        if created {
            self.logger
                .log_persisted(&signature, bytes, (timer.elapsed_secs() * 1000.0) as u64);
            if let Some(metrics) = &self.metrics {
                metrics.persists.inc();
            }
        }
        Ok(created)
    }

    fn record_hit(&self, signature: &str) {
        self.logger.log_cache_hit(signature);
        if let Some(metrics) = &self.metrics {
            metrics.cache_hits.inc();
        }
    }
}

/// Cache keys must be non-empty base58
pub fn is_valid_signature(signature: &str) -> bool {
    !signature.is_empty() && bs58::decode(signature).into_vec().is_ok()
}

fn write_new(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<bool> {
    let mut staged = tempfile::Builder::new()
        .prefix(PENDING_PREFIX)
        .tempfile_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    match staged.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err.error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    use crate::types::{Account, Instruction, TransactionVersion};

    fn sig(n: u8) -> String {
        bs58::encode([n; 64]).into_string()
    }

    async fn never_load() -> Result<Transaction, PipelineError> {
        panic!("loader must not run")
    }

    fn transaction(signature: &str) -> Transaction {
        Transaction {
            block_time: 1_700_000_000,
            slot: 7,
            recent_blockhash: bs58::encode([9u8; 32]).into_string(),
            compute_units_consumed: BigUint::from(150u32),
            err: None,
            fee: BigUint::from(5000u32),
            signatures: vec![signature.to_string()],
            version: TransactionVersion::Legacy,
            log_messages: vec![],
            accounts: vec![Account {
                pubkey: bs58::encode([1u8; 32]).into_string(),
                is_signer: true,
                is_writeable: true,
                pre_balance: BigUint::from(10u32),
                post_balance: BigUint::from(5u32),
                pre_token_balance: None,
                post_token_balance: None,
            }],
            instructions: vec![Instruction {
                stack_height: Some(1),
                program_id_index: 0,
                data: String::new(),
                accounts: vec![0],
            }],
        }
    }

    #[tokio::test]
    async fn test_miss_persists_then_hits() {
        let root = tempfile::tempdir().unwrap();
        let cache = TransactionCache::open(root.path()).unwrap();
        let signature = sig(1);

        let first = cache
            .get(&signature, || async { Ok(transaction(&sig(1))) })
            .await
            .unwrap()
            .unwrap();
        assert!(cache.contains(&signature).await.unwrap());
        assert_eq!(cache.len().await.unwrap(), 1);

        let second = cache
            .get(&signature, never_load)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);

        let text = std::fs::read_to_string(cache.entry_path(&signature)).unwrap();
        assert!(text.contains("\n  \"fee\": \"BIGINT:5000\""));
    }

    #[tokio::test]
    async fn test_load_failure_is_not_persisted() {
        let root = tempfile::tempdir().unwrap();
        let cache = TransactionCache::open(root.path()).unwrap();
        let signature = sig(2);

        let result = cache
            .get(&signature, || async {
                Err(PipelineError::NullFetchResponse {
                    signature: sig(2),
                })
            })
            .await
            .unwrap();
        assert!(matches!(result, Err(PipelineError::NullFetchResponse { .. })));
        assert!(cache.is_empty().await.unwrap());
        assert!(cache.locks.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected() {
        let root = tempfile::tempdir().unwrap();
        let cache = TransactionCache::open(root.path()).unwrap();

        for bad in ["", "../etc/passwd", "0OIl"] {
            let result = cache
                .get(bad, never_load)
                .await
                .unwrap();
            assert!(matches!(result, Err(PipelineError::InvalidSignature { .. })));
        }
    }

    #[tokio::test]
    async fn test_mismatched_primary_signature_not_persisted() {
        let root = tempfile::tempdir().unwrap();
        let cache = TransactionCache::open(root.path()).unwrap();

        let result = cache
            .get(&sig(3), || async { Ok(transaction(&sig(4))) })
            .await
            .unwrap();
        assert!(matches!(result, Err(PipelineError::SignatureMismatch { .. })));
        assert!(!cache.contains(&sig(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let cache = TransactionCache::open(root.path()).unwrap();
        let signature = sig(5);
        std::fs::write(cache.entry_path(&signature), b"\x00not json").unwrap();

        let fault = cache
            .get(&signature, || async { Ok(transaction(&sig(5))) })
            .await
            .unwrap_err();
        match fault {
            CacheFault::Corrupt { signature: s, raw, cause, .. } => {
                assert_eq!(s, signature);
                assert_eq!(raw, b"\x00not json");
                assert!(matches!(cause, CorruptionCause::Decode(_)));
            }
            other => panic!("unexpected fault: {other}"),
        }
    }

    #[tokio::test]
    async fn test_entry_for_other_signature_is_corrupt() {
        let root = tempfile::tempdir().unwrap();
        let cache = TransactionCache::open(root.path()).unwrap();
        let text = codec::serialize(&transaction(&sig(6)), true).unwrap();
        std::fs::write(cache.entry_path(&sig(7)), text).unwrap();

        let fault = cache.lookup(&sig(7)).await.unwrap_err();
        assert!(matches!(
            fault,
            CacheFault::Corrupt {
                cause: CorruptionCause::SignatureMismatch { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_write_new_never_clobbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        assert!(write_new(dir.path(), &path, b"first").unwrap());
        assert!(!write_new(dir.path(), &path, b"second").unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        // staged files are cleaned up
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
