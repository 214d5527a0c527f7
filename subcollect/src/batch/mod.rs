use crate::config::{PipelineConfig, RetryPolicy, RunMode};
use crate::document::WriteOp;
use crate::store::DocumentStore;
use serde::Serialize;
use std::fmt;

/// A batch that could not be committed, with the ops it carried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    /// 1-based sequence number of the batch within the run.
    pub batch: usize,
    pub attempts: u32,
    pub error: String,
    /// Paths of every document the batch would have written.
    pub op_paths: Vec<String>,
    /// Top-level documents touched by the batch, deduplicated in order.
    pub owner_ids: Vec<String>,
    pub create_ops: usize,
}

impl BatchFailure {
    fn new(batch: usize, attempts: u32, error: String, ops: &[WriteOp]) -> Self {
        let mut owner_ids: Vec<String> = Vec::new();
        for op in ops {
            if !owner_ids.iter().any(|id| id == op.owner_id()) {
                owner_ids.push(op.owner_id().to_string());
            }
        }
        BatchFailure {
            batch,
            attempts,
            error,
            op_paths: ops.iter().map(WriteOp::path).collect(),
            owner_ids,
            create_ops: ops
                .iter()
                .filter(|op| matches!(op, WriteOp::CreateChild { .. }))
                .count(),
        }
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {} failed after {} attempt(s): {} ({} op(s) for {}",
            self.batch,
            self.attempts,
            self.error,
            self.op_paths.len(),
            self.owner_ids.join(", ")
        )?;
        match (self.op_paths.first(), self.op_paths.last()) {
            (Some(first), Some(last)) if self.op_paths.len() > 1 => {
                write!(f, "; {first} .. {last})")
            }
            (Some(only), _) => write!(f, "; {only})"),
            _ => write!(f, ")"),
        }
    }
}

/// Counters kept by the batch writer over a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub ops_committed: usize,
    pub ops_would_apply: usize,
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub retries: usize,
}

/// Groups writes into bounded batches and commits them to the store.
///
/// In dry-run mode nothing reaches the store: each op is counted as
/// would-apply and accepted. The mode is consulted on every submit.
pub struct BatchWriter<'a, S: ?Sized> {
    store: &'a S,
    mode: RunMode,
    max_ops: usize,
    retry: RetryPolicy,
    pending: Vec<WriteOp>,
    batches_started: usize,
    stats: BatchStats,
}

impl<'a, S: DocumentStore + ?Sized> BatchWriter<'a, S> {
    pub fn new(store: &'a S, config: &PipelineConfig) -> Self {
        BatchWriter {
            store,
            mode: config.mode,
            max_ops: config.max_batch_ops.max(1),
            retry: config.retry,
            pending: Vec::new(),
            batches_started: 0,
            stats: BatchStats::default(),
        }
    }

    /// The store this writer commits to, for reads made alongside writes.
    pub fn store(&self) -> &'a S {
        self.store
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue one write. Commits the pending batch when it reaches the limit;
    /// the error, if any, is that commit's failure.
    pub fn submit(&mut self, op: WriteOp) -> Result<(), BatchFailure> {
        if self.mode.is_dry_run() {
            self.stats.ops_would_apply += 1;
            return Ok(());
        }

        self.pending.push(op);
        if self.pending.len() >= self.max_ops {
            self.commit_pending()
        } else {
            Ok(())
        }
    }

    /// Commit whatever is pending.
    pub fn flush(&mut self) -> Result<(), BatchFailure> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.commit_pending()
    }

    fn commit_pending(&mut self) -> Result<(), BatchFailure> {
        let ops = std::mem::take(&mut self.pending);
        self.batches_started += 1;
        let batch = self.batches_started;

        let mut attempt = 1;
        loop {
            match self.store.commit(&ops) {
                Ok(()) => {
                    log::debug!("Committed batch {batch} ({} ops)", ops.len());
                    self.stats.batches_committed += 1;
                    self.stats.ops_committed += ops.len();
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    log::warn!(
                        "Batch {batch} failed on attempt {attempt}/{}: {e}; retrying in {delay:?}",
                        self.retry.max_attempts
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    self.stats.retries += 1;
                    attempt += 1;
                }
                Err(e) => {
                    let failure = BatchFailure::new(batch, attempt, e.to_string(), &ops);
                    log::warn!("{failure}");
                    self.stats.batches_failed += 1;
                    return Err(failure);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{fields, RecordingStore};
    use serde_json::json;

    fn create(i: usize) -> WriteOp {
        WriteOp::CreateChild {
            parent_collection: "litters".into(),
            parent_id: "big".into(),
            subcollection: "puppies".into(),
            child_id: format!("p{i:04}"),
            data: fields(json!({ "idx": i })),
        }
    }

    fn execute_config() -> PipelineConfig {
        PipelineConfig::new(RunMode::Execute).with_retry(RetryPolicy::none())
    }

    #[test]
    fn test_dry_run_never_commits() {
        let store = RecordingStore::new();
        let mut writer = BatchWriter::new(&store, &PipelineConfig::new(RunMode::DryRun));

        for i in 0..1_200 {
            writer.submit(create(i)).unwrap();
        }
        writer.flush().unwrap();

        assert_eq!(store.attempts(), 0);
        assert_eq!(writer.stats().ops_would_apply, 1_200);
        assert_eq!(writer.stats().ops_committed, 0);
        assert!(store.inner.all_documents().is_empty());
    }

    #[test]
    fn test_batches_never_exceed_limit() {
        for total in [1usize, 499, 500, 501, 1_200] {
            let store = RecordingStore::new();
            let mut writer = BatchWriter::new(&store, &execute_config());
            for i in 0..total {
                writer.submit(create(i)).unwrap();
            }
            writer.flush().unwrap();

            let sizes = store.committed_sizes();
            assert!(sizes.iter().all(|size| *size <= 500), "{total}: {sizes:?}");
            assert_eq!(sizes.iter().sum::<usize>(), total);
            assert_eq!(writer.stats().ops_committed, total);
        }
    }

    #[test]
    fn test_small_limit_respected() {
        let store = RecordingStore::new();
        let config = execute_config().with_max_batch_ops(3);
        let mut writer = BatchWriter::new(&store, &config);
        for i in 0..7 {
            writer.submit(create(i)).unwrap();
        }
        assert_eq!(writer.pending_len(), 1);
        writer.flush().unwrap();
        assert_eq!(store.committed_sizes(), vec![3, 3, 1]);
    }

    #[test]
    fn test_failed_middle_batch_isolated() {
        let store = RecordingStore::new();
        store.fail_attempt(2, false);
        let mut writer = BatchWriter::new(&store, &execute_config());

        let mut failures = Vec::new();
        for i in 0..1_200 {
            if let Err(failure) = writer.submit(create(i)) {
                failures.push(failure);
            }
        }
        if let Err(failure) = writer.flush() {
            failures.push(failure);
        }

        assert_eq!(store.attempts(), 3);
        assert_eq!(store.committed_sizes(), vec![500, 200]);
        assert_eq!(failures.len(), 1);

        let failure = &failures[0];
        assert_eq!(failure.batch, 2);
        assert_eq!(failure.op_paths.len(), 500);
        assert_eq!(failure.op_paths[0], "litters/big/puppies/p0500");
        assert_eq!(failure.op_paths[499], "litters/big/puppies/p0999");
        assert_eq!(failure.owner_ids, vec!["big"]);
        assert_eq!(failure.create_ops, 500);

        assert_eq!(writer.stats().batches_committed, 2);
        assert_eq!(writer.stats().batches_failed, 1);
        assert_eq!(store.inner.count_documents("litters/big/puppies").unwrap(), 700);
    }

    #[test]
    fn test_transient_failure_retried() {
        let store = RecordingStore::new();
        store.fail_attempt(1, true);
        let config = PipelineConfig::new(RunMode::Execute).with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::ZERO,
        });
        let mut writer = BatchWriter::new(&store, &config);

        writer.submit(create(0)).unwrap();
        writer.flush().unwrap();

        assert_eq!(store.attempts(), 2);
        assert_eq!(writer.stats().retries, 1);
        assert_eq!(writer.stats().batches_committed, 1);
    }

    #[test]
    fn test_retries_are_bounded() {
        let store = RecordingStore::new();
        for attempt in 1..=5 {
            store.fail_attempt(attempt, true);
        }
        let config = PipelineConfig::new(RunMode::Execute).with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::ZERO,
        });
        let mut writer = BatchWriter::new(&store, &config);

        writer.submit(create(0)).unwrap();
        let failure = writer.flush().unwrap_err();

        assert_eq!(store.attempts(), 3);
        assert_eq!(failure.attempts, 3);
        assert_eq!(writer.stats().retries, 2);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let store = RecordingStore::new();
        store.fail_attempt(1, false);
        let config = PipelineConfig::new(RunMode::Execute);
        let mut writer = BatchWriter::new(&store, &config);

        writer.submit(create(0)).unwrap();
        let failure = writer.flush().unwrap_err();

        assert_eq!(store.attempts(), 1);
        assert_eq!(failure.attempts, 1);
        assert!(failure.to_string().contains("litters/big/puppies/p0000"));
    }
}
