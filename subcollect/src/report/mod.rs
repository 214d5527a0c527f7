use crate::batch::BatchStats;
use crate::config::RunMode;
use crate::verifier::Verification;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Which pipeline phase a run executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Migrate,
    Cleanup,
    Verify,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Migrate => "migrate",
            Phase::Cleanup => "cleanup",
            Phase::Verify => "verify",
        }
    }
}

/// Counters for one migration target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetStats {
    pub target: String,
    pub parents_scanned: usize,
    pub parents_empty: usize,
    pub parents_already_migrated: usize,
    pub parents_conflicting: usize,
    pub parents_migrated: usize,
    pub children_created: usize,
    pub aggregate_fields_updated: usize,
    pub fields_removed: usize,
    pub parents_unsafe: usize,
    pub refused: bool,
}

/// Per-run statistics shared by every component of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    pub parents_scanned: usize,
    pub parents_mutated: usize,
    pub targets: Vec<TargetStats>,
    pub batches: BatchStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl MigrationStats {
    /// Stats for `key`, created on first use. Targets keep first-use order.
    pub fn target_mut(&mut self, key: &str) -> &mut TargetStats {
        let index = match self.targets.iter().position(|t| t.target == key) {
            Some(index) => index,
            None => {
                self.targets.push(TargetStats {
                    target: key.to_string(),
                    ..TargetStats::default()
                });
                self.targets.len() - 1
            }
        };
        &mut self.targets[index]
    }

    pub fn target(&self, key: &str) -> Option<&TargetStats> {
        self.targets.iter().find(|t| t.target == key)
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{message}");
        self.errors.push(message);
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{message}");
        self.warnings.push(message);
    }

    pub fn children_created(&self) -> usize {
        self.targets.iter().map(|t| t.children_created).sum()
    }

    pub fn aggregate_fields_updated(&self) -> usize {
        self.targets.iter().map(|t| t.aggregate_fields_updated).sum()
    }

    pub fn fields_removed(&self) -> usize {
        self.targets.iter().map(|t| t.fields_removed).sum()
    }
}

/// The outcome of one run: mode, phase, statistics and (for `verify`) every
/// verification made. The rendered summary is the authoritative record of
/// what the run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub phase: Phase,
    pub mode: RunMode,
    pub started_at: String,
    /// `<field>Migrated` -> items migrated (or that would be, in dry-run).
    pub items_migrated: BTreeMap<String, usize>,
    pub stats: MigrationStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verifications: Vec<Verification>,
}

impl RunReport {
    pub fn new(phase: Phase, mode: RunMode, started_at: impl Into<String>) -> Self {
        RunReport {
            phase,
            mode,
            started_at: started_at.into(),
            items_migrated: BTreeMap::new(),
            stats: MigrationStats::default(),
            verifications: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.stats.errors.is_empty()
    }

    /// Process exit code: 2 when an execute run finished with errors, else 0.
    /// Warnings and dry-run errors never fail a run.
    pub fn exit_code(&self) -> i32 {
        if self.mode == RunMode::Execute && self.has_errors() {
            2
        } else {
            0
        }
    }

    /// Human-readable summary table.
    pub fn render(&self) -> String {
        let stats = &self.stats;
        let mut out = String::new();

        let _ = writeln!(
            out,
            "== subcollect {} ({}) started {} ==",
            self.phase.name(),
            self.mode.label(),
            self.started_at
        );
        let _ = writeln!(out, "Documents processed:       {}", stats.parents_scanned);
        let _ = writeln!(out, "Documents mutated:         {}", stats.parents_mutated);
        let _ = writeln!(out, "Child records created:     {}", stats.children_created());
        let _ = writeln!(out, "Aggregate fields updated:  {}", stats.aggregate_fields_updated());
        let _ = writeln!(out, "Fields removed:            {}", stats.fields_removed());

        if !stats.targets.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "{:<26} {:>8} {:>7} {:>8} {:>9} {:>8} {:>7} {:>7} {:>7} {:>7}",
                "target", "scanned", "empty", "skipped", "conflicts", "parents", "items", "aggs", "removed", "unsafe"
            );
            for t in &stats.targets {
                let name = if t.refused {
                    format!("{} (refused)", t.target)
                } else {
                    t.target.clone()
                };
                let _ = writeln!(
                    out,
                    "{:<26} {:>8} {:>7} {:>8} {:>9} {:>8} {:>7} {:>7} {:>7} {:>7}",
                    name,
                    t.parents_scanned,
                    t.parents_empty,
                    t.parents_already_migrated,
                    t.parents_conflicting,
                    t.parents_migrated,
                    t.children_created,
                    t.aggregate_fields_updated,
                    t.fields_removed,
                    t.parents_unsafe
                );
            }
        }

        if !self.items_migrated.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Items migrated:");
            for (key, count) in &self.items_migrated {
                let _ = writeln!(out, "  {key}: {count}");
            }
        }

        if !self.verifications.is_empty() {
            let safe = self.verifications.iter().filter(|v| v.safe_to_clean).count();
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "Verified {} pair(s): {} safe to clean, {} unsafe",
                self.verifications.len(),
                safe,
                self.verifications.len() - safe
            );
        }

        let b = &stats.batches;
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Batches: {} committed, {} failed, {} retries; ops: {} committed, {} would apply",
            b.batches_committed, b.batches_failed, b.retries, b.ops_committed, b.ops_would_apply
        );

        let _ = writeln!(out, "Errors ({}):", stats.errors.len());
        for error in &stats.errors {
            let _ = writeln!(out, "  - {error}");
        }
        let _ = writeln!(out, "Warnings ({}):", stats.warnings.len());
        for warning in &stats.warnings {
            let _ = writeln!(out, "  - {warning}");
        }

        out
    }
}
