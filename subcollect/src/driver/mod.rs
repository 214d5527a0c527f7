use crate::batch::BatchWriter;
use crate::cleanup::{CleanupExecutor, CleanupOutcome};
use crate::config::PipelineConfig;
use crate::document::{document_path, Document};
use crate::manifest::{self, ManifestEntry};
use crate::migrator::FieldMigrator;
use crate::report::{MigrationStats, Phase, RunReport};
use crate::store::DocumentStore;
use crate::targets::MigrationTarget;
use crate::verifier::Verifier;
use chrono::Utc;

/// Runs the pipeline phases over every configured target.
///
/// Each phase is a full scan: every collection named by a target is listed
/// and its parents visited in id order, one parent and one target at a time.
/// Failures are recorded in the report at the narrowest scope and never stop
/// the run.
pub struct Pipeline<'a, S: ?Sized> {
    store: &'a S,
    config: PipelineConfig,
    targets: Vec<MigrationTarget>,
}

impl<'a, S: DocumentStore + ?Sized> Pipeline<'a, S> {
    pub fn new(store: &'a S, config: PipelineConfig, targets: Vec<MigrationTarget>) -> Self {
        Pipeline {
            store,
            config,
            targets,
        }
    }

    pub fn targets(&self) -> &[MigrationTarget] {
        &self.targets
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Move every target's embedded arrays into subcollections. The embedded
    /// fields stay in place; in execute mode the manifest is updated per target.
    pub fn migrate(&self) -> RunReport {
        let started_at = Utc::now().to_rfc3339();
        let mut report = RunReport::new(Phase::Migrate, self.config.mode, started_at.clone());
        let mut writer = BatchWriter::new(self.store, &self.config);
        log::info!("Starting migrate ({})", self.config.mode.label());

        let stats = &mut report.stats;
        for (collection, targets) in self.by_collection() {
            let Some(parents) = self.load_parents(collection, stats) else {
                continue;
            };
            let migrators: Vec<FieldMigrator> = targets
                .iter()
                .map(|target| FieldMigrator::new(target, started_at.clone()))
                .collect();

            for parent in &parents {
                stats.parents_scanned += 1;
                let mut mutated = false;
                for migrator in &migrators {
                    match migrator.migrate_parent(parent, &mut writer, stats) {
                        Ok(outcome) => mutated |= outcome.mutated_parent(),
                        Err(e) => stats.record_error(format!(
                            "{}: {} migration failed: {e}",
                            document_path(collection, &parent.id),
                            migrator.target().field
                        )),
                    }
                }
                if mutated {
                    stats.parents_mutated += 1;
                }
            }

            if !self.config.mode.is_dry_run() {
                for target in &targets {
                    self.record_manifest(target, &started_at, &mut writer, stats);
                }
            }
        }

        stats.batches = writer.stats().clone();
        for target in &self.targets {
            let created = stats
                .target(&target.key())
                .map_or(0, |t| t.children_created);
            *report
                .items_migrated
                .entry(target.migrated_stat_key())
                .or_insert(0) += created;
        }
        log::info!(
            "Finished migrate: {} parents, {} children, {} errors",
            report.stats.parents_scanned,
            report.stats.children_created(),
            report.stats.errors.len()
        );
        report
    }

    /// Remove embedded fields whose data is verified to live in the
    /// subcollection. Targets with no recorded execute-mode migration are
    /// refused outright.
    pub fn cleanup(&self) -> RunReport {
        let mut report = RunReport::new(Phase::Cleanup, self.config.mode, Utc::now().to_rfc3339());
        let mut writer = BatchWriter::new(self.store, &self.config);
        log::info!("Starting cleanup ({})", self.config.mode.label());

        let stats = &mut report.stats;
        for (collection, targets) in self.by_collection() {
            let allowed: Vec<&MigrationTarget> = targets
                .into_iter()
                .filter(|target| self.cleanup_allowed(target, stats))
                .collect();
            if allowed.is_empty() {
                continue;
            }
            let Some(parents) = self.load_parents(collection, stats) else {
                continue;
            };
            let executors: Vec<CleanupExecutor> =
                allowed.iter().map(|target| CleanupExecutor::new(target)).collect();

            for parent in &parents {
                stats.parents_scanned += 1;
                let mut mutated = false;
                for (executor, target) in executors.iter().zip(&allowed) {
                    match executor.clean_parent(parent, &mut writer, stats) {
                        Ok(outcome) => mutated |= outcome == CleanupOutcome::Removed,
                        Err(e) => stats.record_error(format!(
                            "{}: {} cleanup failed: {e}",
                            document_path(collection, &parent.id),
                            target.field
                        )),
                    }
                }
                if mutated {
                    stats.parents_mutated += 1;
                }
            }
        }

        stats.batches = writer.stats().clone();
        log::info!(
            "Finished cleanup: {} fields removed, {} warnings",
            report.stats.fields_removed(),
            report.stats.warnings.len()
        );
        report
    }

    /// Report which (parent, target) pairs are safe to clean. Never writes.
    pub fn verify(&self) -> RunReport {
        let mut report = RunReport::new(Phase::Verify, self.config.mode, Utc::now().to_rfc3339());
        let verifier = Verifier::new(self.store);

        for (collection, targets) in self.by_collection() {
            let Some(parents) = self.load_parents(collection, &mut report.stats) else {
                continue;
            };
            for parent in &parents {
                report.stats.parents_scanned += 1;
                for target in &targets {
                    let key = target.key();
                    report.stats.target_mut(&key).parents_scanned += 1;
                    match verifier.verify(target, parent) {
                        Ok(verification) => {
                            if !verification.safe_to_clean {
                                report.stats.target_mut(&key).parents_unsafe += 1;
                                report.stats.record_warning(format!(
                                    "{}: {}",
                                    verification.parent_path(),
                                    verification.reason.as_deref().unwrap_or("not verified")
                                ));
                            }
                            report.verifications.push(verification);
                        }
                        Err(e) => report.stats.record_error(format!(
                            "{}: {} verification failed: {e}",
                            document_path(collection, &parent.id),
                            target.field
                        )),
                    }
                }
            }
        }
        report
    }

    /// Targets grouped by source collection, in first-declared order.
    fn by_collection(&self) -> Vec<(&str, Vec<&MigrationTarget>)> {
        let mut groups: Vec<(&str, Vec<&MigrationTarget>)> = Vec::new();
        for target in &self.targets {
            match groups.iter_mut().find(|(c, _)| *c == target.collection) {
                Some((_, group)) => group.push(target),
                None => groups.push((target.collection.as_str(), vec![target])),
            }
        }
        groups
    }

    fn load_parents(&self, collection: &str, stats: &mut MigrationStats) -> Option<Vec<Document>> {
        match self.store.list_documents(collection) {
            Ok(parents) => {
                log::info!("Scanning {collection}: {} document(s)", parents.len());
                Some(parents)
            }
            Err(e) => {
                stats.record_error(format!("{collection}: cannot list documents: {e}"));
                None
            }
        }
    }

    fn cleanup_allowed(&self, target: &MigrationTarget, stats: &mut MigrationStats) -> bool {
        let key = target.key();
        match manifest::load_entry(self.store, target) {
            Ok(Some(entry)) => {
                log::debug!("{key}: last migrated {}", entry.last_migrated_at);
                true
            }
            Ok(None) => {
                stats.target_mut(&key).refused = true;
                stats.record_warning(format!(
                    "{key}: no completed execute-mode migration recorded; cleanup refused"
                ));
                false
            }
            Err(e) => {
                stats.target_mut(&key).refused = true;
                stats.record_error(format!("{key}: cannot read run manifest: {e}"));
                false
            }
        }
    }

    fn record_manifest(
        &self,
        target: &MigrationTarget,
        migrated_at: &str,
        writer: &mut BatchWriter<'_, S>,
        stats: &mut MigrationStats,
    ) {
        let key = target.key();
        let previous = match manifest::load_entry(self.store, target) {
            Ok(previous) => previous,
            Err(e) => {
                stats.record_error(format!("{key}: cannot read run manifest: {e}"));
                return;
            }
        };
        let pass = stats.target_mut(&key).clone();
        let entry = ManifestEntry::next(previous.as_ref(), target, migrated_at, &pass);
        if let Err(failure) = manifest::record_entry(writer, target, &entry) {
            stats.record_error(format!("{key}: cannot record run manifest: {failure}"));
        }
    }
}
