use crate::error::{Result, SubcollectError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

const BUILTIN_TARGETS: &str = include_str!("targets.yaml");

/// One embedded-array field to move into a subcollection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTarget {
    pub collection: String,
    pub field: String,
    pub subcollection: String,
    /// Extra name under which the parent's id is copied onto each child.
    #[serde(default)]
    pub parent_id_alias: Option<String>,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default)]
    pub id_strategy: IdStrategy,
    /// Write zero-valued aggregates for parents whose array is empty or absent.
    #[serde(default)]
    pub write_empty_aggregates: bool,
    #[serde(default)]
    pub aggregates: Option<AggregateSpec>,
}

fn default_timestamp_field() -> String {
    "createdAt".to_string()
}

/// How fresh child ids are generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    #[default]
    Ulid,
    Uuid,
    Nanoid,
}

impl IdStrategy {
    pub fn generate(self) -> String {
        match self {
            IdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            IdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            IdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

/// Denormalized counts written back onto the parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Parent field receiving the number of children.
    #[serde(default)]
    pub total: Option<String>,
    #[serde(default)]
    pub tallies: Vec<Tally>,
}

/// Counts children by the value of one of their fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    /// Child field whose value picks the category.
    pub field: String,
    /// Category value -> parent field receiving its count.
    pub counts: BTreeMap<String, String>,
    /// Parent field counting children whose value is missing or unlisted.
    #[serde(default)]
    pub other: Option<String>,
}

impl Tally {
    /// Distinct parent fields this tally writes.
    pub fn output_fields(&self) -> BTreeSet<&str> {
        let mut fields: BTreeSet<&str> = self.counts.values().map(String::as_str).collect();
        if let Some(other) = &self.other {
            fields.insert(other);
        }
        fields
    }

    /// Whether every child lands in exactly one bucket.
    pub fn is_exhaustive(&self) -> bool {
        self.other.is_some()
    }
}

impl AggregateSpec {
    /// All parent fields these aggregates write, in a stable order.
    pub fn output_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.total.iter().map(String::as_str).collect();
        for tally in &self.tallies {
            fields.extend(tally.output_fields());
        }
        fields
    }
}

impl MigrationTarget {
    /// `collection.field`, used in reports, `--only` and the manifest.
    pub fn key(&self) -> String {
        format!("{}.{}", self.collection, self.field)
    }

    /// Parent field recording that every child of this field was committed.
    pub fn marker_field(&self) -> String {
        format!("{}MigratedAt", self.field)
    }

    /// Report key for the number of items migrated, e.g. `healthTestsMigrated`.
    pub fn migrated_stat_key(&self) -> String {
        format!("{}Migrated", self.field)
    }

    pub fn destination(&self) -> String {
        format!("{}/{{parentId}}/{}", self.collection, self.subcollection)
    }

    /// One-line summary for `--help` and `targets`.
    pub fn describe(&self) -> String {
        let mut line = format!("{:<24} -> {}", self.key(), self.destination());
        if let Some(alias) = &self.parent_id_alias {
            line.push_str(&format!("  [alias {alias}]"));
        }
        if let Some(spec) = &self.aggregates {
            line.push_str(&format!("  [aggregates {}]", spec.output_fields().join(", ")));
        }
        if self.write_empty_aggregates {
            line.push_str("  [zeros for empty]");
        }
        line
    }
}

/// Parse a YAML target table and validate it.
pub fn parse_targets_str(content: &str) -> Result<Vec<MigrationTarget>> {
    #[derive(Deserialize)]
    struct TargetFile {
        targets: Vec<MigrationTarget>,
    }

    let file: TargetFile = serde_yaml::from_str(content)?;
    validate_targets(&file.targets)?;
    Ok(file.targets)
}

/// The target table compiled into this build.
pub fn builtin_targets() -> Result<Vec<MigrationTarget>> {
    parse_targets_str(BUILTIN_TARGETS)
}

/// Check names, duplicates and aggregate field collisions.
pub fn validate_targets(targets: &[MigrationTarget]) -> Result<()> {
    let ident = Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$")
        .map_err(|e| SubcollectError::Other(format!("Regex error: {e}")))?;
    let check = |key: &str, what: &str, name: &str| -> Result<()> {
        if ident.is_match(name) {
            Ok(())
        } else {
            Err(SubcollectError::Config(format!(
                "target {key}: {what} '{name}' is not a valid identifier"
            )))
        }
    };

    let mut seen = HashSet::new();
    for target in targets {
        let key = target.key();
        check(&key, "collection", &target.collection)?;
        check(&key, "field", &target.field)?;
        check(&key, "subcollection", &target.subcollection)?;
        check(&key, "timestamp_field", &target.timestamp_field)?;
        if let Some(alias) = &target.parent_id_alias {
            check(&key, "parent_id_alias", alias)?;
            if alias == "parentId" {
                return Err(SubcollectError::Config(format!(
                    "target {key}: parent_id_alias must differ from parentId"
                )));
            }
        }

        if !seen.insert((target.collection.as_str(), target.field.as_str())) {
            return Err(SubcollectError::Config(format!("target {key} is declared twice")));
        }

        match &target.aggregates {
            Some(spec) => validate_aggregates(target, spec, &check)?,
            None if target.write_empty_aggregates => {
                return Err(SubcollectError::Config(format!(
                    "target {key}: write_empty_aggregates requires aggregates"
                )));
            }
            None => {}
        }
    }
    Ok(())
}

fn validate_aggregates(
    target: &MigrationTarget,
    spec: &AggregateSpec,
    check: &dyn Fn(&str, &str, &str) -> Result<()>,
) -> Result<()> {
    let key = target.key();
    let marker = target.marker_field();
    let mut claimed: HashSet<&str> = HashSet::new();

    let claim = |name: &str| -> Result<()> {
        check(&key, "aggregate field", name)?;
        if name == target.field || name == marker {
            return Err(SubcollectError::Config(format!(
                "target {key}: aggregate field '{name}' collides with a pipeline field"
            )));
        }
        Ok(())
    };

    if let Some(total) = &spec.total {
        claim(total)?;
        claimed.insert(total);
    }
    for tally in &spec.tallies {
        check(&key, "tally field", &tally.field)?;
        if tally.counts.is_empty() && tally.other.is_none() {
            return Err(SubcollectError::Config(format!(
                "target {key}: tally on '{}' has no categories",
                tally.field
            )));
        }
        // Several category values may share one output field inside a tally,
        // but an output field belongs to exactly one tally.
        for name in tally.output_fields() {
            claim(name)?;
            if !claimed.insert(name) {
                return Err(SubcollectError::Config(format!(
                    "target {key}: aggregate field '{name}' is declared twice"
                )));
            }
        }
    }
    Ok(())
}

/// Narrow `targets` to the `collection.field` keys in `only` (all when empty).
pub fn select_targets(targets: &[MigrationTarget], only: &[String]) -> Result<Vec<MigrationTarget>> {
    if only.is_empty() {
        return Ok(targets.to_vec());
    }

    for wanted in only {
        if !targets.iter().any(|t| &t.key() == wanted) {
            let known: Vec<String> = targets.iter().map(MigrationTarget::key).collect();
            return Err(SubcollectError::Config(format!(
                "unknown target '{wanted}' (configured: {})",
                known.join(", ")
            )));
        }
    }

    Ok(targets
        .iter()
        .filter(|t| only.contains(&t.key()))
        .cloned()
        .collect())
}

/// Render the target table, one target per line.
pub fn render_targets_table(targets: &[MigrationTarget]) -> String {
    let mut out = String::new();
    for target in targets {
        out.push_str("  ");
        out.push_str(&target.describe());
        out.push('\n');
    }
    out
}
