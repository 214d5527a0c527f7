use crate::document::Fields;
use crate::targets::{AggregateSpec, Tally};
use serde_json::Value;
use std::collections::BTreeMap;

/// Derived parent field -> count.
pub type Aggregates = BTreeMap<String, u64>;

/// Compute the aggregates declared by `spec` over one parent's children.
///
/// Every declared output field is present in the result, zero when nothing
/// matched, so an empty child list still yields a complete map. Children
/// whose tally value is missing or unlisted only count toward `other`.
pub fn compute_aggregates(children: &[Fields], spec: &AggregateSpec) -> Aggregates {
    let mut aggregates = Aggregates::new();

    if let Some(total) = &spec.total {
        aggregates.insert(total.clone(), children.len() as u64);
    }

    for tally in &spec.tallies {
        for field in tally.output_fields() {
            aggregates.insert(field.to_string(), 0);
        }
        for child in children {
            if let Some(field) = bucket_for(tally, child) {
                *aggregates.entry(field.to_string()).or_insert(0) += 1;
            }
        }
    }

    aggregates
}

fn bucket_for<'t>(tally: &'t Tally, child: &Fields) -> Option<&'t str> {
    child
        .get(&tally.field)
        .and_then(category_value)
        .and_then(|value| tally.counts.get(&value))
        .or(tally.other.as_ref())
        .map(String::as_str)
}

/// Category key of a child value: strings as-is, other scalars by their JSON text.
fn category_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Check that `aggregates` agrees with a child set of `child_count` elements:
/// the total equals the count, each exhaustive tally sums to the count, and no
/// other tally exceeds it.
pub fn is_consistent(aggregates: &Aggregates, spec: &AggregateSpec, child_count: usize) -> bool {
    let child_count = child_count as u64;

    if let Some(total) = &spec.total {
        if aggregates.get(total) != Some(&child_count) {
            return false;
        }
    }

    spec.tallies.iter().all(|tally| {
        let mut sum = 0;
        for field in tally.output_fields() {
            match aggregates.get(field) {
                Some(count) => sum += count,
                None => return false,
            }
        }
        if tally.is_exhaustive() {
            sum == child_count
        } else {
            sum <= child_count
        }
    })
}

/// Aggregates as parent fields ready to merge.
pub fn to_fields(aggregates: &Aggregates) -> Fields {
    aggregates
        .iter()
        .map(|(field, count)| (field.clone(), Value::from(*count)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::fields;
    use crate::targets::builtin_targets;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn puppy_spec() -> AggregateSpec {
        builtin_targets()
            .unwrap()
            .into_iter()
            .find(|t| t.field == "puppies")
            .and_then(|t| t.aggregates)
            .unwrap()
    }

    fn exhaustive_spec() -> AggregateSpec {
        let mut spec = puppy_spec();
        spec.tallies[0].other = Some("unknownSexCount".into());
        spec.tallies[1].other = Some("otherStatusCount".into());
        spec
    }

    #[test]
    fn test_litter_counts() {
        let children = vec![
            fields(json!({ "sex": "male", "status": "available" })),
            fields(json!({ "sex": "female", "status": "sold" })),
        ];
        let aggregates = compute_aggregates(&children, &puppy_spec());

        let expected: Aggregates = [
            ("puppyCount", 2),
            ("maleCount", 1),
            ("femaleCount", 1),
            ("availableCount", 1),
            ("reservedCount", 0),
            ("soldCount", 1),
            ("keptCount", 0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        assert_eq!(aggregates, expected);
        assert!(is_consistent(&aggregates, &puppy_spec(), 2));
    }

    #[test]
    fn test_empty_children_yield_every_key() {
        let spec = exhaustive_spec();
        let aggregates = compute_aggregates(&[], &spec);
        assert_eq!(aggregates.len(), spec.output_fields().len());
        assert!(aggregates.values().all(|count| *count == 0));
        assert!(is_consistent(&aggregates, &spec, 0));
    }

    #[test]
    fn test_unlisted_and_missing_values_go_to_other() {
        let spec = exhaustive_spec();
        let children = vec![
            fields(json!({ "sex": "male", "status": "deceased" })),
            fields(json!({ "status": "kept" })),
            fields(json!({ "sex": null, "status": 3 })),
        ];
        let aggregates = compute_aggregates(&children, &spec);
        assert_eq!(aggregates["maleCount"], 1);
        assert_eq!(aggregates["unknownSexCount"], 2);
        assert_eq!(aggregates["keptCount"], 1);
        assert_eq!(aggregates["otherStatusCount"], 2);
        assert!(is_consistent(&aggregates, &spec, 3));
    }

    #[test]
    fn test_exhaustive_tallies_sum_to_total() {
        let spec = exhaustive_spec();
        let sexes = ["male", "female", "", "unknown"];
        let statuses = ["available", "reserved", "sold", "kept", "returned"];

        for n in 0..40usize {
            let children: Vec<Fields> = (0..n)
                .map(|i| {
                    fields(json!({
                        "sex": sexes[(i * 7 + n) % sexes.len()],
                        "status": statuses[(i * 3 + n) % statuses.len()],
                    }))
                })
                .collect();
            let aggregates = compute_aggregates(&children, &spec);
            assert!(is_consistent(&aggregates, &spec, n), "inconsistent for n={n}");
            for tally in &spec.tallies {
                let sum: u64 = tally.output_fields().iter().map(|f| aggregates[*f]).sum();
                assert_eq!(sum, n as u64);
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let children = vec![
            fields(json!({ "sex": "female", "status": "reserved" })),
            fields(json!({ "sex": "female", "status": "kept" })),
        ];
        let spec = puppy_spec();
        assert_eq!(
            compute_aggregates(&children, &spec),
            compute_aggregates(&children, &spec)
        );
    }

    #[test]
    fn test_inconsistent_total_detected() {
        let spec = puppy_spec();
        let mut aggregates = compute_aggregates(&[fields(json!({ "sex": "male" }))], &spec);
        assert!(!is_consistent(&aggregates, &spec, 2));
        aggregates.remove("maleCount");
        assert!(!is_consistent(&aggregates, &spec, 1));
    }

    #[test]
    fn test_to_fields() {
        let spec = AggregateSpec {
            total: Some("expenseCount".into()),
            tallies: vec![],
        };
        let out = to_fields(&compute_aggregates(&[], &spec));
        assert_eq!(out, fields(json!({ "expenseCount": 0 })));
    }
}
