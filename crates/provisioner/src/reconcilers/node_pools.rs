use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::{Error, Result, api::NodePoolSpec, model::NodePoolRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intent {
    Keep,
    Add,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedNodePool {
    pub intent: Intent,
    pub pool: NodePoolRecord,
}

/// Membership changes between the persisted and desired node pools, sorted by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePoolPlan {
    pools: Vec<PlannedNodePool>,
}

impl NodePoolPlan {
    pub fn pools(&self) -> &[PlannedNodePool] {
        &self.pools
    }

    pub fn to_add(&self) -> impl Iterator<Item = &NodePoolRecord> {
        self.with_intent(Intent::Add)
    }

    pub fn to_remove(&self) -> impl Iterator<Item = &NodePoolRecord> {
        self.with_intent(Intent::Remove)
    }

    pub fn kept(&self) -> impl Iterator<Item = &NodePoolRecord> {
        self.with_intent(Intent::Keep)
    }

    fn with_intent(&self, intent: Intent) -> impl Iterator<Item = &NodePoolRecord> {
        self.pools
            .iter()
            .filter(move |p| p.intent == intent)
            .map(|p| &p.pool)
    }

    /// Node pools the cluster should own once the plan is applied.
    pub fn into_records(self) -> Vec<NodePoolRecord> {
        self.pools
            .into_iter()
            .filter(|p| p.intent != Intent::Remove)
            .map(|p| p.pool)
            .collect()
    }
}

/// Diff persisted node pools against the desired set by name.
///
/// Pools only in `desired` are added, pools in both are kept as persisted
/// (only the creator is refreshed) and pools only in `persisted` are marked
/// for removal. A name persisted more than once keeps its first pool; the
/// others are removed. Field-level changes to kept pools are not applied here.
pub fn reconcile_node_pools(
    persisted: &[NodePoolRecord],
    desired: &BTreeMap<String, NodePoolSpec>,
    actor_id: u64,
) -> Result<NodePoolPlan> {
    if desired.is_empty() {
        return Err(Error::EmptyDesiredSet);
    }

    let mut pools = Vec::with_capacity(desired.len() + persisted.len());
    let mut seen = BTreeSet::new();

    for existing in persisted {
        let first = seen.insert(existing.name.as_str());

        let planned = if first && desired.contains_key(&existing.name) {
            PlannedNodePool {
                intent: Intent::Keep,
                pool: NodePoolRecord {
                    created_by: actor_id,
                    ..existing.clone()
                },
            }
        } else {
            PlannedNodePool {
                intent: Intent::Remove,
                pool: existing.clone(),
            }
        };
        pools.push(planned);
    }

    for (name, spec) in desired {
        if seen.contains(name.as_str()) {
            continue;
        }

        pools.push(PlannedNodePool {
            intent: Intent::Add,
            pool: NodePoolRecord {
                id: Uuid::new_v4(),
                external_id: None,
                name: name.clone(),
                size: spec.size.clone(),
                count: spec.count,
                tags: spec.tags.clone(),
                created_by: actor_id,
            },
        });
    }

    pools.sort_by(|a, b| a.pool.name.cmp(&b.pool.name));

    Ok(NodePoolPlan { pools })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(size: &str, count: i32) -> NodePoolSpec {
        NodePoolSpec {
            size: size.to_string(),
            count,
            tags: vec![],
        }
    }

    fn record(name: &str) -> NodePoolRecord {
        NodePoolRecord {
            id: Uuid::new_v4(),
            external_id: Some(format!("np-{name}")),
            name: name.to_string(),
            size: "s-2vcpu-4gb".to_string(),
            count: 2,
            tags: vec![],
            created_by: 1,
        }
    }

    fn names<'a>(pools: impl Iterator<Item = &'a NodePoolRecord>) -> Vec<&'a str> {
        pools.map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn empty_desired_set_is_rejected() {
        assert!(matches!(
            reconcile_node_pools(&[], &BTreeMap::new(), 1),
            Err(Error::EmptyDesiredSet)
        ));
        assert!(matches!(
            reconcile_node_pools(&[record("pool-a")], &BTreeMap::new(), 1),
            Err(Error::EmptyDesiredSet)
        ));
    }

    #[test]
    fn new_pools_are_added_with_spec_fields() {
        let desired = [("pool-a".to_string(), spec("s-1vcpu-2gb", 3))].into();
        let plan = reconcile_node_pools(&[], &desired, 42).unwrap();

        assert_eq!(plan.pools().len(), 1);
        let added = &plan.pools()[0];
        assert_eq!(added.intent, Intent::Add);
        assert_eq!(added.pool.name, "pool-a");
        assert_eq!(added.pool.size, "s-1vcpu-2gb");
        assert_eq!(added.pool.count, 3);
        assert_eq!(added.pool.created_by, 42);
        assert!(added.pool.external_id.is_none());
    }

    #[test]
    fn replaced_pool_yields_one_add_and_one_remove() {
        let persisted = vec![record("pool-a")];
        let desired = [("pool-b".to_string(), spec("s-1vcpu-2gb", 1))].into();

        let plan = reconcile_node_pools(&persisted, &desired, 1).unwrap();

        assert_eq!(plan.pools().len(), 2);
        assert_eq!(names(plan.to_remove()), vec!["pool-a"]);
        assert_eq!(names(plan.to_add()), vec!["pool-b"]);
        assert_eq!(names(plan.into_records().iter()), vec!["pool-b"]);
    }

    #[test]
    fn kept_pools_ignore_field_changes_but_refresh_creator() {
        let existing = record("pool-a");
        let desired = [("pool-a".to_string(), spec("s-8vcpu-16gb", 10))].into();

        let plan = reconcile_node_pools(std::slice::from_ref(&existing), &desired, 99).unwrap();

        let kept: Vec<_> = plan.kept().collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, existing.id);
        assert_eq!(kept[0].external_id, existing.external_id);
        assert_eq!(kept[0].size, "s-2vcpu-4gb");
        assert_eq!(kept[0].count, 2);
        assert_eq!(kept[0].created_by, 99);
    }

    #[test]
    fn counts_match_set_differences() {
        let persisted = vec![record("a"), record("b"), record("c")];
        let desired = [
            ("b".to_string(), spec("s", 1)),
            ("c".to_string(), spec("s", 1)),
            ("d".to_string(), spec("s", 1)),
            ("e".to_string(), spec("s", 1)),
        ]
        .into();

        let plan = reconcile_node_pools(&persisted, &desired, 1).unwrap();

        assert_eq!(plan.to_add().count(), 2);
        assert_eq!(plan.to_remove().count(), 1);
        assert_eq!(plan.kept().count(), 2);
        assert_eq!(plan.pools().len(), 5);
    }

    #[test]
    fn duplicate_persisted_names_are_removed() {
        let first = record("pool-a");
        let duplicate = record("pool-a");
        let desired = [("pool-a".to_string(), spec("s", 1))].into();

        let plan =
            reconcile_node_pools(&[first.clone(), duplicate.clone()], &desired, 1).unwrap();

        let kept: Vec<_> = plan.kept().map(|p| p.id).collect();
        let removed: Vec<_> = plan.to_remove().map(|p| p.id).collect();
        assert_eq!(kept, vec![first.id]);
        assert_eq!(removed, vec![duplicate.id]);
        assert_eq!(plan.to_add().count(), 0);
        assert_eq!(plan.into_records().len(), 1);
    }

    #[test]
    fn output_is_independent_of_persisted_order() {
        let a = record("a");
        let b = record("b");
        let desired = [("a".to_string(), spec("s", 1)), ("z".to_string(), spec("s", 1))].into();

        let forward = reconcile_node_pools(&[a.clone(), b.clone()], &desired, 1).unwrap();
        let backward = reconcile_node_pools(&[b, a], &desired, 1).unwrap();

        let shape = |plan: &NodePoolPlan| -> Vec<(String, Intent)> {
            plan.pools()
                .iter()
                .map(|p| (p.pool.name.clone(), p.intent))
                .collect()
        };
        assert_eq!(shape(&forward), shape(&backward));
        assert_eq!(
            shape(&forward),
            vec![
                ("a".to_string(), Intent::Keep),
                ("b".to_string(), Intent::Remove),
                ("z".to_string(), Intent::Add),
            ]
        );
    }
}
