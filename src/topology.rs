//! Which state stores a task has, and which change-log feeds each.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::codec::Serde;
use crate::model::Partition;

/// How to open one logical state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSpec {
    /// Unique within a topology. Also names the store's file.
    pub name: String,
    /// Topic whose partitions carry this store's mutations.
    pub changelog_topic: String,
    #[serde(default)]
    pub key_serde: Serde,
    #[serde(default)]
    pub value_serde: Serde,
    /// Non-persistent stores live in memory and are rebuilt from the
    /// change-log on every start.
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_persistent() -> bool {
    true
}

impl StoreSpec {
    pub fn new(name: impl Into<String>, changelog_topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            changelog_topic: changelog_topic.into(),
            key_serde: Serde::default(),
            value_serde: Serde::default(),
            persistent: true,
        }
    }

    pub fn with_serdes(mut self, key_serde: Serde, value_serde: Serde) -> Self {
        self.key_serde = key_serde;
        self.value_serde = value_serde;
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.persistent = false;
        self
    }
}

/// The state stores of a task's processing topology.
///
/// Only the store-to-change-log binding matters here; the transform
/// graph that writes to those stores runs elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StoreSpec>", into = "Vec<StoreSpec>")]
pub struct Topology {
    stores: Vec<StoreSpec>,
}

impl Topology {
    pub fn new(stores: Vec<StoreSpec>) -> Result<Self, String> {
        let mut by_name = BTreeMap::new();
        let mut by_topic = BTreeMap::new();
        for spec in &stores {
            if let Some(prev) = by_name.insert(spec.name.as_str(), spec) {
                return Err(format!("store name {:?} used twice", prev.name));
            }
            if let Some(prev) = by_topic.insert(spec.changelog_topic.as_str(), spec) {
                return Err(format!(
                    "change-log topic {:?} feeds both {:?} and {:?}",
                    spec.changelog_topic, prev.name, spec.name
                ));
            }
        }
        Ok(Self { stores })
    }

    pub fn stores(&self) -> &[StoreSpec] {
        &self.stores
    }

    /// The store a change-log partition writes into.
    pub fn store_for(&self, partition: &Partition) -> Option<&StoreSpec> {
        self.stores
            .iter()
            .find(|spec| spec.changelog_topic == partition.topic)
    }

    /// Bind each partition to its store.
    ///
    /// Several partitions of the same change-log topic all bind to
    /// that topic's single store. Returns the first partition without
    /// a store as the error.
    pub fn bind<'a>(
        &self,
        partitions: impl IntoIterator<Item = &'a Partition>,
    ) -> Result<BTreeMap<Partition, &StoreSpec>, Partition> {
        partitions
            .into_iter()
            .map(|part| match self.store_for(part) {
                Some(spec) => Ok((part.clone(), spec)),
                None => Err(part.clone()),
            })
            .collect()
    }
}

impl TryFrom<Vec<StoreSpec>> for Topology {
    type Error = String;

    fn try_from(stores: Vec<StoreSpec>) -> Result<Self, Self::Error> {
        Self::new(stores)
    }
}

impl From<Topology> for Vec<StoreSpec> {
    fn from(topo: Topology) -> Self {
        topo.stores
    }
}

#[test]
fn bind_co_partitions_into_one_store() {
    let topo = Topology::new(vec![
        StoreSpec::new("counts", "counts-changelog"),
        StoreSpec::new("totals", "totals-changelog"),
    ])
    .unwrap();
    let parts = [
        Partition::new("counts-changelog", 0),
        Partition::new("counts-changelog", 3),
        Partition::new("totals-changelog", 0),
    ];

    let found = topo.bind(parts.iter()).unwrap();
    let names: Vec<_> = found.values().map(|spec| spec.name.as_str()).collect();
    assert_eq!(names, vec!["counts", "counts", "totals"]);
}

#[test]
fn bind_reports_unknown_partition() {
    let topo = Topology::new(vec![StoreSpec::new("counts", "counts-changelog")]).unwrap();
    let parts = [Partition::new("nope", 1)];
    assert_eq!(topo.bind(parts.iter()), Err(Partition::new("nope", 1)));
}

#[test]
fn new_rejects_duplicates() {
    assert!(Topology::new(vec![
        StoreSpec::new("counts", "a"),
        StoreSpec::new("counts", "b"),
    ])
    .is_err());
    assert!(Topology::new(vec![StoreSpec::new("x", "a"), StoreSpec::new("y", "a")]).is_err());
}

#[test]
fn spec_defaults_when_deserialized() {
    let found: StoreSpec =
        serde_json::from_str(r#"{"name": "counts", "changelog_topic": "counts-changelog"}"#)
            .unwrap();
    assert_eq!(found, StoreSpec::new("counts", "counts-changelog"));
}

#[test]
fn topology_validates_when_deserialized() {
    let res: Result<Topology, _> = serde_json::from_str(
        r#"[{"name": "a", "changelog_topic": "t"}, {"name": "b", "changelog_topic": "t"}]"#,
    );
    assert!(res.is_err());
}
