//! Data field coverage: which region, delay and universe combinations a
//! data field can be simulated in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One region/delay/universe triple a field is available in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCoverage {
    pub region: String,
    pub delay: i64,
    pub universe: String,
}

/// A data field as described by the backend's `/data-fields/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataField {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Every combination the field is available in.
    #[serde(default)]
    pub data: Vec<FieldCoverage>,
}

/// Universes available per region and delay. Region names are uppercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    regions: BTreeMap<String, BTreeMap<i64, BTreeSet<String>>>,
}

impl Availability {
    pub fn of(field: &DataField) -> Self {
        let mut regions: BTreeMap<String, BTreeMap<i64, BTreeSet<String>>> = BTreeMap::new();
        for c in &field.data {
            regions
                .entry(c.region.to_ascii_uppercase())
                .or_default()
                .entry(c.delay)
                .or_default()
                .insert(c.universe.clone());
        }
        Self { regions }
    }

    /// Combinations where every one of `fields` is available, or `None`
    /// when there are no fields to restrict by.
    pub fn common(fields: &[DataField]) -> Option<Self> {
        let (first, rest) = fields.split_first()?;
        Some(
            rest.iter()
                .fold(Self::of(first), |acc, field| acc.intersect(&Self::of(field))),
        )
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut regions = BTreeMap::new();
        for (region, delays) in &self.regions {
            let Some(other_delays) = other.regions.get(region) else {
                continue;
            };
            let mut kept = BTreeMap::new();
            for (delay, universes) in delays {
                let Some(other_universes) = other_delays.get(delay) else {
                    continue;
                };
                let both: BTreeSet<String> =
                    universes.intersection(other_universes).cloned().collect();
                if !both.is_empty() {
                    kept.insert(*delay, both);
                }
            }
            if !kept.is_empty() {
                regions.insert(region.clone(), kept);
            }
        }
        Self { regions }
    }

    /// Universes available in `region` at `delay`.
    pub fn universes(&self, region: &str, delay: i64) -> Option<&BTreeSet<String>> {
        self.regions
            .get(&region.to_ascii_uppercase())?
            .get(&delay)
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
