//! Region metadata: the allowed settings per region and the search space
//! they induce for an alpha.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use sweep_types::{config_error, AlphaDocument, Availability, ParameterValue, SweepResult};
use tracing::{info, warn};

use crate::search::SearchSpace;

/// Neutralization value that is never worth searching.
const NO_NEUTRALIZATION: &str = "NONE";

/// Allowed settings for one region.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegionDomains {
    #[serde(rename = "Universe", alias = "universe")]
    pub universe: Vec<String>,
    #[serde(rename = "Neutralization", alias = "neutralization")]
    pub neutralization: Vec<String>,
    #[serde(rename = "Delay", alias = "delay")]
    pub delay: Vec<i64>,
}

/// Contents of a `regions.json` file, looked up case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RegionMetadata {
    regions: HashMap<String, RegionDomains>,
}

impl RegionMetadata {
    pub fn from_json_str(s: &str) -> SweepResult<Self> {
        let raw: HashMap<String, RegionDomains> = serde_json::from_str(s)?;
        Ok(Self {
            regions: raw
                .into_iter()
                .map(|(name, domains)| (name.to_ascii_uppercase(), domains))
                .collect(),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> SweepResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read {}: {}", path.display(), e))?;
        Self::from_json_str(&text)
    }

    pub fn region(&self, name: &str) -> Option<&RegionDomains> {
        self.regions.get(&name.to_ascii_uppercase())
    }

    /// The settings space searched for `alpha` in its own region:
    /// `delay`, `universe`, `neutralization` and `maxTrade`.
    ///
    /// A delay already set in the alpha is kept as a single-value domain;
    /// `NONE` is never offered as a neutralization.
    pub fn search_space_for(&self, alpha: &AlphaDocument) -> SweepResult<SearchSpace> {
        self.build(alpha, None)
    }

    /// Like [`RegionMetadata::search_space_for`], restricted to the delays
    /// and universes where all of the alpha's data fields are available.
    ///
    /// Delays no field combination covers are dropped and the universe
    /// domain is what every remaining delay shares. When the delays share
    /// no universe, only the delay offering the most universes is kept.
    pub fn search_space_with(
        &self,
        alpha: &AlphaDocument,
        availability: &Availability,
    ) -> SweepResult<SearchSpace> {
        self.build(alpha, Some(availability))
    }

    fn build(
        &self,
        alpha: &AlphaDocument,
        availability: Option<&Availability>,
    ) -> SweepResult<SearchSpace> {
        let region = alpha
            .region()
            .ok_or_else(|| config_error!("alpha settings do not name a region"))?;
        let domains = self
            .region(region)
            .ok_or_else(|| config_error!("no metadata for region '{}'", region))?;

        let delays: Vec<ParameterValue> = match alpha.setting("delay") {
            Some(fixed) => {
                let value = ParameterValue::from_json(fixed)
                    .ok_or_else(|| config_error!("alpha delay {} is not a scalar", fixed))?;
                info!(delay = %value, "delay already set, not searching it");
                vec![value]
            }
            None => domains.delay.iter().copied().map(ParameterValue::from).collect(),
        };
        let (delays, universes) = match availability {
            Some(availability) => narrow(region, delays, &domains.universe, availability)?,
            None => (delays, domains.universe.clone()),
        };

        let neutralizations = domains
            .neutralization
            .iter()
            .filter(|n| n.as_str() != NO_NEUTRALIZATION)
            .cloned();

        SearchSpace::new()
            .add("delay", delays)?
            .add("universe", universes)?
            .add("neutralization", neutralizations)?
            .add("maxTrade", ["ON", "OFF"])
    }

    /// Read `path` and build the search space for `alpha`.
    pub fn load_search_space<P: AsRef<Path>>(
        path: P,
        alpha: &AlphaDocument,
    ) -> SweepResult<SearchSpace> {
        Self::load(path)?.search_space_for(alpha)
    }
}

/// Delays and universes of `region` that `availability` covers.
fn narrow(
    region: &str,
    delays: Vec<ParameterValue>,
    universes: &[String],
    availability: &Availability,
) -> SweepResult<(Vec<ParameterValue>, Vec<String>)> {
    let per_delay: Vec<(ParameterValue, Vec<String>)> = delays
        .into_iter()
        .filter_map(|delay| {
            let ParameterValue::Int(d) = delay else {
                return None;
            };
            let available = availability.universes(region, d)?;
            let allowed: Vec<String> = universes
                .iter()
                .filter(|u| available.contains(*u))
                .cloned()
                .collect();
            (!allowed.is_empty()).then_some((delay, allowed))
        })
        .collect();
    if per_delay.is_empty() {
        return Err(config_error!(
            "the alpha's data fields are not available together in any {} delay and universe",
            region
        ));
    }

    let shared: Vec<String> = universes
        .iter()
        .filter(|u| per_delay.iter().all(|(_, allowed)| allowed.contains(*u)))
        .cloned()
        .collect();
    if !shared.is_empty() {
        let delays = per_delay.into_iter().map(|(d, _)| d).collect();
        return Ok((delays, shared));
    }

    // first delay wins ties
    let Some((delay, allowed)) = per_delay
        .into_iter()
        .rev()
        .max_by_key(|(_, allowed)| allowed.len())
    else {
        return Err(config_error!("no delay left for region {}", region));
    };
    warn!(
        delay = %delay,
        universes = allowed.len(),
        "delays share no universe, searching a single delay"
    );
    Ok((vec![delay], allowed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sweep_types::{DataField, SweepError};

    const REGIONS: &str = r#"{
        "USA": {
            "Universe": ["TOP3000", "TOP1000", "TOP500"],
            "Neutralization": ["NONE", "MARKET", "SECTOR", "INDUSTRY"],
            "Delay": [0, 1]
        },
        "chn": {
            "universe": ["TOP2000U"],
            "neutralization": ["NONE"],
            "delay": [1]
        }
    }"#;

    fn alpha(region: &str, delay: serde_json::Value) -> AlphaDocument {
        AlphaDocument::new(json!({
            "type": "REGULAR",
            "settings": { "region": region, "delay": delay },
            "regular": "liabilities / assets"
        }))
        .unwrap()
    }

    #[test]
    fn builds_space_without_none_neutralization() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        let space = meta.search_space_for(&alpha("USA", json!(null))).unwrap();

        let names: Vec<&str> = space.parameters().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["delay", "universe", "neutralization", "maxTrade"]);
        assert_eq!(space.domain("neutralization").unwrap().len(), 3);
        assert!(!space
            .domain("neutralization")
            .unwrap()
            .contains(&ParameterValue::from("NONE")));
        assert_eq!(space.cardinality(), 2 * 3 * 3 * 2);
    }

    #[test]
    fn fixed_delay_degenerates_to_one_value() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        let space = meta.search_space_for(&alpha("usa", json!(1))).unwrap();
        assert_eq!(space.domain("delay").unwrap(), &[ParameterValue::Int(1)]);
        assert_eq!(space.cardinality(), 3 * 3 * 2);
    }

    #[test]
    fn region_lookup_ignores_case() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        assert!(meta.region("CHN").is_some());
        assert!(meta.region("Usa").is_some());
        assert!(meta.region("EUR").is_none());
    }

    #[test]
    fn only_none_neutralization_is_a_configuration_error() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        let err = meta.search_space_for(&alpha("CHN", json!(null))).unwrap_err();
        assert!(matches!(err, SweepError::Config(_)));
    }

    #[test]
    fn unknown_region_is_a_configuration_error() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        assert!(matches!(
            meta.search_space_for(&alpha("ASI", json!(null))),
            Err(SweepError::Config(_))
        ));
    }

    fn availability(json: serde_json::Value) -> Availability {
        let fields: Vec<DataField> = serde_json::from_value(json).unwrap();
        Availability::common(&fields).unwrap()
    }

    #[test]
    fn field_coverage_narrows_delay_and_universe() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        let coverage = availability(json!([
            {
                "id": "liabilities",
                "data": [
                    { "region": "USA", "delay": 1, "universe": "TOP3000" },
                    { "region": "USA", "delay": 1, "universe": "TOP1000" },
                    { "region": "USA", "delay": 0, "universe": "TOP3000" }
                ]
            },
            {
                "id": "assets",
                "data": [
                    { "region": "USA", "delay": 1, "universe": "TOP3000" },
                    { "region": "USA", "delay": 1, "universe": "TOP1000" },
                    { "region": "USA", "delay": 1, "universe": "TOP500" }
                ]
            }
        ]));

        let space = meta
            .search_space_with(&alpha("USA", json!(null)), &coverage)
            .unwrap();
        assert_eq!(space.domain("delay").unwrap(), &[ParameterValue::Int(1)]);
        assert_eq!(
            space.domain("universe").unwrap(),
            &[ParameterValue::from("TOP3000"), ParameterValue::from("TOP1000")]
        );
        assert_eq!(space.cardinality(), 2 * 3 * 2);
    }

    #[test]
    fn delays_keep_only_shared_universes() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        let coverage = availability(json!([{
            "id": "close",
            "data": [
                { "region": "USA", "delay": 0, "universe": "TOP3000" },
                { "region": "USA", "delay": 1, "universe": "TOP3000" },
                { "region": "USA", "delay": 1, "universe": "TOP500" }
            ]
        }]));
        let space = meta
            .search_space_with(&alpha("USA", json!(null)), &coverage)
            .unwrap();
        assert_eq!(space.domain("delay").unwrap().len(), 2);
        assert_eq!(
            space.domain("universe").unwrap(),
            &[ParameterValue::from("TOP3000")]
        );
    }

    #[test]
    fn disjoint_delays_fall_back_to_the_widest() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        let coverage = availability(json!([{
            "id": "close",
            "data": [
                { "region": "USA", "delay": 0, "universe": "TOP3000" },
                { "region": "USA", "delay": 1, "universe": "TOP1000" },
                { "region": "USA", "delay": 1, "universe": "TOP500" }
            ]
        }]));
        let space = meta
            .search_space_with(&alpha("USA", json!(null)), &coverage)
            .unwrap();
        assert_eq!(space.domain("delay").unwrap(), &[ParameterValue::Int(1)]);
        assert_eq!(space.domain("universe").unwrap().len(), 2);
    }

    #[test]
    fn unavailable_fields_are_a_configuration_error() {
        let meta = RegionMetadata::from_json_str(REGIONS).unwrap();
        let eur_only = availability(json!([{
            "id": "close",
            "data": [{ "region": "EUR", "delay": 1, "universe": "TOP2500" }]
        }]));
        assert!(matches!(
            meta.search_space_with(&alpha("USA", json!(null)), &eur_only),
            Err(SweepError::Config(_))
        ));

        // a fixed delay the fields do not cover leaves nothing either
        let delay_zero = availability(json!([{
            "id": "close",
            "data": [{ "region": "USA", "delay": 0, "universe": "TOP3000" }]
        }]));
        assert!(matches!(
            meta.search_space_with(&alpha("USA", json!(1)), &delay_zero),
            Err(SweepError::Config(_))
        ));
    }
}
