//! Search space definitions and candidate sources.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;
use sweep_types::{config_error, ConfigKey, Configuration, ParameterValue, SweepResult, Trial, TrialState};

/// A single parameter dimension: a name and its finite, ordered domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterDef {
    pub name: String,
    pub values: Vec<ParameterValue>,
}

impl ParameterDef {
    fn index_of(&self, value: &ParameterValue) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }
}

/// The full search space: an ordered list of parameter domains.
///
/// Every domain is non-empty. A parameter whose value is fixed elsewhere
/// stays in the space with a single-value domain. Only [`SearchSpace::add`]
/// builds one, so it is serialized for logs but never deserialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchSpace {
    parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<V: Into<ParameterValue>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> SweepResult<Self> {
        let name = name.into();
        if self.parameters.iter().any(|p| p.name == name) {
            return Err(config_error!("parameter '{}' declared twice", name));
        }
        let mut domain: Vec<ParameterValue> = Vec::new();
        for value in values.into_iter().map(Into::into) {
            if !domain.contains(&value) {
                domain.push(value);
            }
        }
        if domain.is_empty() {
            return Err(config_error!("parameter '{}' has an empty domain", name));
        }
        self.parameters.push(ParameterDef {
            name,
            values: domain,
        });
        Ok(self)
    }

    pub fn fixed(self, name: impl Into<String>, value: impl Into<ParameterValue>) -> SweepResult<Self> {
        self.add(name, [value.into()])
    }

    pub fn parameters(&self) -> &[ParameterDef] {
        &self.parameters
    }

    pub fn domain(&self, name: &str) -> Option<&[ParameterValue]> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.values.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Product of all domain sizes, saturating at `usize::MAX`.
    pub fn cardinality(&self) -> usize {
        self.parameters
            .iter()
            .fold(1usize, |acc, p| acc.saturating_mul(p.values.len()))
    }

    /// Every point of the cartesian product exactly once, first parameter
    /// varying slowest. Each call starts again from the first point.
    pub fn enumerate(&self) -> Enumeration {
        Enumeration {
            space: self.clone(),
            cursor: Some(vec![0; self.parameters.len()]),
        }
    }

    /// One uniformly drawn point.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Configuration {
        Configuration::from_pairs(self.parameters.iter().map(|p| {
            let idx = rng.random_range(0..p.values.len());
            (p.name.clone(), p.values[idx].clone())
        }))
    }

    /// True when `configuration` names exactly this space's parameters and
    /// every value lies in its domain.
    pub fn contains(&self, configuration: &Configuration) -> bool {
        configuration.len() == self.parameters.len()
            && self.parameters.iter().all(|p| {
                configuration
                    .get(&p.name)
                    .is_some_and(|v| p.index_of(v).is_some())
            })
    }

    fn point(&self, indices: &[usize]) -> Configuration {
        Configuration::from_pairs(
            self.parameters
                .iter()
                .zip(indices)
                .map(|(p, &i)| (p.name.clone(), p.values[i].clone())),
        )
    }
}

/// Lazy cartesian-product iterator returned by [`SearchSpace::enumerate`].
#[derive(Debug, Clone)]
pub struct Enumeration {
    space: SearchSpace,
    cursor: Option<Vec<usize>>,
}

impl Iterator for Enumeration {
    type Item = Configuration;

    fn next(&mut self) -> Option<Configuration> {
        let indices = self.cursor.as_mut()?;
        let point = self.space.point(indices);

        // Odometer step: bump the last digit, carrying leftwards.
        let mut advanced = false;
        for (digit, param) in indices.iter_mut().zip(&self.space.parameters).rev() {
            *digit += 1;
            if *digit < param.values.len() {
                advanced = true;
                break;
            }
            *digit = 0;
        }
        if !advanced {
            self.cursor = None;
        }
        Some(point)
    }
}

// ---------------------------------------------------------------------------
// Candidate sources
// ---------------------------------------------------------------------------

/// Produces candidate configurations for the orchestrator.
///
/// Sources never see claims; refusing duplicates is the orchestrator's job.
pub trait CandidateSource: Send {
    /// The next candidate, or `None` once the source has nothing more.
    /// `history` holds the ledger's trials when [`Self::observes_history`]
    /// is true and is empty otherwise.
    fn propose(&mut self, history: &[Trial]) -> Option<Configuration>;

    /// Exhaustive sources end by themselves; stochastic ones are stopped
    /// by the orchestrator.
    fn is_exhaustive(&self) -> bool {
        false
    }

    fn observes_history(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

// ---- Grid ----

/// Exhaustive grid over the whole space.
#[derive(Debug, Clone)]
pub struct GridSource {
    points: Enumeration,
}

impl GridSource {
    pub fn new(space: &SearchSpace) -> Self {
        Self {
            points: space.enumerate(),
        }
    }
}

impl CandidateSource for GridSource {
    fn propose(&mut self, _history: &[Trial]) -> Option<Configuration> {
        self.points.next()
    }

    fn is_exhaustive(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "grid"
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

// ---- Random ----

/// Independent uniform draws across the space.
#[derive(Debug, Clone)]
pub struct RandomSource {
    space: SearchSpace,
    rng: StdRng,
}

impl RandomSource {
    pub fn new(space: SearchSpace, seed: Option<u64>) -> Self {
        Self {
            space,
            rng: seeded_rng(seed),
        }
    }
}

impl CandidateSource for RandomSource {
    fn propose(&mut self, _history: &[Trial]) -> Option<Configuration> {
        Some(self.space.sample(&mut self.rng))
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- TPE ----

/// Categorical tree-structured Parzen estimator.
///
/// Completed trials are split into a good and a bad group by objective;
/// each parameter gets a Laplace-smoothed frequency model per group and the
/// candidate with the highest `l(x) / g(x)` among `n_candidates` draws from
/// the good model is proposed. Draws already present in the history are
/// skipped. Pending and running trials count as bad so that concurrent
/// workers spread out.
#[derive(Debug, Clone)]
pub struct TpeSource {
    space: SearchSpace,
    rng: StdRng,
    /// Random proposals until this many trials have succeeded.
    pub n_startup: usize,
    pub n_candidates: usize,
    /// Fraction of completed trials placed in the good group, capped at
    /// `max_good`.
    pub gamma: f64,
    pub max_good: usize,
}

impl TpeSource {
    pub fn new(space: SearchSpace, seed: Option<u64>) -> Self {
        Self {
            space,
            rng: seeded_rng(seed),
            n_startup: 10,
            n_candidates: 24,
            gamma: 0.1,
            max_good: 25,
        }
    }

    /// Per-parameter value weights: one pseudo-count for every value plus
    /// one for each observation.
    fn weights(&self, group: &[&Configuration]) -> Vec<Vec<f64>> {
        self.space
            .parameters
            .iter()
            .map(|p| {
                let mut counts = vec![1.0; p.values.len()];
                for configuration in group {
                    if let Some(i) = configuration.get(&p.name).and_then(|v| p.index_of(v)) {
                        counts[i] += 1.0;
                    }
                }
                let total: f64 = counts.iter().sum();
                counts.into_iter().map(|c| c / total).collect()
            })
            .collect()
    }

    fn draw(&mut self, weights: &[f64]) -> usize {
        match WeightedIndex::new(weights) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => self.rng.random_range(0..weights.len()),
        }
    }
}

impl CandidateSource for TpeSource {
    fn propose(&mut self, history: &[Trial]) -> Option<Configuration> {
        let mut completed: Vec<(&Configuration, f64)> = history
            .iter()
            .filter(|t| t.state == TrialState::Succeeded)
            .filter_map(|t| t.objective.map(|o| (&t.configuration, o)))
            .filter(|(c, o)| o.is_finite() && self.space.contains(c))
            .collect();

        if completed.len() < self.n_startup.max(1) {
            return Some(self.space.sample(&mut self.rng));
        }

        completed.sort_by(|a, b| b.1.total_cmp(&a.1));
        let n_good = ((self.gamma * completed.len() as f64).ceil() as usize)
            .clamp(1, self.max_good.max(1))
            .min(completed.len());

        let good: Vec<&Configuration> = completed[..n_good].iter().map(|(c, _)| *c).collect();
        let bad: Vec<&Configuration> = completed[n_good..]
            .iter()
            .map(|(c, _)| *c)
            .chain(
                history
                    .iter()
                    .filter(|t| t.state.is_active())
                    .map(|t| &t.configuration),
            )
            .collect();

        let l = self.weights(&good);
        let g = self.weights(&bad);
        let tried: HashSet<ConfigKey> = history.iter().map(|t| t.configuration.key()).collect();

        let mut best: Option<(Vec<usize>, f64)> = None;
        for _ in 0..self.n_candidates.max(1) {
            let indices: Vec<usize> = l.iter().map(|w| self.draw(w)).collect();
            if tried.contains(&self.space.point(&indices).key()) {
                continue;
            }
            let score: f64 = indices
                .iter()
                .enumerate()
                .map(|(param, &i)| l[param][i].ln() - g[param][i].ln())
                .sum();
            if best.as_ref().is_none_or(|(_, s)| score > *s) {
                best = Some((indices, score));
            }
        }
        // every draw was already tried
        Some(match best {
            Some((indices, _)) => self.space.point(&indices),
            None => self.space.sample(&mut self.rng),
        })
    }

    fn observes_history(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "tpe"
    }
}
