//! Fractional community membership

use crate::error::ModSoftError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance on the sum of probabilities
const SUM_TOLERANCE: f64 = 1e-6;

/// Mass below which a community entry is dropped
const NEGLIGIBLE_MASS: f64 = 1e-9;

/// Probability of membership per community id
///
/// Always non-empty, every probability lies in [0, 1] and the probabilities
/// sum to one. Entries iterate in community id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct CommunityDistribution(BTreeMap<String, f64>);

impl CommunityDistribution {
    /// Validate `probabilities` and renormalize away rounding drift
    pub fn new(probabilities: BTreeMap<String, f64>) -> Result<Self, ModSoftError> {
        if probabilities.is_empty() {
            return Err(ModSoftError::InvalidDistribution(
                "distribution has no communities".to_string(),
            ));
        }
        if let Some((id, p)) = probabilities
            .iter()
            .find(|(_, p)| !p.is_finite() || **p < 0.0 || **p > 1.0 + SUM_TOLERANCE)
        {
            return Err(ModSoftError::InvalidDistribution(format!(
                "probability {} for community {} is out of range",
                p, id
            )));
        }
        let sum: f64 = probabilities.values().sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            return Err(ModSoftError::InvalidDistribution(format!(
                "probabilities sum to {}, expected 1",
                sum
            )));
        }
        Ok(Self::normalized(probabilities))
    }

    /// Full membership in a single community
    pub fn singleton(community: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(community.into(), 1.0);
        Self(map)
    }

    fn normalized(mut map: BTreeMap<String, f64>) -> Self {
        map.retain(|_, p| *p > NEGLIGIBLE_MASS);
        let sum: f64 = map.values().sum();
        for p in map.values_mut() {
            *p /= sum;
        }
        Self(map)
    }

    pub fn probability(&self, community: &str) -> f64 {
        self.0.get(community).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(id, p)| (id.as_str(), *p))
    }

    pub fn communities(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Community with the highest probability, lowest id on ties
    pub fn dominant(&self) -> (&str, f64) {
        let mut best: Option<(&str, f64)> = None;
        for (id, p) in self.iter() {
            match best {
                Some((_, best_p)) if p <= best_p => {}
                _ => best = Some((id, p)),
            }
        }
        // Non-empty by construction
        best.unwrap_or(("", 0.0))
    }

    /// Probability that two services land in the same community
    pub fn overlap(&self, other: &CommunityDistribution) -> f64 {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small
            .iter()
            .map(|(id, p)| p * large.probability(id))
            .sum()
    }

    /// Move a fraction `alpha` of all membership mass into `community`
    ///
    /// `alpha` is clamped to [0, 1]; an alpha of one yields a singleton.
    pub fn blend_toward(&self, community: &str, alpha: f64) -> Self {
        let alpha = alpha.clamp(0.0, 1.0);
        let mut map: BTreeMap<String, f64> = self
            .0
            .iter()
            .map(|(id, p)| (id.clone(), p * (1.0 - alpha)))
            .collect();
        *map.entry(community.to_string()).or_insert(0.0) += alpha;
        Self::normalized(map)
    }
}

impl TryFrom<BTreeMap<String, f64>> for CommunityDistribution {
    type Error = ModSoftError;

    fn try_from(map: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        Self::new(map)
    }
}

impl From<CommunityDistribution> for BTreeMap<String, f64> {
    fn from(dist: CommunityDistribution) -> Self {
        dist.0
    }
}
