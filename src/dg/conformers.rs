//! Conformer generation driver
//!
//! Ties distance modeling, metrization, embedding and refinement together
//! into ensemble generation. Conformer slots are independent and run in
//! parallel; each slot derives its own random engine from the caller's
//! seed so results are reproducible regardless of scheduling.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dg::modeling::{self, ModelingError, SpatialModel};
use crate::dg::refinement::{self, RefinementConfig, RefinementError};
use crate::dg::{BoundsError, DistanceMatrix, MetricMatrix, Partiality};
use crate::molecule::{AtomIndex, Molecule, PositionCollection};

extern crate nalgebra as na;

/// Ensemble generation options
#[derive(Clone)]
pub struct Configuration {
    /// How many atoms' pairs are re-smoothed during metrization
    pub partiality: Partiality,
    pub refinement: RefinementConfig,
    /// Tolerated ratio of failed attempts to requested conformers before
    /// the whole ensemble is abandoned
    pub failure_ratio: f64,
    /// Atoms pinned to known positions, constraining their mutual
    /// distances exactly
    pub fixed_positions: Vec<(AtomIndex, na::Vector3<f64>)>,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            partiality: Partiality::FourAtom,
            refinement: RefinementConfig::default(),
            failure_ratio: 2.0,
            fixed_positions: Vec::new(),
        }
    }
}

/// Failure of a single conformer slot after its retries are exhausted
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationFailure {
    #[error("distance bounds inconsistent under the attempt's assignments: {0}")]
    Bounds(#[from] ModelingError),
    #[error("metrization made the remaining bounds inconsistent: {0}")]
    Metrization(BoundsError),
    #[error("refinement failed: {0}")]
    Refinement(#[from] RefinementError),
    #[error("shared failure budget exhausted before this slot completed")]
    BudgetExhausted,
}

/// Whole-run failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("zero conformers requested")]
    ZeroStructures,
    #[error("failure ratio must be positive")]
    NonPositiveFailureRatio,
    #[error(transparent)]
    Modeling(#[from] ModelingError),
    #[error(transparent)]
    Generation(#[from] GenerationFailure),
    #[error("{failures} attempts failed generating {requested} conformers, exceeding the tolerated ratio")]
    TooManyFailures { failures: usize, requested: usize },
}

fn attempt<R: rand::Rng + ?Sized>(
    model: &SpatialModel,
    config: &Configuration,
    rng: &mut R,
) -> Result<PositionCollection, GenerationFailure> {
    let distances =
        DistanceMatrix::try_from_distance_bounds(model.bounds.clone(), config.partiality, rng)
            .map_err(GenerationFailure::Metrization)?;
    let coordinates = MetricMatrix::from_distance_matrix(distances).embed();
    let refined = refinement::refine(model.constraints(), coordinates, &config.refinement)?;
    Ok(refined.coords)
}

/// Generate one conformer slot, retrying failed attempts against the
/// shared failure budget
fn generate_slot(
    molecule: &Molecule,
    cached_model: Option<&SpatialModel>,
    config: &Configuration,
    rng: &mut StdRng,
    failures: &AtomicUsize,
    budget: usize,
) -> Result<PositionCollection, GenerationFailure> {
    loop {
        if failures.load(Ordering::Relaxed) > budget {
            return Err(GenerationFailure::BudgetExhausted);
        }

        let outcome = match cached_model {
            Some(model) => attempt(model, config, rng),
            None => {
                // Unassigned stereopermutators draw fresh assignments and
                // therefore fresh bounds every attempt
                let mut assigned = molecule.clone();
                assigned.assign_unassigned(rng);
                match SpatialModel::from_molecule(&assigned, &config.fixed_positions) {
                    Ok(model) => attempt(&model, config, rng),
                    Err(error) => Err(GenerationFailure::Bounds(error)),
                }
            }
        };

        match outcome {
            Ok(positions) => return Ok(positions),
            Err(failure) => {
                failures.fetch_add(1, Ordering::Relaxed);
                debug!(%failure, "conformer attempt failed");

                // With fully assigned stereo the model is deterministic,
                // so an inconsistency cannot be retried away
                if matches!(failure, GenerationFailure::Bounds(_)) && cached_model.is_some() {
                    return Err(failure);
                }
            }
        }
    }
}

/// Generate an ensemble of conformers
///
/// Always yields one entry per requested conformer, successful or not.
/// Errors as a whole only on configuration problems, on modeling failure
/// of a fully assigned molecule, or when the failed-attempt budget implied
/// by [`Configuration::failure_ratio`] is exceeded.
pub fn generate_ensemble(
    molecule: &Molecule,
    num_structures: usize,
    config: &Configuration,
    seed: u64,
) -> Result<Vec<Result<PositionCollection, GenerationFailure>>, Error> {
    if num_structures == 0 {
        return Err(Error::ZeroStructures);
    }
    if !(config.failure_ratio > 0.0) {
        return Err(Error::NonPositiveFailureRatio);
    }

    // A bad fixed position set is independent of stereo assignments and
    // would fail every attempt identically, so reject it before any slot
    // runs
    modeling::validate_fixed_positions(molecule, &config.fixed_positions)?;

    // Bounds and constraints are reusable across attempts only when no
    // stereopermutator needs per-attempt assignment
    let cached_model = molecule
        .fully_assigned()
        .then(|| SpatialModel::from_molecule(molecule, &config.fixed_positions))
        .transpose()?;

    let budget = (config.failure_ratio * num_structures as f64).ceil() as usize;
    let failures = AtomicUsize::new(0);

    let ensemble: Vec<Result<PositionCollection, GenerationFailure>> = (0..num_structures)
        .into_par_iter()
        .map(|slot| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(slot as u64));
            generate_slot(
                molecule,
                cached_model.as_ref(),
                config,
                &mut rng,
                &failures,
                budget,
            )
        })
        .collect();

    let failure_count = failures.load(Ordering::Relaxed);
    if failure_count > budget {
        warn!(failure_count, budget, "ensemble generation abandoned");
        return Err(Error::TooManyFailures {
            failures: failure_count,
            requested: num_structures,
        });
    }

    Ok(ensemble)
}

/// Generate a single conformer
pub fn generate_conformation(
    molecule: &Molecule,
    config: &Configuration,
    seed: u64,
) -> Result<PositionCollection, Error> {
    let mut ensemble = generate_ensemble(molecule, 1, config, seed)?;
    Ok(ensemble
        .pop()
        .expect("Ensemble of one has an element")?)
}
