//! Staged quasi-Newton refinement of embedded coordinates
//!
//! The error functional is a sum of independently switchable terms: pairwise
//! distance bound violations, chiral (signed volume) violations, dihedral
//! interval violations and a fourth-dimension compression penalty. Which
//! terms contribute is decided by an explicit [`Stage`] rather than mutable
//! flags inside a monolithic gradient function.

use thiserror::Error;
use tracing::trace;

use crate::dg::{DistanceBounds, DIMENSIONS};

extern crate nalgebra as na;

type Vector3 = na::Vector3<f64>;
type Vector4 = na::Vector4<f64>;
type DVector = na::DVector<f64>;
type Matrix4N = na::Matrix4xX<f64>;
type VectorView3<'a> =
    na::Matrix<f64, na::Const<3>, na::Const<1>, na::ViewStorage<'a, f64, na::Const<3>, na::Const<1>, na::Const<1>, na::Dyn>>;
type VectorView4<'a> =
    na::Matrix<f64, na::Const<4>, na::Const<1>, na::ViewStorage<'a, f64, na::Const<4>, na::Const<1>, na::Const<1>, na::Dyn>>;
type VectorViewMut3<'a> =
    na::Matrix<f64, na::Const<3>, na::Const<1>, na::ViewStorageMut<'a, f64, na::Const<3>, na::Const<1>, na::Const<1>, na::Dyn>>;
type VectorViewMut4<'a> =
    na::Matrix<f64, na::Const<4>, na::Const<1>, na::ViewStorageMut<'a, f64, na::Const<4>, na::Const<1>, na::Const<1>, na::Dyn>>;

use argmin::core::{Executor, IterState, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;

/// Iterator over the strict upper triangle index pairs of an N×N matrix
pub struct StrictUpperTriangleIndices {
    pub n: usize,
    pub indices: Option<(usize, usize)>,
}

impl StrictUpperTriangleIndices {
    pub fn new(n: usize) -> StrictUpperTriangleIndices {
        let indices = (n > 1).then_some((0, 1));
        StrictUpperTriangleIndices { n, indices }
    }

    pub fn increment(&mut self) {
        self.indices = match self.indices {
            Some((mut i, mut j)) => {
                j += 1;

                let mut incomplete = true;
                if j == self.n {
                    i += 1;
                    j = i + 1;
                    if j == self.n {
                        incomplete = false;
                    }
                }

                incomplete.then_some((i, j))
            }
            None => None,
        };
    }

    pub fn total_len(&self) -> usize {
        (self.n.pow(2) - self.n) / 2
    }

    pub fn linear_index(&self) -> usize {
        if let Some((i, j)) = self.indices {
            // valid indices and n > 1
            debug_assert!(i < j);
            i * (self.n - 1) - i * (i.wrapping_sub(1)) / 2 + j - 1
        } else {
            self.total_len()
        }
    }
}

impl Iterator for StrictUpperTriangleIndices {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.indices;
        self.increment();
        indices
    }
}

impl ExactSizeIterator for StrictUpperTriangleIndices {
    fn len(&self) -> usize {
        self.total_len() - self.linear_index()
    }
}

fn four(line: &DVector, index: usize) -> VectorView4 {
    line.fixed_view::<4, 1>(DIMENSIONS * index, 0)
}

fn four_mut(line: &mut DVector, index: usize) -> VectorViewMut4 {
    line.fixed_view_mut::<4, 1>(DIMENSIONS * index, 0)
}

fn three(line: &DVector, index: usize) -> VectorView3 {
    line.fixed_view::<3, 1>(DIMENSIONS * index, 0)
}

fn three_mut(line: &mut DVector, index: usize) -> VectorViewMut3 {
    line.fixed_view_mut::<3, 1>(DIMENSIONS * index, 0)
}

/// Averaged spatial position of a site group
fn site_three(line: &DVector, site: &[usize]) -> Vector3 {
    if let [single] = site {
        return three(line, *single).into();
    }

    let sum = site
        .iter()
        .fold(na::Vector3::zeros(), |acc, &index| acc + three(line, index));
    sum / site.len() as f64
}

/// Flip handedness by negating every y coordinate
pub fn negate_y_coordinates(line: &mut DVector) {
    let n = line.len() / DIMENSIONS;
    line.view_with_steps_mut((1, 0), (n, 1), (DIMENSIONS - 1, 0))
        .neg_mut();
}

/// Polyfill for array::each_ref while awaiting stabilization, see
/// https://github.com/rust-lang/rust/issues/76118
fn array_of_ref<T, const N: usize>(arr: &[T; N]) -> [&T; N] {
    use core::mem::MaybeUninit;
    let mut out: MaybeUninit<[&T; N]> = MaybeUninit::uninit();

    let buf = out.as_mut_ptr() as *mut &T;
    let mut refs = arr.iter();

    for i in 0..N {
        unsafe { buf.add(i).write(refs.next().unwrap()) }
    }

    unsafe { out.assume_init() }
}

#[derive(PartialEq, Debug)]
struct DistanceBoundGradient(Vector4);

/// Squared distance interval between one atom pair
#[derive(Clone, Debug)]
pub struct DistanceBound {
    pub indices: (usize, usize),
    pub square_bounds: (f64, f64),
}

impl DistanceBound {
    pub fn error(&self, positions: &DVector) -> f64 {
        let (lower_squared, upper_squared) = &self.square_bounds;
        debug_assert!(lower_squared <= upper_squared);
        let (i, j) = self.indices;

        let diff = four(positions, i) - four(positions, j);
        let square_distance = diff.norm_squared();

        let upper_term = square_distance / upper_squared - 1.0;
        if upper_term > 0.0 {
            return upper_term.powi(2);
        }

        let quotient = lower_squared + square_distance;
        let lower_term = 2.0 * lower_squared / quotient - 1.0;
        if lower_term > 0.0 {
            return lower_term.powi(2);
        }

        0.0
    }

    fn gradient(&self, positions: &DVector) -> Option<DistanceBoundGradient> {
        let (lower_squared, upper_squared) = &self.square_bounds;
        debug_assert!(lower_squared <= upper_squared);
        let (i, j) = self.indices;

        let diff = four(positions, i) - four(positions, j);
        let square_distance = diff.norm_squared();

        let upper_term = square_distance / upper_squared - 1.0;
        if upper_term > 0.0 {
            let grad = (4.0 * upper_term / upper_squared) * diff;
            return Some(DistanceBoundGradient(grad));
        }

        let quotient = lower_squared + square_distance;
        let lower_term = 2.0 * lower_squared / quotient - 1.0;
        if lower_term > 0.0 {
            let grad = (-8.0 * lower_squared * lower_term / quotient.powi(2)) * diff;
            return Some(DistanceBoundGradient(grad));
        }

        None
    }

    /// Distance between the pair, ignoring the fourth dimension
    fn spatial_distance(&self, positions: &DVector) -> f64 {
        let (i, j) = self.indices;
        (three(positions, i) - three(positions, j)).norm()
    }
}

impl DistanceBoundGradient {
    fn incorporate_into(self, gradient: &mut DVector, indices: (usize, usize)) {
        {
            let mut part = four_mut(gradient, indices.0);
            part += self.0;
        }
        {
            let mut part = four_mut(gradient, indices.1);
            part -= self.0;
        }
    }
}

struct ChiralGradient(na::Matrix3x4<f64>);

/// Target signed volume interval over four site groups
#[derive(Clone, Debug)]
pub struct Chiral {
    pub sites: [Vec<usize>; 4],
    /// Sextupled tetrahedron volume interval, shared sign by construction
    pub adjusted_volume_bounds: (f64, f64),
    pub weight: f64,
}

impl Chiral {
    fn adjusted_volume(&self, positions: &DVector) -> f64 {
        let [alpha, beta, gamma, delta] =
            array_of_ref(&self.sites).map(|site| site_three(positions, site));

        (alpha - &delta).dot(&(beta - &delta).cross(&(gamma - &delta)))
    }

    pub fn target_volume_is_zero(&self) -> bool {
        let (lower, upper) = self.adjusted_volume_bounds;
        (lower + upper).abs() < 1e-4
    }

    pub fn expects_positive_volume(&self) -> bool {
        let (lower, upper) = self.adjusted_volume_bounds;
        lower + upper > 0.0
    }

    pub fn volume_positive(&self, positions: &DVector) -> bool {
        self.adjusted_volume(positions) >= 0.0
    }

    /// Whether the current volume sign matches the target sign
    pub fn sign_correct(&self, positions: &DVector) -> bool {
        self.volume_positive(positions) == self.expects_positive_volume()
    }

    pub fn error(&self, positions: &DVector) -> f64 {
        let (lower, upper) = self.adjusted_volume_bounds;
        let adjusted_volume = self.adjusted_volume(positions);

        let term;
        if adjusted_volume < lower {
            term = self.weight * (lower - adjusted_volume);
        } else if adjusted_volume > upper {
            term = self.weight * (adjusted_volume - upper);
        } else {
            return 0.0;
        }

        term * term
    }

    fn gradient(&self, positions: &DVector) -> Option<ChiralGradient> {
        let (lower, upper) = self.adjusted_volume_bounds;
        let [alpha, beta, gamma, delta] =
            array_of_ref(&self.sites).map(|site| site_three(positions, site));

        let alpha_minus_delta = &alpha - &delta;
        let beta_minus_delta = &beta - &delta;
        let gamma_minus_delta = &gamma - &delta;

        let adjusted_volume =
            alpha_minus_delta.dot(&beta_minus_delta.cross(&gamma_minus_delta));

        let term;
        if adjusted_volume < lower {
            term = self.weight * (adjusted_volume - lower);
        } else if adjusted_volume > upper {
            term = self.weight * (adjusted_volume - upper);
        } else {
            return None;
        }

        let factor = 2.0 * self.weight * term;
        debug_assert!(factor != 0.0);

        let alpha_minus_gamma = &alpha - &gamma;
        let beta_minus_gamma = &beta - &gamma;

        let v_pairs = [
            (&beta_minus_delta, &gamma_minus_delta),
            (&gamma_minus_delta, &alpha_minus_delta),
            (&alpha_minus_delta, &beta_minus_delta),
            (&beta_minus_gamma, &alpha_minus_gamma),
        ];

        let mat = {
            let mut m = na::Matrix3x4::<f64>::from_columns(&v_pairs.map(|(a, b)| a.cross(b)));
            m.column_iter_mut()
                .zip(self.sites.iter())
                .for_each(|(mut c, site)| c *= factor / site.len() as f64);
            m
        };

        Some(ChiralGradient(mat))
    }
}

impl ChiralGradient {
    fn incorporate_into(self, gradient: &mut DVector, sites: &[Vec<usize>; 4]) {
        for (column, site) in self.0.column_iter().zip(sites.iter()) {
            for &i in site.iter() {
                let mut part = three_mut(gradient, i);
                part += column;
            }
        }
    }
}

struct DihedralGradient(na::Matrix3x4<f64>);

/// Target dihedral angle interval over a four site group sequence
#[derive(Clone, Debug)]
pub struct Dihedral {
    pub sites: [Vec<usize>; 4],
    /// Closed angle interval in radians, `lower <= upper`
    pub angle_bounds: (f64, f64),
}

impl Dihedral {
    fn mean_and_half_width(&self) -> (f64, f64) {
        let (lower, upper) = self.angle_bounds;
        debug_assert!(lower <= upper);
        ((lower + upper) / 2.0, (upper - lower) / 2.0)
    }

    fn angle(&self, positions: &DVector) -> f64 {
        let [alpha, beta, gamma, delta] =
            array_of_ref(&self.sites).map(|site| site_three(positions, site));
        crate::geometry::dihedral(&alpha, &beta, &gamma, &delta)
    }

    /// Wrapped deviation beyond the interval half-width, zero inside
    fn violation(&self, positions: &DVector) -> f64 {
        let (mean, half_width) = self.mean_and_half_width();
        let delta = crate::geometry::signed_angle_difference(self.angle(positions), mean);
        (delta.abs() - half_width).max(0.0) * delta.signum()
    }

    pub fn error(&self, positions: &DVector) -> f64 {
        self.violation(positions).powi(2)
    }

    fn gradient(&self, positions: &DVector) -> Option<DihedralGradient> {
        let violation = self.violation(positions);
        if violation == 0.0 {
            return None;
        }

        let [alpha, beta, gamma, delta] =
            array_of_ref(&self.sites).map(|site| site_three(positions, site));

        let f = alpha - &beta;
        let g = beta - &gamma;
        let h = delta - &gamma;

        let a = f.cross(&g);
        let b = h.cross(&g);

        let g_norm = g.norm();
        let a_norm_sq = a.norm_squared();
        let b_norm_sq = b.norm_squared();
        if a_norm_sq < 1e-12 || b_norm_sq < 1e-12 || g_norm < 1e-6 {
            // Degenerate chain, no useful direction
            return None;
        }

        let f_dot_g = f.dot(&g);
        let h_dot_g = h.dot(&g);

        // Derivatives of the dihedral angle with respect to the four
        // sequence positions
        let d_alpha = (g_norm / a_norm_sq) * &a;
        let d_delta = -(g_norm / b_norm_sq) * &b;
        let d_beta = -&d_alpha - (f_dot_g / (a_norm_sq * g_norm)) * &a
            + (h_dot_g / (b_norm_sq * g_norm)) * &b;
        let d_gamma = -&d_delta + (f_dot_g / (a_norm_sq * g_norm)) * &a
            - (h_dot_g / (b_norm_sq * g_norm)) * &b;

        let factor = 2.0 * violation;

        let mat = {
            let mut m = na::Matrix3x4::<f64>::from_columns(&[d_alpha, d_beta, d_gamma, d_delta]);
            m.column_iter_mut()
                .zip(self.sites.iter())
                .for_each(|(mut c, site)| c *= factor / site.len() as f64);
            m
        };

        Some(DihedralGradient(mat))
    }
}

impl DihedralGradient {
    fn incorporate_into(self, gradient: &mut DVector, sites: &[Vec<usize>; 4]) {
        for (column, site) in self.0.column_iter().zip(sites.iter()) {
            for &i in site.iter() {
                let mut part = three_mut(gradient, i);
                part += column;
            }
        }
    }
}

/// Named refinement stages in execution order
///
/// Distance and chiral terms contribute in every stage. The fourth
/// dimension compression penalty joins in [`Stage::CompressFourth`], the
/// dihedral terms in [`Stage::Dihedrals`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    FixChirals,
    CompressFourth,
    Dihedrals,
}

fn linearize_bounds(bounds: DistanceBounds) -> Vec<DistanceBound> {
    let n = bounds.n();
    let bounds_squared = bounds.take_matrix().map(|v| v.powi(2));
    StrictUpperTriangleIndices::new(n)
        .map(|(i, j)| DistanceBound {
            indices: (i, j),
            square_bounds: (bounds_squared[(j, i)], bounds_squared[(i, j)]),
        })
        .collect()
}

/// Constraint set a refinement minimizes against
#[derive(Clone)]
pub struct Constraints {
    pub distances: Vec<DistanceBound>,
    pub chirals: Vec<Chiral>,
    pub dihedrals: Vec<Dihedral>,
}

impl Constraints {
    pub fn new(
        bounds: DistanceBounds,
        chirals: Vec<Chiral>,
        dihedrals: Vec<Dihedral>,
    ) -> Constraints {
        Constraints {
            distances: linearize_bounds(bounds),
            chirals,
            dihedrals,
        }
    }

    /// Fraction of sign-carrying chiral constraints with correct volume
    /// sign. One if there are none.
    pub fn correct_chiral_fraction(&self, positions: &DVector) -> f64 {
        let signed: Vec<&Chiral> = self
            .chirals
            .iter()
            .filter(|chiral| !chiral.target_volume_is_zero())
            .collect();
        if signed.is_empty() {
            return 1.0;
        }

        let correct = signed
            .iter()
            .filter(|chiral| chiral.sign_correct(positions))
            .count();
        correct as f64 / signed.len() as f64
    }

    pub fn chirals_correct(&self, positions: &DVector) -> bool {
        self.chirals
            .iter()
            .filter(|chiral| !chiral.target_volume_is_zero())
            .all(|chiral| chiral.sign_correct(positions))
    }
}

/// Error functional over one working position vector
pub struct SerialRefinement {
    pub constraints: Constraints,
    pub stage: Stage,
}

impl SerialRefinement {
    pub fn distance_error(&self, positions: &DVector) -> f64 {
        self.constraints
            .distances
            .iter()
            .map(|bound| bound.error(positions))
            .sum()
    }

    pub fn distance_gradient(&self, positions: &DVector) -> DVector {
        let mut gradient: DVector = DVector::zeros(positions.nrows());

        for bound in self.constraints.distances.iter() {
            if let Some(contribution) = bound.gradient(positions) {
                contribution.incorporate_into(&mut gradient, bound.indices);
            }
        }

        gradient
    }

    pub fn chiral_error(&self, positions: &DVector) -> f64 {
        self.constraints
            .chirals
            .iter()
            .map(|constraint| constraint.error(positions))
            .sum()
    }

    pub fn chiral_gradient(&self, positions: &DVector) -> DVector {
        let mut gradient: DVector = DVector::zeros(positions.nrows());

        for constraint in self.constraints.chirals.iter() {
            if let Some(contribution) = constraint.gradient(positions) {
                contribution.incorporate_into(&mut gradient, &constraint.sites);
            }
        }

        gradient
    }

    pub fn dihedral_error(&self, positions: &DVector) -> f64 {
        if self.stage < Stage::Dihedrals {
            return 0.0;
        }

        self.constraints
            .dihedrals
            .iter()
            .map(|constraint| constraint.error(positions))
            .sum()
    }

    pub fn dihedral_gradient(&self, positions: &DVector, mut gradient: DVector) -> DVector {
        if self.stage < Stage::Dihedrals {
            return gradient;
        }

        for constraint in self.constraints.dihedrals.iter() {
            if let Some(contribution) = constraint.gradient(positions) {
                contribution.incorporate_into(&mut gradient, &constraint.sites);
            }
        }

        gradient
    }

    pub fn fourth_dimension_error(&self, positions: &DVector) -> f64 {
        if self.stage < Stage::CompressFourth {
            return 0.0;
        }

        let n = positions.len() / DIMENSIONS;
        (0..n)
            .map(|i| positions[DIMENSIONS * i + 3].powi(2))
            .sum()
    }

    pub fn fourth_dimension_gradient(&self, positions: &DVector, mut gradient: DVector) -> DVector {
        if self.stage < Stage::CompressFourth {
            return gradient;
        }

        let n = positions.len() / DIMENSIONS;
        for i in 0..n {
            gradient[DIMENSIONS * i + 3] += 2.0 * positions[DIMENSIONS * i + 3];
        }
        gradient
    }

    pub fn error(&self, positions: &DVector) -> f64 {
        self.distance_error(positions)
            + self.chiral_error(positions)
            + self.dihedral_error(positions)
            + self.fourth_dimension_error(positions)
    }

    pub fn gradient(&self, positions: &DVector) -> DVector {
        let gradient = self.distance_gradient(positions) + self.chiral_gradient(positions);
        let gradient = self.dihedral_gradient(positions, gradient);
        self.fourth_dimension_gradient(positions, gradient)
    }
}

impl argmin::core::CostFunction for &SerialRefinement {
    type Param = DVector;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(self.error(param))
    }
}

impl argmin::core::Gradient for &SerialRefinement {
    type Param = DVector;
    type Gradient = DVector;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        Ok(SerialRefinement::gradient(self, param))
    }
}

/// Limits of the continuation predicates
#[derive(Clone, Debug)]
pub struct RefinementConfig {
    /// Total minimizer iteration budget across all stages
    pub step_limit: u64,
    /// Gradient norm at which the compression and dihedral stages complete
    pub gradient_target: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        RefinementConfig {
            step_limit: 10_000,
            gradient_target: 1e-5,
        }
    }
}

/// Per-burst record for external diagnostics
pub struct Step {
    pub positions: DVector,
    pub distance_error: f64,
    pub chiral_error: f64,
    pub dihedral_error: f64,
    pub fourth_dimension_error: f64,
    pub gradient_norm: f64,
    pub stage: Stage,
}

pub struct Refinement {
    pub coords: na::Matrix3xX<f64>,
    pub steps: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefinementError {
    #[error("non-finite error value or gradient during minimization")]
    NumericalFault,
    #[error("iteration budget exhausted before all chiral constraints reached correct sign")]
    ChiralsUnconverged,
    #[error("iteration budget exhausted before the gradient target")]
    StepLimitReached,
    #[error("refined structure violates bounds or chirality beyond tolerance")]
    Unacceptable,
}

fn stage_done<P, G, J, H, F>(state: &IterState<P, G, J, H, F>) -> Result<bool, RefinementError> {
    match &state.termination_status {
        TerminationStatus::Terminated(reason) => match reason {
            TerminationReason::TargetCostReached | TerminationReason::SolverConverged => Ok(true),
            TerminationReason::MaxItersReached => Ok(false),
            _ => Err(RefinementError::NumericalFault),
        },
        TerminationStatus::NotTerminated => Err(RefinementError::NumericalFault),
    }
}

/// Iterations between continuation predicate checks
const BURST: u64 = 25;
const LBFGS_MEMORY: usize = 32;

struct Burst {
    positions: DVector,
    iterations: u64,
    converged: bool,
}

/// Run a bounded burst of LBFGS iterations
///
/// Cancellation is cooperative: predicates are evaluated between bursts,
/// never inside the minimizer.
fn minimize_burst(
    problem: &SerialRefinement,
    positions: DVector,
    iterations: u64,
    gradient_target: f64,
) -> Result<Burst, RefinementError> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, LBFGS_MEMORY)
        .with_tolerance_grad(gradient_target)
        .map_err(|_| RefinementError::NumericalFault)?;

    let mut result = Executor::new(problem, solver)
        .configure(|state| state.param(positions).max_iters(iterations))
        .run()
        .map_err(|_| RefinementError::NumericalFault)?;

    let converged = stage_done(&result.state)?;
    if !result.state.best_cost.is_finite() {
        return Err(RefinementError::NumericalFault);
    }

    let positions = result
        .state
        .take_best_param()
        .ok_or(RefinementError::NumericalFault)?;

    Ok(Burst {
        positions,
        iterations: result.state.iter,
        converged,
    })
}

fn observe(
    observer: &mut Option<&mut dyn FnMut(Step)>,
    problem: &SerialRefinement,
    positions: &DVector,
) {
    if let Some(callback) = observer {
        callback(Step {
            positions: positions.clone(),
            distance_error: problem.distance_error(positions),
            chiral_error: problem.chiral_error(positions),
            dihedral_error: problem.dihedral_error(positions),
            fourth_dimension_error: problem.fourth_dimension_error(positions),
            gradient_norm: problem.gradient(positions).norm(),
            stage: problem.stage,
        });
    }
}

pub fn refine(
    constraints: Constraints,
    positions: Matrix4N,
    config: &RefinementConfig,
) -> Result<Refinement, RefinementError> {
    refine_with_observer(constraints, positions, config, None)
}

/// Minimize the error functional in three stages
///
/// Stage one runs only while chiral constraints are incorrectly signed,
/// stage two compresses the fourth dimension, stage three adds the dihedral
/// terms. Afterwards an acceptability check independent of the minimizer's
/// convergence signal decides success.
pub fn refine_with_observer(
    constraints: Constraints,
    positions: Matrix4N,
    config: &RefinementConfig,
    mut observer: Option<&mut dyn FnMut(Step)>,
) -> Result<Refinement, RefinementError> {
    let dof = positions.len();
    let mut linear = positions.reshape_generic(na::Dyn(dof), na::Const::<1>);

    // Inverting the whole working state is cheaper than minimizing into
    // the majority-correct basin
    if constraints.correct_chiral_fraction(&linear) < 0.5 {
        negate_y_coordinates(&mut linear);
    }

    let mut problem = SerialRefinement {
        constraints,
        stage: Stage::FixChirals,
    };
    let mut remaining = config.step_limit;
    let mut steps = 0;

    // Stage 1: entered only if some signed chiral constraint is inverted
    while !problem.constraints.chirals_correct(&linear) {
        if remaining == 0 {
            return Err(RefinementError::ChiralsUnconverged);
        }

        let burst = minimize_burst(&problem, linear, BURST.min(remaining), 1e-12)?;
        linear = burst.positions;
        remaining = remaining.saturating_sub(burst.iterations.max(1));
        steps += burst.iterations;
        observe(&mut observer, &problem, &linear);

        if burst.converged && !problem.constraints.chirals_correct(&linear) {
            // Stuck in a minimum with inverted chirals
            return Err(RefinementError::ChiralsUnconverged);
        }
    }
    trace!(steps, "chiral signs correct, compressing fourth dimension");

    for stage in [Stage::CompressFourth, Stage::Dihedrals] {
        problem.stage = stage;
        loop {
            if remaining == 0 {
                return Err(RefinementError::StepLimitReached);
            }

            let burst = minimize_burst(
                &problem,
                linear,
                BURST.min(remaining),
                config.gradient_target,
            )?;
            linear = burst.positions;
            remaining = remaining.saturating_sub(burst.iterations.max(1));
            steps += burst.iterations;
            observe(&mut observer, &problem, &linear);

            if burst.converged {
                break;
            }
        }
        trace!(steps, ?stage, "stage converged");
    }

    if !structure_acceptable(&problem.constraints, &linear) {
        return Err(RefinementError::Unacceptable);
    }

    // Reshape and drop the fourth dimension
    let matrix_positions =
        linear.reshape_generic(na::Const::<DIMENSIONS>, na::Dyn(dof / DIMENSIONS));
    let coords = matrix_positions.remove_row(DIMENSIONS - 1);

    Ok(Refinement { coords, steps })
}

/// Check the refined structure against the constraints themselves,
/// independent of the minimizer's convergence signal
pub fn structure_acceptable(constraints: &Constraints, positions: &DVector) -> bool {
    const DISTANCE_LENIENCY: f64 = 0.5;
    const DIHEDRAL_LENIENCY: f64 = 0.3;

    let distances_acceptable = constraints.distances.iter().all(|bound| {
        let (lower_squared, upper_squared) = bound.square_bounds;
        let distance = bound.spatial_distance(positions);
        lower_squared.sqrt() - DISTANCE_LENIENCY <= distance
            && distance <= upper_squared.sqrt() + DISTANCE_LENIENCY
    });

    distances_acceptable
        && constraints.chirals_correct(positions)
        && constraints
            .dihedrals
            .iter()
            .all(|dihedral| dihedral.violation(positions).abs() <= DIHEDRAL_LENIENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dg::modeling::solitary_shape;
    use crate::dg::{DistanceMatrix, MetricMatrix, Partiality};
    use crate::shapes::TETRAHEDRON;
    use itertools::Itertools;
    use rand::SeedableRng;

    use num_traits::float::Float;

    #[test]
    fn index_iterator() {
        for i in 0..6 {
            assert_eq!(StrictUpperTriangleIndices::new(i).linear_index(), 0);

            assert_eq!(
                StrictUpperTriangleIndices::new(i).len(),
                StrictUpperTriangleIndices::new(i).count()
            );

            itertools::assert_equal(
                StrictUpperTriangleIndices::new(i),
                (0..i).combinations(2).map(|v| (v[0], v[1])),
            );
        }
    }

    /// Central difference numerical gradient
    fn numerical_gradient<F: Float + na::Scalar>(
        cost: &dyn Fn(&na::DVector<F>) -> F,
        args: &na::DVector<F>,
    ) -> na::DVector<F> {
        let n = args.len();
        let mut params = args.clone();
        let h = F::from(1e-4).unwrap();
        na::DVector::<F>::from_iterator(
            n,
            (0..n).map(|i| {
                let arg = args[i];
                params[i] = arg + h;
                let b = cost(&params);
                params[i] = arg - h;
                let a = cost(&params);
                params[i] = arg;
                (b - a) / (F::from(2.0).unwrap() * h)
            }),
        )
    }

    #[test]
    fn distance_bound_gradient() {
        use rand::Rng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(71);
        let positions: DVector = DVector::from_fn(8, |_, _| rng.gen_range(-1.0..1.0));
        let r = (four(&positions, 0) - four(&positions, 1)).norm_squared();
        let indices = (0, 1);

        let h = 0.01 * r;

        // Within bounds
        let bound = DistanceBound {
            indices,
            square_bounds: (r - h, r + h),
        };
        assert_eq!(bound.error(&positions), 0.0);
        assert!(bound.gradient(&positions).is_none());

        // Below bounds
        let short = 0.9 * r;
        let bound = DistanceBound {
            indices,
            square_bounds: (short - h, short + h),
        };
        assert!(bound.error(&positions) > 0.0);
        let mut analytical_gradient = DVector::zeros(8);
        bound
            .gradient(&positions)
            .expect("Violated bound has a gradient")
            .incorporate_into(&mut analytical_gradient, bound.indices);
        approx::assert_relative_eq!(
            analytical_gradient,
            numerical_gradient(&|param| bound.error(param), &positions),
            epsilon = 1e-9,
            max_relative = 1e-5
        );

        // Above bounds
        let long = 1.1 * r;
        let bound = DistanceBound {
            indices,
            square_bounds: (long - h, long + h),
        };
        assert!(bound.error(&positions) > 0.0);
        let mut analytical_gradient = DVector::zeros(8);
        bound
            .gradient(&positions)
            .expect("Violated bound has a gradient")
            .incorporate_into(&mut analytical_gradient, bound.indices);
        approx::assert_relative_eq!(
            analytical_gradient,
            numerical_gradient(&|param| bound.error(param), &positions),
            epsilon = 1e-9,
            max_relative = 1e-5
        );
    }

    #[test]
    fn chiral_bound_gradient() {
        let shape = &TETRAHEDRON;
        let mut rng = rand::rngs::StdRng::seed_from_u64(84);
        let bounds = solitary_shape::shape_into_bounds(shape);
        let distances = DistanceMatrix::try_from_distance_bounds(bounds, Partiality::All, &mut rng)
            .expect("Successful metrization");
        let metric = MetricMatrix::from_distance_matrix(distances);
        let coords = metric.embed();
        let n = coords.len();
        let mut linear_coords = coords.reshape_generic(na::Dyn(n), na::Const::<1>);
        let chiral = solitary_shape::chiral_from_tetrahedron(shape.tetrahedra[0], shape, 0.1);

        // Ensure sign of volume for chiral constraint is correct
        if !chiral.volume_positive(&linear_coords) {
            negate_y_coordinates(&mut linear_coords);
        }
        assert!(chiral.volume_positive(&linear_coords));

        if chiral.error(&linear_coords) > 0.0 {
            let mut analytical_gradient = DVector::zeros(n);
            if let Some(contribution) = chiral.gradient(&linear_coords) {
                contribution.incorporate_into(&mut analytical_gradient, &chiral.sites);
            }

            approx::assert_relative_eq!(
                analytical_gradient,
                numerical_gradient(&|p| chiral.error(p), &linear_coords),
                epsilon = 1e-7
            );
        }

        // Invert so the constraint is certainly violated
        negate_y_coordinates(&mut linear_coords);
        assert!(chiral.error(&linear_coords) > 0.0);
        let mut analytical_gradient = DVector::zeros(n);
        if let Some(contribution) = chiral.gradient(&linear_coords) {
            contribution.incorporate_into(&mut analytical_gradient, &chiral.sites);
        }

        approx::assert_relative_eq!(
            analytical_gradient,
            numerical_gradient(&|p| chiral.error(p), &linear_coords),
            epsilon = 1e-7
        );
    }

    #[test]
    fn dihedral_bound_gradient() {
        use rand::Rng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(23);
        let positions: DVector = DVector::from_fn(16, |_, _| rng.gen_range(-3.0..3.0));
        let sites = [vec![0], vec![1], vec![2], vec![3]];

        let observed = {
            let placeholder = Dihedral {
                sites: sites.clone(),
                angle_bounds: (0.0, 0.0),
            };
            placeholder.angle(&positions)
        };

        // Interval shifted so the observed angle violates it
        let violated = Dihedral {
            sites: sites.clone(),
            angle_bounds: (observed - 1.2, observed - 0.8),
        };
        assert!(violated.error(&positions) > 0.0);
        let mut analytical_gradient = DVector::zeros(16);
        violated
            .gradient(&positions)
            .expect("Violated dihedral has a gradient")
            .incorporate_into(&mut analytical_gradient, &violated.sites);
        approx::assert_relative_eq!(
            analytical_gradient,
            numerical_gradient(&|p| violated.error(p), &positions),
            epsilon = 1e-9,
            max_relative = 1e-5
        );

        // Interval containing the observed angle contributes nothing
        let satisfied = Dihedral {
            sites,
            angle_bounds: (observed - 0.1, observed + 0.1),
        };
        assert_eq!(satisfied.error(&positions), 0.0);
        assert!(satisfied.gradient(&positions).is_none());
    }

    #[test]
    fn refine_solitary_tetrahedron() {
        let shape = &TETRAHEDRON;
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let bounds = solitary_shape::shape_into_bounds(shape);
        let chirals = vec![solitary_shape::chiral_from_tetrahedron(
            shape.tetrahedra[0],
            shape,
            0.1,
        )];
        let constraints = Constraints::new(bounds.clone(), chirals, vec![]);

        let distances = DistanceMatrix::try_from_distance_bounds(bounds, Partiality::All, &mut rng)
            .expect("Successful metrization");
        let coords = MetricMatrix::from_distance_matrix(distances).embed();

        let result = refine(constraints.clone(), coords, &RefinementConfig::default())
            .expect("Refinement succeeds on an instance of the shape itself");

        // After refinement all chirals are correctly signed
        let n = result.coords.ncols();
        let mut padded = Matrix4N::zeros(n);
        padded.view_mut((0, 0), (3, n)).copy_from(&result.coords);
        let linear = padded.reshape_generic(na::Dyn(4 * n), na::Const::<1>);
        assert!(constraints.chirals_correct(&linear));
        assert!(structure_acceptable(&constraints, &linear));
    }

    #[test]
    fn observer_records_staged_progress() {
        let shape = &TETRAHEDRON;
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let bounds = solitary_shape::shape_into_bounds(shape);
        let chirals = vec![solitary_shape::chiral_from_tetrahedron(
            shape.tetrahedra[0],
            shape,
            0.1,
        )];
        let constraints = Constraints::new(bounds.clone(), chirals, vec![]);

        let distances = DistanceMatrix::try_from_distance_bounds(bounds, Partiality::All, &mut rng)
            .expect("Successful metrization");
        let coords = MetricMatrix::from_distance_matrix(distances).embed();

        let mut trace: Vec<Step> = Vec::new();
        let mut observer = |step: Step| trace.push(step);
        refine_with_observer(
            constraints,
            coords,
            &RefinementConfig::default(),
            Some(&mut observer),
        )
        .expect("Refinement succeeds on an instance of the shape itself");

        assert!(!trace.is_empty());
        // Stages only ever advance
        assert!(trace.windows(2).all(|w| w[0].stage <= w[1].stage));
        assert_eq!(trace.last().unwrap().stage, Stage::Dihedrals);
        for step in &trace {
            assert!(step.gradient_norm.is_finite());
            assert!(step.distance_error.is_finite());
            assert!(step.chiral_error.is_finite());
            assert!(step.dihedral_error.is_finite());
            assert!(step.fourth_dimension_error.is_finite());
            assert_eq!(step.positions.len(), 4 * (shape.size() + 1));
        }
    }
}
