//! Distance Geometry pipeline
//!
//! Bounds matrix and smoothing, metrization, Gram matrix embedding, staged
//! refinement and the conformer generation driver.

use rand::prelude::SliceRandom;
use rand::Rng;
use thiserror::Error;

extern crate nalgebra as na;
type Matrix4N = na::Matrix4xX<f64>;

/// Number of spatial dimensions embedding and refinement operate in
pub const DIMENSIONS: usize = 4;

/// Unreconcilable pair of distance bounds
#[derive(Error, Debug, Clone, PartialEq)]
#[error("bounds between atoms {i} and {j} cannot be reconciled: lower {lower} exceeds upper {upper}")]
pub struct BoundsError {
    pub i: usize,
    pub j: usize,
    pub lower: f64,
    pub upper: f64,
}

/// Pairwise distance bound matrix
///
/// Lower bounds in the lower triangle, upper bounds above, empty diagonal.
#[derive(Clone)]
pub struct DistanceBounds {
    mat: na::DMatrix<f64>,
}

impl DistanceBounds {
    /// Distance assumed reachable between any two atoms of one molecule
    pub const DEFAULT_UPPER: f64 = 100.0;

    pub fn new(n: usize) -> DistanceBounds {
        let mat = na::DMatrix::from_fn(n, n, |i, j| match i.cmp(&j) {
            std::cmp::Ordering::Less => Self::DEFAULT_UPPER,
            _ => 0.0,
        });
        DistanceBounds { mat }
    }

    pub fn n(&self) -> usize {
        self.mat.ncols()
    }

    pub fn order_indices(mut i: usize, mut j: usize) -> (usize, usize) {
        assert!(i != j);
        if i > j {
            std::mem::swap(&mut i, &mut j);
        }
        (i, j)
    }

    fn lower_tuple(i: usize, j: usize) -> (usize, usize) {
        debug_assert!(i < j);
        (j, i)
    }

    fn upper_tuple(i: usize, j: usize) -> (usize, usize) {
        debug_assert!(i < j);
        (i, j)
    }

    pub fn lower(&self, i: usize, j: usize) -> f64 {
        let (i, j) = Self::order_indices(i, j);
        self.mat[Self::lower_tuple(i, j)]
    }

    pub fn upper(&self, i: usize, j: usize) -> f64 {
        let (i, j) = Self::order_indices(i, j);
        self.mat[Self::upper_tuple(i, j)]
    }

    pub fn lower_upper(&self, i: usize, j: usize) -> (f64, f64) {
        let (i, j) = Self::order_indices(i, j);
        (
            self.mat[Self::lower_tuple(i, j)],
            self.mat[Self::upper_tuple(i, j)],
        )
    }

    /// Fix a pair's distance to a single value
    pub fn collapse(&mut self, i: usize, j: usize, value: f64) {
        assert!(i != j);
        self.mat[(i, j)] = value;
        self.mat[(j, i)] = value;
    }

    /// Raise a pair's lower bound. No-op if the value does not tighten the
    /// existing interval.
    pub fn increase_lower_bound(&mut self, i: usize, j: usize, value: f64) -> bool {
        let (i, j) = Self::order_indices(i, j);
        if (self.mat[Self::lower_tuple(i, j)]..self.mat[Self::upper_tuple(i, j)]).contains(&value) {
            self.mat[Self::lower_tuple(i, j)] = value;
            return true;
        }

        false
    }

    /// Lower a pair's upper bound. No-op if the value does not tighten the
    /// existing interval.
    pub fn decrease_upper_bound(&mut self, i: usize, j: usize, value: f64) -> bool {
        let (i, j) = Self::order_indices(i, j);
        if self.mat[Self::upper_tuple(i, j)] >= value && value > self.mat[Self::lower_tuple(i, j)] {
            self.mat[Self::upper_tuple(i, j)] = value;
            return true;
        }

        false
    }

    fn inversion(&self, i: usize, j: usize) -> Option<BoundsError> {
        let (i, j) = Self::order_indices(i, j);
        let lower = self.mat[Self::lower_tuple(i, j)];
        let upper = self.mat[Self::upper_tuple(i, j)];
        (lower > upper).then_some(BoundsError { i, j, lower, upper })
    }

    /// Relax the triangle inequalities over one triple, tightening the
    /// bounds of pair `(i, j)` through intermediate `k`
    fn relax_triple(&mut self, i: usize, j: usize, k: usize) -> bool {
        let (oi, oj) = Self::order_indices(i, j);
        let ij_lower = Self::lower_tuple(oi, oj);
        let ij_upper = Self::upper_tuple(oi, oj);
        let (ik_lower, ik_upper) = self.lower_upper(i, k);
        let (jk_lower, jk_upper) = self.lower_upper(j, k);

        let mut changed = false;
        if self.mat[ij_upper] > ik_upper + jk_upper {
            self.mat[ij_upper] = ik_upper + jk_upper;
            changed = true;
        }

        if self.mat[ij_lower] < ik_lower - jk_upper {
            self.mat[ij_lower] = ik_lower - jk_upper;
            changed = true;
        } else if self.mat[ij_lower] < jk_lower - ik_upper {
            self.mat[ij_lower] = jk_lower - ik_upper;
            changed = true;
        }

        changed
    }

    /// Full triangle inequality smoothing with Floyd's algorithm: O(N³)
    ///
    /// Errors with the offending pair if a bound inversion is encountered.
    pub fn floyd_triangle_smooth(mut self) -> Result<Self, BoundsError> {
        let n = self.mat.ncols();

        for k in 0..n {
            for i in (0..(n - 1)).filter(|&x| x != k) {
                if let Some(error) = self.inversion(i, k) {
                    return Err(error);
                }

                for j in ((i + 1)..n).filter(|&x| x != k) {
                    self.relax_triple(i, j, k);

                    if let Some(error) = self.inversion(i, j) {
                        return Err(error);
                    }
                }
            }
        }

        Ok(self)
    }

    /// Light smoothing pass restricted to constraint quadruples
    ///
    /// Iterated local relaxation over the triples within each four-atom
    /// group, used to propagate chirality- and dihedral-implied bounds
    /// cheaply before (or instead of) a full Floyd pass.
    pub fn tetrangle_smooth(&mut self, quads: &[[usize; 4]]) -> Result<(), BoundsError> {
        const SWEEP_LIMIT: usize = 16;

        for _ in 0..SWEEP_LIMIT {
            let mut changed = false;
            for quad in quads {
                for (a, b, c) in quad_triples(quad) {
                    changed |= self.relax_triple(a, b, c);
                    if let Some(error) = self.inversion(a, b) {
                        return Err(error);
                    }
                }
            }

            if !changed {
                break;
            }
        }

        Ok(())
    }

    pub fn matrix(&self) -> &na::DMatrix<f64> {
        &self.mat
    }

    pub fn take_matrix(self) -> na::DMatrix<f64> {
        self.mat
    }
}

fn quad_triples(quad: &[usize; 4]) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
    use itertools::Itertools;
    quad.iter()
        .copied()
        .tuple_combinations()
        .flat_map(move |(a, b)| {
            quad.iter()
                .copied()
                .filter(move |&c| c != a && c != b)
                .map(move |c| (a, b, c))
        })
        .filter(|(a, b, c)| a != b && a != c && b != c)
}

/// For what subset of atoms to repeat triangle inequality smoothing during
/// distance sampling
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Partiality {
    FourAtom,
    TenPercent,
    All,
}

/// Concrete symmetric distance matrix sampled from a bound matrix
pub struct DistanceMatrix {
    mat: na::DMatrix<f64>,
}

impl DistanceMatrix {
    /// Metrize a bound matrix into a concrete distance matrix
    ///
    /// Distances are chosen uniformly within their current bounds in
    /// shuffled atom order. The bounds of each of the first atoms (as
    /// selected by `partiality`) are re-smoothed after every choice so
    /// consistency propagates into the remaining intervals.
    pub fn try_from_distance_bounds<R: Rng + ?Sized>(
        mut bounds: DistanceBounds,
        partiality: Partiality,
        rng: &mut R,
    ) -> Result<DistanceMatrix, BoundsError> {
        let n = bounds.n();
        let mut index_order: Vec<usize> = (0..n).collect();
        index_order.as_mut_slice().shuffle(rng);

        let metrization_boundary = match partiality {
            Partiality::FourAtom => n.min(4),
            Partiality::TenPercent => n.min(4.max(n / 10)),
            Partiality::All => n,
        };

        for (count, i) in index_order.into_iter().enumerate() {
            for j in (0..n).filter(|&x| x != i) {
                let (lower, upper) = bounds.lower_upper(i, j);

                // Skip already-collapsed pairs
                if lower == upper {
                    continue;
                }

                if lower > upper {
                    let (oi, oj) = DistanceBounds::order_indices(i, j);
                    return Err(BoundsError {
                        i: oi,
                        j: oj,
                        lower,
                        upper,
                    });
                }

                bounds.collapse(i, j, rng.gen_range(lower..upper));

                if count < metrization_boundary {
                    bounds = bounds.floyd_triangle_smooth()?;
                }
            }
        }

        Ok(DistanceMatrix {
            mat: bounds.take_matrix(),
        })
    }

    /// Wrap an externally supplied symmetric distance matrix
    pub fn from_matrix(mat: na::DMatrix<f64>) -> DistanceMatrix {
        assert_eq!(mat.nrows(), mat.ncols());
        DistanceMatrix { mat }
    }

    pub fn n(&self) -> usize {
        self.mat.ncols()
    }

    pub fn matrix(&self) -> &na::DMatrix<f64> {
        &self.mat
    }

    pub fn take_matrix(self) -> na::DMatrix<f64> {
        self.mat
    }
}

/// Gram matrix of the centered coordinates implied by a distance matrix
pub struct MetricMatrix {
    mat: na::DMatrix<f64>,
}

impl MetricMatrix {
    /// Double-center the squared distance matrix
    ///
    /// Each entry follows from
    ///
    ///    D0[i]² =   (1/N) Σ_j distances[i, j]²
    ///             - (1/N²) Σ_{j < k} distances[j, k]²
    ///
    /// (the second term does not depend on i and is hoisted), and
    ///
    ///    [i, j] = (D0[i]² + D0[j]² - distances[i, j]²) / 2
    ///
    /// On the diagonal the distance term vanishes and [i, i] = D0[i]², so
    /// all of D0² is stored there first and the off-diagonal transformation
    /// reads it back.
    pub fn from_distance_matrix(distances: DistanceMatrix) -> MetricMatrix {
        let n = distances.n();
        let mut mat: na::DMatrix<f64> = na::DMatrix::zeros(n, n);

        let square_distances = distances.take_matrix().map(|v| v.powi(2));
        let second_term = square_distances.sum() / (2 * n * n) as f64;

        for i in 0..n {
            let first_term = square_distances.column(i).sum() / n as f64;
            mat[(i, i)] = first_term - second_term;
        }

        for i in 0..n {
            for j in (i + 1)..n {
                let value = (mat[(i, i)] + mat[(j, j)] - square_distances[(i, j)]) / 2.0;
                mat[(i, j)] = value;
                mat[(j, i)] = value;
            }
        }

        MetricMatrix { mat }
    }

    /// Reconstruct coordinates from the four largest non-negative
    /// eigenvalue pairs
    ///
    /// Purely deterministic. Numerical degeneracy is tolerated: near-zero
    /// eigenvalues contribute near-zero extent, and negative ones are
    /// clipped by exclusion.
    pub fn embed(self) -> Matrix4N {
        let n = self.mat.ncols();
        let decomposition = self.mat.symmetric_eigen();

        let mut usable: Vec<(usize, f64)> = decomposition
            .eigenvalues
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, eigenvalue)| *eigenvalue > 0.0)
            .collect();
        usable.sort_by(|(_, a), (_, b)| b.partial_cmp(a).expect("No NaN eigenvalues"));

        let mut xyzw: Matrix4N = Matrix4N::zeros(n);
        for (row, (index, eigenvalue)) in usable.into_iter().take(DIMENSIONS).enumerate() {
            xyzw.set_row(
                row,
                &(eigenvalue.sqrt() * decomposition.eigenvectors.column(index).transpose()),
            );
        }

        xyzw
    }

    pub fn matrix(&self) -> &na::DMatrix<f64> {
        &self.mat
    }
}

pub mod conformers;
pub mod modeling;
pub mod refinement;

pub use conformers::{
    generate_conformation, generate_ensemble, Configuration, Error, GenerationFailure,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dg::modeling::solitary_shape;
    use crate::shapes;
    use rand::SeedableRng;

    fn sample_bounds() -> DistanceBounds {
        solitary_shape::shape_into_bounds(&shapes::OCTAHEDRON)
    }

    #[test]
    fn smoothing_is_idempotent() {
        let smoothed = sample_bounds()
            .floyd_triangle_smooth()
            .expect("Valid example bounds");
        let again = smoothed
            .clone()
            .floyd_triangle_smooth()
            .expect("Still valid");
        assert_eq!(smoothed.matrix(), again.matrix());
    }

    #[test]
    fn tetrangle_smoothing_tightens_within_triangle_limits() {
        let full = sample_bounds()
            .floyd_triangle_smooth()
            .expect("Valid example bounds");

        let mut local = sample_bounds();
        local
            .tetrangle_smooth(&[[0, 1, 2, 3], [2, 3, 4, 5], [0, 1, 4, 5]])
            .expect("Quadruple relaxation does not invert");

        // Local relaxation never tightens beyond the full smooth
        let n = local.n();
        for i in 0..(n - 1) {
            for j in (i + 1)..n {
                assert!(local.upper(i, j) >= full.upper(i, j) - 1e-12);
                assert!(local.lower(i, j) <= full.lower(i, j) + 1e-12);
                assert!(local.lower(i, j) <= local.upper(i, j));
            }
        }
    }

    #[test]
    fn metrization_respects_bounds_and_triangle_inequalities() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let bounds = sample_bounds()
            .floyd_triangle_smooth()
            .expect("Valid example bounds");

        for partiality in [Partiality::FourAtom, Partiality::TenPercent, Partiality::All] {
            let distances =
                DistanceMatrix::try_from_distance_bounds(bounds.clone(), partiality, &mut rng)
                    .expect("Successful metrization");
            let n = distances.n();

            for i in 0..(n - 1) {
                for j in (i + 1)..n {
                    let value = distances.matrix()[(i, j)];
                    assert_eq!(value, distances.matrix()[(j, i)]);
                    assert!(bounds.lower(i, j) <= value + 1e-9);
                    assert!(value <= bounds.upper(i, j) + 1e-9);
                }
            }

            // Only full metrization guarantees triangle inequalities over
            // every triple
            if partiality == Partiality::All {
                for i in 0..n {
                    for j in (0..n).filter(|&x| x != i) {
                        for k in (0..n).filter(|&x| x != i && x != j) {
                            let direct = distances.matrix()[(i, k)];
                            let detour =
                                distances.matrix()[(i, j)] + distances.matrix()[(j, k)];
                            assert!(direct <= detour + 1e-9);
                        }
                    }
                }
            }
        }
    }

    fn reorder(source: &na::DMatrix<f64>, sequence: &[usize]) -> na::DMatrix<f64> {
        let n = sequence.len();
        na::DMatrix::from_fn(n, n, |i, j| source[(sequence[i], sequence[j])])
    }

    fn inverse_sequence(sequence: &[usize]) -> Vec<usize> {
        let mut inverse = vec![0; sequence.len()];
        for (position, &value) in sequence.iter().enumerate() {
            inverse[value] = position;
        }
        inverse
    }

    #[test]
    fn metric_matrix_invariant_under_reordering() {
        use rand::seq::SliceRandom;

        const N: usize = 10;
        let mut rng = rand::rngs::StdRng::seed_from_u64(2721813754);

        for _ in 0..100 {
            // Random symmetric distance-like matrix with empty diagonal
            let raw = na::DMatrix::<f64>::new_random(N, N).map(|v| v + 0.01);
            let mut distances = (&raw + raw.transpose()).scale(0.5);
            distances.fill_diagonal(0.0);

            let mut sequence: Vec<usize> = (0..N).collect();
            sequence.shuffle(&mut rng);
            let inverse = inverse_sequence(&sequence);

            let direct =
                MetricMatrix::from_distance_matrix(DistanceMatrix::from_matrix(distances.clone()));
            let of_reordered = MetricMatrix::from_distance_matrix(DistanceMatrix::from_matrix(
                reorder(&distances, &sequence),
            ));
            let returned = reorder(of_reordered.matrix(), &inverse);

            approx::assert_relative_eq!(direct.matrix(), &returned, epsilon = 1e-10);
        }
    }

    #[test]
    fn explicit_known_embedding() {
        let sqrt2 = std::f64::consts::SQRT_2;
        let distances = na::DMatrix::from_row_slice(
            4,
            4,
            &[
                0.0, 1.0, sqrt2, 1.0, //
                1.0, 0.0, 1.0, sqrt2, //
                sqrt2, 1.0, 0.0, 1.0, //
                1.0, sqrt2, 1.0, 0.0,
            ],
        );

        let expected = na::DMatrix::from_row_slice(
            4,
            4,
            &[
                0.5, 0.0, -0.5, 0.0, //
                0.0, 0.5, 0.0, -0.5, //
                -0.5, 0.0, 0.5, 0.0, //
                0.0, -0.5, 0.0, 0.5,
            ],
        );

        let metric = MetricMatrix::from_distance_matrix(DistanceMatrix::from_matrix(distances));
        approx::assert_relative_eq!(metric.matrix(), &expected, epsilon = 1e-7);
    }
}
