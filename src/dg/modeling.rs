//! Conversion of a molecular graph with stereo state into distance bounds,
//! chiral constraints and dihedral constraints
//!
//! Distances are modeled outward from the graph: bond lengths from the
//! element radius model, geminal distances through the idealized angles of
//! each center's shape, rotatable-bond distances through the dihedral
//! length closed form. Everything else starts from van der Waals contact
//! distances and a shared upper limit, then triangle smoothing propagates
//! the explicit relationships across the whole matrix.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::warn;

use crate::dg::refinement::{Chiral, Dihedral};
use crate::dg::{BoundsError, DistanceBounds};
use crate::elements;
use crate::geometry;
use crate::molecule::{AtomIndex, AtomStereo, Molecule};
use crate::shapes::{Particle, Shape};

extern crate nalgebra as na;
type Vector3 = na::Vector3<f64>;

/// Relative allowance on modeled bond lengths
pub const BOND_RELATIVE_VARIANCE: f64 = 0.01;
/// Absolute allowance on idealized shape angles, in radians
pub const ANGLE_ABSOLUTE_VARIANCE: f64 = 0.04;
/// Absolute allowance on assigned dihedral angles, in radians
pub const DIHEDRAL_ABSOLUTE_VARIANCE: f64 = 0.05;

/// Sextupled volumes below this magnitude are planarity constraints
const FLAT_VOLUME_THRESHOLD: f64 = 1e-4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelingError {
    #[error("substituent site of atom {center} is only partially covered by fixed positions")]
    PartiallyFixedSite { center: usize },
    #[error("modeled distance bounds are inconsistent: {0}")]
    InconsistentBounds(#[from] BoundsError),
}

/// Distance bounds and refinement constraints of one molecule in one
/// stereopermutator assignment state
#[derive(Clone)]
pub struct SpatialModel {
    pub bounds: DistanceBounds,
    pub chirals: Vec<Chiral>,
    pub dihedrals: Vec<Dihedral>,
}

fn tetrahedral_angle() -> f64 {
    (-1.0f64 / 3.0).acos()
}

/// Idealized angle between the sites of two substituents at a center, read
/// off the center's assigned shape
fn angle_at(stereo: &AtomStereo, shape: &Shape, a: AtomIndex, b: AtomIndex) -> Option<f64> {
    let site_a = stereo.site_of(a)?;
    let site_b = stereo.site_of(b)?;
    let vertex_a = stereo.vertex_of_site(site_a)?;
    let vertex_b = stereo.vertex_of_site(site_b)?;
    Some(shape.angle(vertex_a, vertex_b))
}

/// Bordered determinant over the squared distances of four points,
/// `288 V² = det`. Returns the sextupled volume, clamping negative
/// determinants from inconsistent distance sets to zero.
fn adjusted_volume_from_squared_distances(squares: &na::Matrix4<f64>) -> f64 {
    let mut bordered = na::Matrix5::<f64>::zeros();
    for i in 0..4 {
        bordered[(0, i + 1)] = 1.0;
        bordered[(i + 1, 0)] = 1.0;
        for j in 0..4 {
            bordered[(i + 1, j + 1)] = squares[(i, j)];
        }
    }

    // det = 288 V², adjusted volume is 6V
    (bordered.determinant() / 8.0).max(0.0).sqrt()
}

/// Averaged distance bounds between two atom groups
fn group_bounds(bounds: &DistanceBounds, a: &[usize], b: &[usize]) -> (f64, f64) {
    let mut lower_sum = 0.0;
    let mut upper_sum = 0.0;
    let mut count = 0;
    for &i in a {
        for &j in b {
            debug_assert!(i != j);
            let (lower, upper) = bounds.lower_upper(i, j);
            lower_sum += lower;
            upper_sum += upper;
            count += 1;
        }
    }

    (lower_sum / count as f64, upper_sum / count as f64)
}

/// Sextupled volume interval of four site groups from the current distance
/// bounds, signed by the idealized sextupled volume of the tetrahedron in
/// the shape's coordinates
///
/// Neither the lower- nor the upper-bound determinant dominates the other
/// in general, so the interval is ordered by value, not by provenance.
fn chiral_bounds_from_distances(
    bounds: &DistanceBounds,
    groups: &[Vec<usize>; 4],
    ideal_adjusted_volume: f64,
) -> (f64, f64) {
    if ideal_adjusted_volume.abs() < FLAT_VOLUME_THRESHOLD {
        return (0.0, 0.0);
    }

    let mut lower_squares = na::Matrix4::<f64>::zeros();
    let mut upper_squares = na::Matrix4::<f64>::zeros();
    for i in 0..4 {
        for j in (i + 1)..4 {
            let (lower, upper) = group_bounds(bounds, &groups[i], &groups[j]);
            lower_squares[(i, j)] = lower.powi(2);
            lower_squares[(j, i)] = lower.powi(2);
            upper_squares[(i, j)] = upper.powi(2);
            upper_squares[(j, i)] = upper.powi(2);
        }
    }

    let a = adjusted_volume_from_squared_distances(&lower_squares);
    let b = adjusted_volume_from_squared_distances(&upper_squares);
    let (magnitude_lower, magnitude_upper) = (a.min(b), a.max(b));

    if ideal_adjusted_volume > 0.0 {
        (magnitude_lower, magnitude_upper)
    } else {
        (-magnitude_upper, -magnitude_lower)
    }
}

/// Sextupled volume of a tetrahedron in a shape's idealized coordinates
fn ideal_adjusted_volume(shape: &Shape, tetrahedron: &[Particle; 4]) -> f64 {
    6.0 * geometry::signed_tetrahedron_volume_with_array(
        tetrahedron.map(|p| shape.particle_position(p)),
    )
}

/// Interval of `|φ|` reached by an assigned dihedral state with variance,
/// or the full `[0, π]` when unassigned
fn absolute_dihedral_extremes(state: Option<f64>) -> (f64, f64) {
    match state {
        Some(phi) => {
            let (lower, upper) = (
                phi - DIHEDRAL_ABSOLUTE_VARIANCE,
                phi + DIHEDRAL_ABSOLUTE_VARIANCE,
            );
            let absolute_minimum = if lower <= 0.0 && 0.0 <= upper {
                0.0
            } else {
                lower.abs().min(upper.abs())
            };
            let absolute_maximum = lower.abs().max(upper.abs()).min(std::f64::consts::PI);
            (absolute_minimum, absolute_maximum)
        }
        None => (0.0, std::f64::consts::PI),
    }
}

/// Check the fixed-position precondition: multi-atom substituent sites
/// must be fixed whole or not at all
///
/// Independent of assignment state, so callers can reject a bad fixed
/// position set once instead of per modeling attempt.
pub fn validate_fixed_positions(
    molecule: &Molecule,
    fixed: &[(AtomIndex, Vector3)],
) -> Result<(), ModelingError> {
    if fixed.is_empty() {
        return Ok(());
    }

    let fixed_atoms: HashSet<AtomIndex> = fixed.iter().map(|(a, _)| *a).collect();
    for (center, stereo) in molecule.atom_stereo.iter() {
        for site in stereo.sites.iter().filter(|site| site.len() > 1) {
            let covered = site.iter().filter(|a| fixed_atoms.contains(a)).count();
            if covered != 0 && covered != site.len() {
                return Err(ModelingError::PartiallyFixedSite {
                    center: center.get(),
                });
            }
        }
    }

    Ok(())
}

struct ModelBuilder<'a> {
    molecule: &'a Molecule,
    bounds: DistanceBounds,
    /// Pairs with an explicit modeled relationship, exempt from van der
    /// Waals defaults
    constrained: HashSet<(usize, usize)>,
    chirals: Vec<Chiral>,
    dihedrals: Vec<Dihedral>,
}

impl<'a> ModelBuilder<'a> {
    fn new(molecule: &'a Molecule) -> ModelBuilder<'a> {
        ModelBuilder {
            molecule,
            bounds: DistanceBounds::new(molecule.n()),
            constrained: HashSet::new(),
            chirals: Vec::new(),
            dihedrals: Vec::new(),
        }
    }

    fn mark(&mut self, i: usize, j: usize) {
        self.constrained.insert(DistanceBounds::order_indices(i, j));
    }

    fn set_interval(&mut self, i: usize, j: usize, lower: f64, upper: f64) {
        self.bounds.increase_lower_bound(i, j, lower);
        self.bounds.decrease_upper_bound(i, j, upper);
        self.mark(i, j);
    }

    fn fix_positions(
        &mut self,
        fixed: &[(AtomIndex, Vector3)],
    ) -> Result<(), ModelingError> {
        validate_fixed_positions(self.molecule, fixed)?;

        for (index, (a, position_a)) in fixed.iter().enumerate() {
            for (b, position_b) in fixed.iter().skip(index + 1) {
                let distance = (position_a - position_b).norm();
                self.bounds.collapse(a.get(), b.get(), distance);
                self.mark(a.get(), b.get());
            }
        }

        Ok(())
    }

    fn model_bonds(&mut self) {
        let molecule = self.molecule;
        for (a, b, bond) in molecule.bonds() {
            let distance = elements::bond_distance(
                molecule.element(a),
                molecule.element(b),
                bond.order(),
            );
            self.set_interval(
                a.get(),
                b.get(),
                (1.0 - BOND_RELATIVE_VARIANCE) * distance,
                (1.0 + BOND_RELATIVE_VARIANCE) * distance,
            );
        }
    }

    /// Geminal distances through each center's idealized shape angles,
    /// combined with the adjacent bond intervals by the law of cosines
    fn model_angles(&mut self) {
        let molecule = self.molecule;
        for (center, stereo) in molecule.atom_stereo.iter() {
            if stereo.placements.is_empty() {
                warn!(center = center.get(), "stereocenter has no permissible placements");
                continue;
            }

            let shape = crate::shapes::shape_from_name(stereo.shape);
            for (site_a, site_b) in
                itertools::Itertools::tuple_combinations(0..stereo.sites.len())
            {
                let (Some(vertex_a), Some(vertex_b)) =
                    (stereo.vertex_of_site(site_a), stereo.vertex_of_site(site_b))
                else {
                    continue;
                };
                let theta = shape.angle(vertex_a, vertex_b);

                for &a in stereo.sites[site_a].iter() {
                    for &b in stereo.sites[site_b].iter() {
                        let (a_lower, a_upper) = self.bounds.lower_upper(a.get(), center.get());
                        let (b_lower, b_upper) = self.bounds.lower_upper(b.get(), center.get());
                        let lower = geometry::law_of_cosines(
                            a_lower,
                            b_lower,
                            (theta - ANGLE_ABSOLUTE_VARIANCE).max(0.0),
                        );
                        let upper = geometry::law_of_cosines(
                            a_upper,
                            b_upper,
                            (theta + ANGLE_ABSOLUTE_VARIANCE).min(std::f64::consts::PI),
                        );
                        self.set_interval(a.get(), b.get(), lower, upper);
                    }
                }
            }
        }
    }

    /// Rotatable-bond distances and dihedral constraints
    ///
    /// Assigned bond stereo narrows both the dihedral interval and the
    /// 1-4 distance bounds of its front and back substituents; unassigned
    /// bond stereo only contributes the free-rotation distance interval.
    fn model_dihedrals(&mut self) {
        let molecule = self.molecule;
        let stereo_map: &HashMap<AtomIndex, AtomStereo> = &molecule.atom_stereo;

        for bond_stereo in molecule.bond_stereo.iter() {
            let (i, j) = bond_stereo.axis;
            let state = bond_stereo
                .assignment
                .map(|assignment| bond_stereo.states[assignment]);
            let (absolute_minimum, absolute_maximum) = absolute_dihedral_extremes(state);

            let alpha = |front: AtomIndex| {
                stereo_map
                    .get(&i)
                    .and_then(|stereo| {
                        angle_at(stereo, crate::shapes::shape_from_name(stereo.shape), front, j)
                    })
                    .unwrap_or_else(tetrahedral_angle)
            };
            let beta = |back: AtomIndex| {
                stereo_map
                    .get(&j)
                    .and_then(|stereo| {
                        angle_at(stereo, crate::shapes::shape_from_name(stereo.shape), back, i)
                    })
                    .unwrap_or_else(tetrahedral_angle)
            };

            for &front in bond_stereo.front.iter() {
                for &back in bond_stereo.back.iter() {
                    let (a_lower, a_upper) = self.bounds.lower_upper(front.get(), i.get());
                    let (b_lower, b_upper) = self.bounds.lower_upper(i.get(), j.get());
                    let (c_lower, c_upper) = self.bounds.lower_upper(j.get(), back.get());
                    let front_angle = alpha(front);
                    let back_angle = beta(back);

                    let lower = geometry::dihedral_length(
                        a_lower,
                        b_lower,
                        c_lower,
                        (front_angle - ANGLE_ABSOLUTE_VARIANCE).max(0.0),
                        (back_angle - ANGLE_ABSOLUTE_VARIANCE).max(0.0),
                        absolute_minimum,
                    );
                    let upper = geometry::dihedral_length(
                        a_upper,
                        b_upper,
                        c_upper,
                        (front_angle + ANGLE_ABSOLUTE_VARIANCE).min(std::f64::consts::PI),
                        (back_angle + ANGLE_ABSOLUTE_VARIANCE).min(std::f64::consts::PI),
                        absolute_maximum,
                    );
                    self.set_interval(front.get(), back.get(), lower, upper);
                }
            }

            if let Some(phi) = state {
                self.dihedrals.push(Dihedral {
                    sites: [
                        bond_stereo.front.iter().map(|a| a.get()).collect(),
                        vec![i.get()],
                        vec![j.get()],
                        bond_stereo.back.iter().map(|a| a.get()).collect(),
                    ],
                    angle_bounds: (
                        phi - DIHEDRAL_ABSOLUTE_VARIANCE,
                        phi + DIHEDRAL_ABSOLUTE_VARIANCE,
                    ),
                });
            }
        }
    }

    /// Contact distance defaults for every pair without an explicit
    /// relationship. Geminal pairs lacking angle information get the
    /// smaller covalent contact instead, since triangle smoothing caps
    /// their upper bound below van der Waals reach.
    fn model_contact_defaults(&mut self) {
        let molecule = self.molecule;
        let mut geminal: HashSet<(usize, usize)> = HashSet::new();
        for center in molecule.atoms() {
            for (a, b) in itertools::Itertools::tuple_combinations(molecule.adjacent(center)) {
                geminal.insert(DistanceBounds::order_indices(a.get(), b.get()));
            }
        }

        for atom in molecule.atoms() {
            for other in molecule.atoms().filter(|other| other.get() > atom.get()) {
                let pair = (atom.get(), other.get());
                if self.constrained.contains(&pair) {
                    continue;
                }

                let lower = if geminal.contains(&pair) {
                    molecule.element(atom).covalent_radius()
                        + molecule.element(other).covalent_radius()
                } else {
                    molecule.element(atom).vdw_radius() + molecule.element(other).vdw_radius()
                };
                self.bounds.increase_lower_bound(pair.0, pair.1, lower);
            }
        }
    }

    /// Chiral constraints of every assigned atom stereocenter, with volume
    /// intervals derived from the current distance bounds
    fn model_chirals(&mut self) {
        let molecule = self.molecule;
        for (center, stereo) in molecule.atom_stereo.iter() {
            if stereo.assignment.is_none() {
                continue;
            }

            let shape = crate::shapes::shape_from_name(stereo.shape);
            for tetrahedron in shape.tetrahedra.iter() {
                let groups = particle_groups(tetrahedron, stereo, *center);
                let Some(groups) = groups else {
                    continue;
                };

                let ideal = ideal_adjusted_volume(shape, tetrahedron);
                let adjusted_volume_bounds =
                    chiral_bounds_from_distances(&self.bounds, &groups, ideal);
                self.chirals.push(Chiral {
                    sites: groups,
                    adjusted_volume_bounds,
                    weight: 1.0,
                });
            }
        }
    }

    fn constraint_quads(&self) -> Vec<[usize; 4]> {
        self.chirals
            .iter()
            .map(|chiral| &chiral.sites)
            .chain(self.dihedrals.iter().map(|dihedral| &dihedral.sites))
            .map(|sites| {
                [sites[0][0], sites[1][0], sites[2][0], sites[3][0]]
            })
            .filter(|quad| {
                itertools::Itertools::tuple_combinations(quad.iter())
                    .all(|(a, b): (&usize, &usize)| a != b)
            })
            .collect()
    }

    fn finish(mut self) -> Result<SpatialModel, ModelingError> {
        let quads = self.constraint_quads();
        self.bounds.tetrangle_smooth(&quads)?;
        let bounds = self.bounds.floyd_triangle_smooth()?;

        Ok(SpatialModel {
            bounds,
            chirals: self.chirals,
            dihedrals: self.dihedrals,
        })
    }
}

/// Atom groups of a tetrahedron's particles under the assigned placement
fn particle_groups(
    tetrahedron: &[Particle; 4],
    stereo: &AtomStereo,
    center: AtomIndex,
) -> Option<[Vec<usize>; 4]> {
    let placement = stereo.placement()?;
    let group = |particle: Particle| -> Option<Vec<usize>> {
        match particle {
            Particle::Origin => Some(vec![center.get()]),
            Particle::Vertex(vertex) => {
                let site = *placement.get(vertex)?;
                Some(stereo.sites.get(site)?.iter().map(|a| a.get()).collect())
            }
        }
    };

    let groups = tetrahedron.map(group);
    if groups.iter().any(|g| g.is_none()) {
        return None;
    }
    Some(groups.map(|g| g.expect("Checked for absence above")))
}

impl SpatialModel {
    /// Model a molecule's distance bounds and constraints
    ///
    /// Errors on partially fixed multi-atom sites and on modeled bounds
    /// that cannot be reconciled by smoothing.
    pub fn from_molecule(
        molecule: &Molecule,
        fixed_positions: &[(AtomIndex, Vector3)],
    ) -> Result<SpatialModel, ModelingError> {
        let mut builder = ModelBuilder::new(molecule);
        builder.fix_positions(fixed_positions)?;
        builder.model_bonds();
        builder.model_angles();
        builder.model_dihedrals();
        builder.model_contact_defaults();
        builder.model_chirals();
        builder.finish()
    }

    /// Constraint set for refinement, leaving the model reusable across
    /// attempts
    pub fn constraints(&self) -> crate::dg::refinement::Constraints {
        crate::dg::refinement::Constraints::new(
            self.bounds.clone(),
            self.chirals.clone(),
            self.dihedrals.clone(),
        )
    }
}

/// Distance modeling of a bare shape without a molecular graph, for tests
/// and benchmarks of the downstream pipeline
pub mod solitary_shape {
    use super::*;

    /// Bounds over a shape's vertices plus its centroid, centroid first,
    /// at unit centroid distance
    pub fn shape_into_bounds(shape: &Shape) -> DistanceBounds {
        let size = shape.size();
        let mut bounds = DistanceBounds::new(size + 1);
        for vertex in 0..size {
            bounds.increase_lower_bound(0, vertex + 1, 1.0 - BOND_RELATIVE_VARIANCE);
            bounds.decrease_upper_bound(0, vertex + 1, 1.0 + BOND_RELATIVE_VARIANCE);
        }

        for i in 0..size {
            for j in (i + 1)..size {
                let theta = shape.angle(i, j);
                bounds.increase_lower_bound(
                    i + 1,
                    j + 1,
                    geometry::law_of_cosines(
                        1.0 - BOND_RELATIVE_VARIANCE,
                        1.0 - BOND_RELATIVE_VARIANCE,
                        (theta - ANGLE_ABSOLUTE_VARIANCE).max(0.0),
                    ),
                );
                bounds.decrease_upper_bound(
                    i + 1,
                    j + 1,
                    geometry::law_of_cosines(
                        1.0 + BOND_RELATIVE_VARIANCE,
                        1.0 + BOND_RELATIVE_VARIANCE,
                        (theta + ANGLE_ABSOLUTE_VARIANCE).min(std::f64::consts::PI),
                    ),
                );
            }
        }

        bounds
            .floyd_triangle_smooth()
            .expect("Idealized shape bounds are consistent")
    }

    /// Chiral constraint of one of the shape's tetrahedra over the
    /// solitary-shape atom numbering
    pub fn chiral_from_tetrahedron(
        tetrahedron: [Particle; 4],
        shape: &Shape,
        weight: f64,
    ) -> Chiral {
        let bounds = shape_into_bounds(shape);
        let sites = tetrahedron.map(|particle| match particle {
            Particle::Origin => vec![0],
            Particle::Vertex(vertex) => vec![vertex + 1],
        });
        let ideal = ideal_adjusted_volume(shape, &tetrahedron);
        let adjusted_volume_bounds = chiral_bounds_from_distances(&bounds, &sites, ideal);

        Chiral {
            sites,
            adjusted_volume_bounds,
            weight,
        }
    }
}
