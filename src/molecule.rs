//! Molecular graph and stereocenter assignment state
//!
//! This is the collaborator surface the Distance Geometry pipeline consumes:
//! graph topology with element and bond type data, plus per-atom and
//! per-bond stereo state. Ranking and stereopermutation enumeration are
//! expected to happen elsewhere; stereo carried here is already reduced to
//! permissible site placements and an optional choice among them.

extern crate nalgebra as na;

use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_3, PI};

use derive_more::{From, Into};
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::Undirected;
use rand::Rng;

use crate::elements::Element;
use crate::geometry;
use crate::shapes::{self, Name};

/// Final conformer positions, one column per atom
pub type PositionCollection = na::Matrix3xX<f64>;

/// Opaque atom identifier, stable for the duration of one generation run
#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomIndex(usize);

impl AtomIndex {
    pub fn get(&self) -> usize {
        self.0
    }

    fn node(&self) -> NodeIndex {
        NodeIndex::new(self.0)
    }
}

/// Discrete bond type with fractional order lookup
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BondType {
    Single,
    Double,
    Triple,
    Quadruple,
    Quintuple,
    Sextuple,
    Aromatic,
}

impl BondType {
    pub fn order(&self) -> f64 {
        match self {
            BondType::Single => 1.0,
            BondType::Double => 2.0,
            BondType::Triple => 3.0,
            BondType::Quadruple => 4.0,
            BondType::Quintuple => 5.0,
            BondType::Sextuple => 6.0,
            BondType::Aromatic => 1.5,
        }
    }
}

/// One or more atoms bound at a single shape vertex
pub type Site = Vec<AtomIndex>;

/// Maps shape vertices to substituent site indices
pub type Placement = Vec<usize>;

/// Reduced stereo state of a non-terminal atom
///
/// Every non-terminal atom carries one of these, stereogenic or not: the
/// shape and placement also drive 1-3 distance modeling. Multiple
/// permissible placements make the atom a stereocenter proper.
#[derive(Clone, Debug)]
pub struct AtomStereo {
    pub center: AtomIndex,
    pub shape: Name,
    pub sites: Vec<Site>,
    /// Permissible placements of sites onto shape vertices
    pub placements: Vec<Placement>,
    /// Choice among the permissible placements
    pub assignment: Option<usize>,
}

impl AtomStereo {
    /// Shape state with one atom per site and a single permissible placement
    pub fn monodentate(center: AtomIndex, shape: Name, substituents: &[AtomIndex]) -> AtomStereo {
        let size = shapes::shape_from_name(shape).size();
        assert_eq!(substituents.len(), size);
        let sites = substituents.iter().map(|&a| vec![a]).collect();
        let identity: Placement = (0..size).collect();
        AtomStereo {
            center,
            shape,
            sites,
            placements: vec![identity],
            assignment: Some(0),
        }
    }

    /// Extend to a two-permutation stereocenter by adding the shape's
    /// mirrored placement, dropping any prior assignment
    pub fn with_mirror_assignments(mut self) -> AtomStereo {
        let mirror = shapes::shape_from_name(self.shape)
            .mirror
            .as_ref()
            .expect("Shape carries a mirror element")
            .clone();
        let base = self.placements[0].clone();
        let mirrored: Placement = mirror.iter().map(|&v| base[v]).collect();
        self.placements = vec![base, mirrored];
        self.assignment = None;
        self
    }

    /// Currently assigned placement, if any
    pub fn placement(&self) -> Option<&Placement> {
        self.assignment.map(|a| &self.placements[a])
    }

    pub fn site_of(&self, atom: AtomIndex) -> Option<usize> {
        self.sites.iter().position(|site| site.contains(&atom))
    }

    /// Shape vertex a site occupies under the assigned placement
    pub fn vertex_of_site(&self, site: usize) -> Option<usize> {
        self.placement()
            .and_then(|p| p.iter().position(|&s| s == site))
    }
}

/// Reduced stereo state of a rotatable or stereogenic bond
///
/// The dihedral observed over (front, axis.0, axis.1, back) is constrained
/// to one of the ideal `states` when assigned.
#[derive(Clone, Debug)]
pub struct BondStereo {
    pub axis: (AtomIndex, AtomIndex),
    pub front: Site,
    pub back: Site,
    /// Ideal dihedral angles in radians, one per rotational state
    pub states: Vec<f64>,
    pub assignment: Option<usize>,
}

fn site_centroid(site: &Site, positions: &PositionCollection) -> na::Vector3<f64> {
    let sum = site
        .iter()
        .fold(na::Vector3::zeros(), |acc, &a| acc + positions.column(a.get()));
    sum / site.len() as f64
}

impl BondStereo {
    /// Threefold staggered states: anti, gauche+, gauche-
    pub fn staggered(axis: (AtomIndex, AtomIndex), front: Site, back: Site) -> BondStereo {
        BondStereo {
            axis,
            front,
            back,
            states: vec![PI, FRAC_PI_3, -FRAC_PI_3],
            assignment: None,
        }
    }

    /// Observed dihedral angle over the defining four-point sequence
    pub fn angle(&self, positions: &PositionCollection) -> f64 {
        geometry::dihedral(
            &site_centroid(&self.front, positions),
            &positions.column(self.axis.0.get()).into(),
            &positions.column(self.axis.1.get()).into(),
            &site_centroid(&self.back, positions),
        )
    }

    /// Index of the ideal state nearest to the observed dihedral
    pub fn fit_state(&self, positions: &PositionCollection) -> Option<usize> {
        let observed = self.angle(positions);
        self.states
            .iter()
            .enumerate()
            .min_by(|(_, &a), (_, &b)| {
                let da = geometry::signed_angle_difference(observed, a).abs();
                let db = geometry::signed_angle_difference(observed, b).abs();
                da.partial_cmp(&db).expect("Angles are finite")
            })
            .map(|(i, _)| i)
    }
}

type Graph = StableGraph<Element, BondType, Undirected>;

/// Molecular graph with stereo state
#[derive(Clone, Default)]
pub struct Molecule {
    graph: Graph,
    pub atom_stereo: HashMap<AtomIndex, AtomStereo>,
    pub bond_stereo: Vec<BondStereo>,
}

impl Molecule {
    pub fn new() -> Molecule {
        Molecule::default()
    }

    pub fn add_atom(&mut self, element: Element) -> AtomIndex {
        AtomIndex(self.graph.add_node(element).index())
    }

    pub fn add_bond(&mut self, a: AtomIndex, b: AtomIndex, bond: BondType) {
        assert!(a != b);
        self.graph.add_edge(a.node(), b.node(), bond);
    }

    /// Number of atoms
    pub fn n(&self) -> usize {
        self.graph.node_count()
    }

    pub fn element(&self, i: AtomIndex) -> Element {
        *self.graph.node_weight(i.node()).expect("Valid atom index")
    }

    pub fn bond(&self, a: AtomIndex, b: AtomIndex) -> Option<BondType> {
        self.graph
            .find_edge(a.node(), b.node())
            .and_then(|e| self.graph.edge_weight(e))
            .copied()
    }

    pub fn atoms(&self) -> impl Iterator<Item = AtomIndex> + '_ {
        self.graph.node_indices().map(|n| AtomIndex(n.index()))
    }

    pub fn adjacent(&self, i: AtomIndex) -> impl Iterator<Item = AtomIndex> + Clone + '_ {
        self.graph.neighbors(i.node()).map(|n| AtomIndex(n.index()))
    }

    pub fn bonds(&self) -> impl Iterator<Item = (AtomIndex, AtomIndex, BondType)> + '_ {
        use petgraph::visit::{EdgeRef, IntoEdgeReferences};
        self.graph.edge_references().map(|e| {
            (
                AtomIndex(e.source().index()),
                AtomIndex(e.target().index()),
                *e.weight(),
            )
        })
    }

    pub fn set_atom_stereo(&mut self, stereo: AtomStereo) {
        self.atom_stereo.insert(stereo.center, stereo);
    }

    pub fn add_bond_stereo(&mut self, stereo: BondStereo) {
        self.bond_stereo.push(stereo);
    }

    pub fn bond_stereo_on(&self, a: AtomIndex, b: AtomIndex) -> Option<&BondStereo> {
        self.bond_stereo
            .iter()
            .find(|s| s.axis == (a, b) || s.axis == (b, a))
    }

    /// Whether all stereocenters carry an assignment
    pub fn fully_assigned(&self) -> bool {
        self.atom_stereo.values().all(|s| s.assignment.is_some())
            && self.bond_stereo.iter().all(|s| s.assignment.is_some())
    }

    /// Choose uniformly among permissible assignments for all unassigned
    /// stereocenters
    pub fn assign_unassigned<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for stereo in self.atom_stereo.values_mut() {
            if stereo.assignment.is_none() && !stereo.placements.is_empty() {
                stereo.assignment = Some(rng.gen_range(0..stereo.placements.len()));
            }
        }
        for stereo in self.bond_stereo.iter_mut() {
            if stereo.assignment.is_none() && !stereo.states.is_empty() {
                stereo.assignment = Some(rng.gen_range(0..stereo.states.len()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_basics() {
        let mut mol = Molecule::new();
        let c = mol.add_atom(Element::C);
        let o = mol.add_atom(Element::O);
        mol.add_bond(c, o, BondType::Double);

        assert_eq!(mol.n(), 2);
        assert_eq!(mol.element(c), Element::C);
        assert_eq!(mol.bond(c, o), Some(BondType::Double));
        assert_eq!(mol.bond(o, c), Some(BondType::Double));
        assert_eq!(mol.adjacent(c).count(), 1);
    }

    #[test]
    fn graph_iteration_surfaces() {
        let mut mol = Molecule::new();
        let c = mol.add_atom(Element::C);
        let h1 = mol.add_atom(Element::H);
        let h2 = mol.add_atom(Element::H);
        mol.add_bond(c, h1, BondType::Single);
        mol.add_bond(c, h2, BondType::Single);

        assert_eq!(mol.bonds().count(), 2);

        // Neighbor iteration supports combinatorial reuse
        let pairs: Vec<(AtomIndex, AtomIndex)> =
            itertools::Itertools::tuple_combinations(mol.adjacent(c)).collect();
        assert_eq!(pairs.len(), 1);
        let (a, b) = pairs[0];
        assert!((a, b) == (h1, h2) || (a, b) == (h2, h1));
    }

    #[test]
    fn mirror_assignment_flips_placement() {
        let mut mol = Molecule::new();
        let c = mol.add_atom(Element::C);
        let subs: Vec<AtomIndex> = [Element::H, Element::F, Element::Cl, Element::Br]
            .into_iter()
            .map(|e| {
                let a = mol.add_atom(e);
                mol.add_bond(c, a, BondType::Single);
                a
            })
            .collect();

        let stereo =
            AtomStereo::monodentate(c, Name::Tetrahedron, &subs).with_mirror_assignments();
        assert_eq!(stereo.placements.len(), 2);
        assert!(stereo.assignment.is_none());
        assert_ne!(stereo.placements[0], stereo.placements[1]);
    }

    #[test]
    fn staggered_state_fit() {
        let mut mol = Molecule::new();
        let atoms: Vec<AtomIndex> = (0..4).map(|_| mol.add_atom(Element::C)).collect();
        let stereo = BondStereo::staggered(
            (atoms[1], atoms[2]),
            vec![atoms[0]],
            vec![atoms[3]],
        );

        // Build anti-periplanar positions
        let positions = PositionCollection::from_column_slice(&[
            1.0, 1.0, 0.0, //
            1.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, //
            -1.0, -1.0, 0.0,
        ]);
        approx::assert_relative_eq!(stereo.angle(&positions).abs(), PI, epsilon = 1e-12);
        assert_eq!(stereo.fit_state(&positions), Some(0));
    }
}
