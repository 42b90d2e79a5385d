//! Idealized local shape data
//!
//! Shapes supply the idealized angles between substituent sites and the
//! chirality-defining tetrahedra that distance modeling consumes. The
//! combinatorics of stereopermutation enumeration are not handled here;
//! consumers carry their own site placements.

extern crate nalgebra as na;

pub type Matrix3N = na::Matrix3xX<f64>;

use std::f64::consts::SQRT_2;

const SQRT_3: f64 = 1.7320508075688772;
const PENTAGON_X1: f64 = 0.309016994374947;
const PENTAGON_Y1: f64 = 0.951056516295154;
const PENTAGON_X2: f64 = -0.809016994374947;
const PENTAGON_Y2: f64 = 0.587785252292473;

#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Name {
    // 2
    Line,
    Bent,
    // 3
    EquilateralTriangle,
    VacantTetrahedron,
    T,
    // 4
    Tetrahedron,
    Square,
    Seesaw,
    TrigonalPyramid,
    // 5
    SquarePyramid,
    TrigonalBipyramid,
    Pentagon,
    // 6
    Octahedron,
}

impl Name {
    pub fn repr(&self) -> &'static str {
        match self {
            Name::Line => "line",
            Name::Bent => "bent",
            Name::EquilateralTriangle => "triangle",
            Name::VacantTetrahedron => "vacant tetrahedron",
            Name::T => "T-shaped",
            Name::Tetrahedron => "tetrahedron",
            Name::Square => "square",
            Name::Seesaw => "seesaw",
            Name::TrigonalPyramid => "trigonal pyramid",
            Name::SquarePyramid => "square pyramid",
            Name::TrigonalBipyramid => "trigonal bipyramid",
            Name::Pentagon => "pentagon",
            Name::Octahedron => "octahedron",
        }
    }
}

/// Corner of a chirality-defining tetrahedron
///
/// The central atom is a structurally valid corner, not an out-of-band
/// sentinel index.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Particle {
    Vertex(usize),
    Origin,
}

/// Vertex permutation exposing a shape's mirror symmetry element
pub type Mirror = Vec<usize>;

pub struct Shape {
    pub name: Name,
    /// Unit sphere coordinates without a centroid
    pub coordinates: Matrix3N,
    /// Minimal set of tetrahedra required to distinguish volumes in DG
    pub tetrahedra: Vec<[Particle; 4]>,
    /// Mirror symmetry element expressed by vertex permutation, if present
    pub mirror: Option<Mirror>,
}

impl Shape {
    /// Number of vertices of the shape
    pub fn size(&self) -> usize {
        self.coordinates.ncols()
    }

    /// Idealized angle between two vertices, seen from the shape center
    pub fn angle(&self, i: usize, j: usize) -> f64 {
        debug_assert!(i != j);
        let a = self.coordinates.column(i);
        let b = self.coordinates.column(j);
        a.dot(&b).clamp(-1.0, 1.0).acos()
    }

    /// Position of a tetrahedron corner in the idealized coordinates
    pub fn particle_position(&self, p: Particle) -> na::Vector3<f64> {
        match p {
            Particle::Vertex(v) => self.coordinates.column(v).into(),
            Particle::Origin => na::Vector3::zeros(),
        }
    }
}

use Particle::{Origin, Vertex};

lazy_static! {
    pub static ref LINE: Shape = Shape {
        name: Name::Line,
        coordinates: Matrix3N::from_column_slice(&[
             1.0, 0.0, 0.0,
            -1.0, 0.0, 0.0
        ]),
        tetrahedra: vec![],
        mirror: None
    };

    /// Bent at 107°
    pub static ref BENT: Shape = Shape {
        name: Name::Bent,
        coordinates: Matrix3N::from_column_slice(&[
                           1.0,               0.0, 0.0,
            -0.292371704722737, 0.956304755963036, 0.0
        ]),
        tetrahedra: vec![],
        mirror: None
    };

    pub static ref EQUILATERAL_TRIANGLE: Shape = Shape {
        name: Name::EquilateralTriangle,
        coordinates: Matrix3N::from_column_slice(&[
             1.0,           0.0, 0.0,
            -0.5,  SQRT_3 / 2.0, 0.0,
            -0.5, -SQRT_3 / 2.0, 0.0
        ]),
        tetrahedra: vec![],
        mirror: None
    };

    /// Monovacant tetrahedron
    ///
    /// Widely called trigonal pyramidal, but easily confusable with a
    /// face-centered trigonal pyramid.
    pub static ref VACANT_TETRAHEDRON: Shape = Shape {
        name: Name::VacantTetrahedron,
        coordinates: Matrix3N::from_column_slice(&[
            0.0, -0.366501, 0.930418,
            0.805765, -0.366501, -0.465209,
            -0.805765, -0.366501, -0.465209
        ]),
        tetrahedra: vec![[Origin, Vertex(0), Vertex(1), Vertex(2)]],
        mirror: Some(vec![0, 2, 1])
    };

    pub static ref TSHAPE: Shape = Shape {
        name: Name::T,
        coordinates: Matrix3N::from_column_slice(&[
            -1.0,  0.0,  0.0,
             0.0,  1.0,  0.0,
             1.0,  0.0,  0.0,
        ]),
        tetrahedra: vec![],
        mirror: None
    };

    pub static ref TETRAHEDRON: Shape = Shape {
        name: Name::Tetrahedron,
        coordinates: Matrix3N::from_column_slice(&[
                 -SQRT_2 / 3.0,  SQRT_2 / SQRT_3, -1.0 / 3.0,
                           0.0,              0.0,        1.0,
            2.0 * SQRT_2 / 3.0,              0.0, -1.0 / 3.0,
                 -SQRT_2 / 3.0, -SQRT_2 / SQRT_3, -1.0 / 3.0
        ]),
        tetrahedra: vec![[Vertex(0), Vertex(1), Vertex(2), Vertex(3)]],
        mirror: Some(vec![0, 2, 1, 3])
    };

    pub static ref SQUARE: Shape = Shape {
        name: Name::Square,
        coordinates: Matrix3N::from_column_slice(&[
             1.0,  0.0,  0.0,
             0.0,  1.0,  0.0,
            -1.0,  0.0,  0.0,
             0.0, -1.0,  0.0
        ]),
        tetrahedra: vec![],
        mirror: None
    };

    /// Equatorially monovacant trigonal bipyramid
    pub static ref SEESAW: Shape = Shape {
        name: Name::Seesaw,
        coordinates: Matrix3N::from_column_slice(&[
             0.0,  1.0,           0.0,
             1.0,  0.0,           0.0,
            -0.5,  0.0, -SQRT_3 / 2.0,
             0.0, -1.0,           0.0
        ]),
        tetrahedra: vec![
            [Vertex(0), Origin, Vertex(1), Vertex(2)],
            [Origin, Vertex(3), Vertex(1), Vertex(2)]
        ],
        mirror: Some(vec![0, 2, 1, 3])
    };

    /// Face-centered trigonal pyramid (monovacant trigonal bipyramid)
    pub static ref TRIGONAL_PYRAMID: Shape = Shape {
        name: Name::TrigonalPyramid,
        coordinates: Matrix3N::from_column_slice(&[
             1.0,           0.0, 0.0,
            -0.5,  SQRT_3 / 2.0, 0.0,
            -0.5, -SQRT_3 / 2.0, 0.0,
             0.0,           0.0, 1.0
        ]),
        tetrahedra: vec![[Vertex(0), Vertex(1), Vertex(3), Vertex(2)]],
        mirror: Some(vec![0, 2, 1, 3])
    };

    /// J1 solid (central position is square-face centered)
    pub static ref SQUARE_PYRAMID: Shape = Shape {
        name: Name::SquarePyramid,
        coordinates: Matrix3N::from_column_slice(&[
             1.0,  0.0, 0.0,
             0.0,  1.0, 0.0,
            -1.0,  0.0, 0.0,
             0.0, -1.0, 0.0,
             0.0,  0.0, 1.0,
        ]),
        tetrahedra: vec![
            [Vertex(0), Vertex(1), Vertex(4), Origin],
            [Vertex(1), Vertex(2), Vertex(4), Origin],
            [Vertex(2), Vertex(3), Vertex(4), Origin],
            [Vertex(3), Vertex(0), Vertex(4), Origin],
        ],
        mirror: Some(vec![1, 0, 3, 2, 4])
    };

    pub static ref TRIGONAL_BIPYRAMID: Shape = Shape {
        name: Name::TrigonalBipyramid,
        coordinates: Matrix3N::from_column_slice(&[
             1.0,           0.0, 0.0,
            -0.5,  SQRT_3 / 2.0, 0.0,
            -0.5, -SQRT_3 / 2.0, 0.0,
             0.0,           0.0, 1.0,
             0.0,           0.0, -1.0
        ]),
        tetrahedra: vec![
            [Vertex(0), Vertex(1), Vertex(3), Vertex(2)],
            [Vertex(0), Vertex(1), Vertex(2), Vertex(4)]
        ],
        mirror: Some(vec![0, 2, 1, 3, 4])
    };

    pub static ref PENTAGON: Shape = Shape {
        name: Name::Pentagon,
        coordinates: Matrix3N::from_column_slice(&[
                    1.0,          0.0, 0.0,
            PENTAGON_X1,  PENTAGON_Y1, 0.0,
            PENTAGON_X2,  PENTAGON_Y2, 0.0,
            PENTAGON_X2, -PENTAGON_Y2, 0.0,
            PENTAGON_X1, -PENTAGON_Y1, 0.0
        ]),
        tetrahedra: vec![],
        mirror: None
    };

    pub static ref OCTAHEDRON: Shape = Shape {
        name: Name::Octahedron,
        coordinates: Matrix3N::from_column_slice(&[
            1.0,  0.0,  0.0,
            0.0,  1.0,  0.0,
           -1.0,  0.0,  0.0,
            0.0, -1.0,  0.0,
            0.0,  0.0,  1.0,
            0.0,  0.0, -1.0,
        ]),
        tetrahedra: vec![
            [Vertex(3), Vertex(0), Vertex(4), Origin],
            [Vertex(0), Vertex(1), Vertex(4), Origin],
            [Vertex(1), Vertex(2), Vertex(4), Origin],
            [Vertex(2), Vertex(3), Vertex(4), Origin],
            [Vertex(3), Vertex(0), Origin, Vertex(5)],
            [Vertex(0), Vertex(1), Origin, Vertex(5)],
            [Vertex(1), Vertex(2), Origin, Vertex(5)],
            [Vertex(2), Vertex(3), Origin, Vertex(5)],
        ],
        mirror: Some(vec![1, 0, 3, 2, 4, 5])
    };
}

pub fn shape_from_name(name: Name) -> &'static Shape {
    let shape: &Shape = match name {
        Name::Line => &LINE,
        Name::Bent => &BENT,
        Name::EquilateralTriangle => &EQUILATERAL_TRIANGLE,
        Name::VacantTetrahedron => &VACANT_TETRAHEDRON,
        Name::T => &TSHAPE,
        Name::Tetrahedron => &TETRAHEDRON,
        Name::Square => &SQUARE,
        Name::Seesaw => &SEESAW,
        Name::TrigonalPyramid => &TRIGONAL_PYRAMID,
        Name::SquarePyramid => &SQUARE_PYRAMID,
        Name::TrigonalBipyramid => &TRIGONAL_BIPYRAMID,
        Name::Pentagon => &PENTAGON,
        Name::Octahedron => &OCTAHEDRON,
    };
    debug_assert_eq!(shape.name, name);
    shape
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::signed_tetrahedron_volume_with_array;

    #[test]
    fn idealized_angles() {
        let tetrahedral: f64 = (-1.0f64 / 3.0).acos();
        for (i, j) in [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)] {
            approx::assert_relative_eq!(
                TETRAHEDRON.angle(i, j),
                tetrahedral,
                epsilon = 1e-6
            );
        }

        approx::assert_relative_eq!(
            OCTAHEDRON.angle(0, 1),
            std::f64::consts::FRAC_PI_2,
            epsilon = 1e-12
        );
        approx::assert_relative_eq!(
            OCTAHEDRON.angle(0, 2),
            std::f64::consts::PI,
            epsilon = 1e-12
        );
    }

    #[test]
    fn tetrahedra_positively_wound() {
        for name in [
            Name::VacantTetrahedron,
            Name::Tetrahedron,
            Name::Seesaw,
            Name::TrigonalPyramid,
            Name::SquarePyramid,
            Name::TrigonalBipyramid,
            Name::Octahedron,
        ] {
            let shape = shape_from_name(name);
            for tetrahedron in shape.tetrahedra.iter() {
                let volume = signed_tetrahedron_volume_with_array(
                    tetrahedron.map(|p| shape.particle_position(p)),
                );
                assert!(
                    volume > 0.0,
                    "Negative tetrahedron volume in {}",
                    shape.name.repr()
                );
            }
        }
    }

    #[test]
    fn unit_sphere_coordinates() {
        for name in [Name::Line, Name::Tetrahedron, Name::Octahedron, Name::Pentagon] {
            let shape = shape_from_name(name);
            for column in shape.coordinates.column_iter() {
                approx::assert_relative_eq!(column.norm(), 1.0, epsilon = 1e-6);
            }
        }
    }
}
