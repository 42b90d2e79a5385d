//! Small geometry helpers for distance modeling and refinement

extern crate nalgebra as na;

use std::f64::consts::PI;

type Vector3 = na::Vector3<f64>;

/// Signed volume of the tetrahedron spanned by four points
///
/// Positive if `d` lies below the plane of `(a, b, c)` wound
/// counterclockwise.
pub fn signed_tetrahedron_volume<S>(
    a: na::Matrix<f64, na::Const<3>, na::Const<1>, S>,
    b: na::Matrix<f64, na::Const<3>, na::Const<1>, S>,
    c: na::Matrix<f64, na::Const<3>, na::Const<1>, S>,
    d: na::Matrix<f64, na::Const<3>, na::Const<1>, S>,
) -> f64
where
    S: na::Storage<f64, na::Const<3>, na::Const<1>>,
{
    (&a - &d).dot(&(&b - &d).cross(&(&c - &d))) / 6.0
}

/// Signed volume over an array of corner positions
pub fn signed_tetrahedron_volume_with_array<S>(
    positions: [na::Matrix<f64, na::Const<3>, na::Const<1>, S>; 4],
) -> f64
where
    S: na::Storage<f64, na::Const<3>, na::Const<1>> + Clone,
{
    let [a, b, c, d] = positions;
    signed_tetrahedron_volume(a, b, c, d)
}

/// Signed dihedral angle over the four-point sequence, in (-π, π]
pub fn dihedral(a: &Vector3, b: &Vector3, c: &Vector3, d: &Vector3) -> f64 {
    let f = a - b;
    let g = b - c;
    let h = d - c;

    let m = f.cross(&g);
    let n = h.cross(&g);

    // atan2 formulation is stable near 0 and π
    (m.cross(&n).dot(&g) / g.norm()).atan2(m.dot(&n))
}

/// Third side length from two sides and their enclosed angle
pub fn law_of_cosines(a: f64, b: f64, gamma: f64) -> f64 {
    (a.powi(2) + b.powi(2) - 2.0 * a * b * gamma.cos())
        .max(0.0)
        .sqrt()
}

/// 1-4 distance in a four-atom chain from the three chain lengths, the two
/// inner angles and the dihedral angle
pub fn dihedral_length(a: f64, b: f64, c: f64, alpha: f64, beta: f64, phi: f64) -> f64 {
    let square = a.powi(2) + b.powi(2) + c.powi(2)
        - 2.0 * a * b * alpha.cos()
        - 2.0 * b * c * beta.cos()
        + 2.0 * a * c * (alpha.cos() * beta.cos() - alpha.sin() * beta.sin() * phi.cos());
    square.max(0.0).sqrt()
}

/// Difference between two angles wrapped into (-π, π]
pub fn signed_angle_difference(phi: f64, psi: f64) -> f64 {
    let mut delta = phi - psi;
    if delta > PI {
        delta -= 2.0 * PI;
    } else if delta <= -PI {
        delta += 2.0 * PI;
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn dihedral_signs() {
        let a = Vector3::new(1.0, 1.0, 0.0);
        let b = Vector3::new(1.0, 0.0, 0.0);
        let c = Vector3::new(0.0, 0.0, 0.0);

        let trans = Vector3::new(-1.0, -1.0, 0.0);
        approx::assert_relative_eq!(dihedral(&a, &b, &c, &trans).abs(), PI, epsilon = 1e-12);

        let cis = Vector3::new(-1.0, 1.0, 0.0);
        approx::assert_relative_eq!(dihedral(&a, &b, &c, &cis), 0.0, epsilon = 1e-12);

        let up = Vector3::new(0.0, 0.0, 1.0);
        approx::assert_relative_eq!(
            dihedral(&a, &b, &c, &up).abs(),
            FRAC_PI_2,
            epsilon = 1e-12
        );
    }

    #[test]
    fn dihedral_length_matches_construction() {
        // Explicitly place a four-atom chain and compare against the closed
        // form
        let (a, b, c): (f64, f64, f64) = (1.5, 1.4, 1.1);
        let (alpha, beta): (f64, f64) = (1.9, 2.0);
        for phi in [0.0, 0.3, 1.2, 2.5, PI] {
            let p1 = Vector3::new(a * alpha.sin(), a * alpha.cos(), 0.0);
            let p2 = Vector3::zeros();
            let p3 = Vector3::new(0.0, b, 0.0);
            let p4 = p3 + Vector3::new(
                c * beta.sin() * phi.cos(),
                -c * beta.cos(),
                c * beta.sin() * phi.sin(),
            );

            approx::assert_relative_eq!(
                (p4 - p1).norm(),
                dihedral_length(a, b, c, alpha, beta, phi),
                epsilon = 1e-10
            );
            approx::assert_relative_eq!(
                dihedral(&p1, &p2, &p3, &p4).abs(),
                phi,
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn angle_difference_wraps() {
        approx::assert_relative_eq!(signed_angle_difference(3.0, -3.0), 6.0 - 2.0 * PI);
        approx::assert_relative_eq!(signed_angle_difference(-3.0, 3.0), 2.0 * PI - 6.0);
        approx::assert_relative_eq!(signed_angle_difference(0.5, 0.2), 0.3);
    }
}
