//! Element data consumed by distance modeling

/// Subset of the periodic table sufficient for typical organic and
/// main-group inorganic graphs
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Element {
    H,
    B,
    C,
    N,
    O,
    F,
    Si,
    P,
    S,
    Cl,
    Fe,
    Br,
    I,
}

impl Element {
    /// Single-bond covalent radius in Ångström
    pub fn covalent_radius(&self) -> f64 {
        match self {
            Element::H => 0.31,
            Element::B => 0.84,
            Element::C => 0.76,
            Element::N => 0.71,
            Element::O => 0.66,
            Element::F => 0.57,
            Element::Si => 1.11,
            Element::P => 1.07,
            Element::S => 1.05,
            Element::Cl => 1.02,
            Element::Fe => 1.32,
            Element::Br => 1.20,
            Element::I => 1.39,
        }
    }

    /// Van-der-Waals radius in Ångström
    pub fn vdw_radius(&self) -> f64 {
        match self {
            Element::H => 1.09,
            Element::B => 1.92,
            Element::C => 1.70,
            Element::N => 1.55,
            Element::O => 1.52,
            Element::F => 1.47,
            Element::Si => 2.10,
            Element::P => 1.80,
            Element::S => 1.80,
            Element::Cl => 1.75,
            Element::Fe => 2.04,
            Element::Br => 1.85,
            Element::I => 1.98,
        }
    }
}

/// Fractional bond order correction strength for bond length estimation
pub const BOND_ORDER_CORRECTION_LAMBDA: f64 = 0.1332;

/// Model an equilibrium bond length from covalent radii and fractional bond
/// order
///
/// The radius sum is contracted logarithmically with increasing bond order.
pub fn bond_distance(a: Element, b: Element, order: f64) -> f64 {
    debug_assert!(order > 0.0);
    let radius_sum = a.covalent_radius() + b.covalent_radius();
    radius_sum - BOND_ORDER_CORRECTION_LAMBDA * radius_sum * order.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bond_distance_order_contraction() {
        let single = bond_distance(Element::C, Element::C, 1.0);
        let double = bond_distance(Element::C, Element::C, 2.0);
        let triple = bond_distance(Element::C, Element::C, 3.0);

        approx::assert_relative_eq!(single, 1.52, epsilon = 0.1);
        assert!(double < single);
        assert!(triple < double);

        // Unit order leaves the radius sum untouched
        approx::assert_relative_eq!(
            single,
            Element::C.covalent_radius() * 2.0
        );
    }
}
