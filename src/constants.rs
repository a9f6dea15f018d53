//! Physical constants, in SI and in plasma-normalized units.

pub const SPEED_OF_LIGHT: f64 = 2.99792458e8;
pub const SPEED_OF_LIGHT_SQD: f64 = SPEED_OF_LIGHT * SPEED_OF_LIGHT;
pub const VACUUM_PERMITTIVITY: f64 = 8.8541878128e-12;
pub const VACUUM_PERMEABILITY: f64 = 1.25663706212e-6;
pub const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;
pub const ELECTRON_CHARGE: f64 = -ELEMENTARY_CHARGE;
pub const ELECTRON_MASS: f64 = 9.1093837015e-31;
pub const PROTON_MASS: f64 = 1.67262192369e-27;

/// The constants table handed to every kernel. Selected once at startup
/// from `hipace.normalized_units` and passed by reference thereafter.
#[derive(Copy, Clone, Debug)]
pub struct PhysConst {
    pub c: f64,
    pub ep0: f64,
    pub mu0: f64,
    pub q_e: f64,
    pub m_e: f64,
    pub m_p: f64,
}

pub fn make_constants_si() -> PhysConst {
    PhysConst {
        c: SPEED_OF_LIGHT,
        ep0: VACUUM_PERMITTIVITY,
        mu0: VACUUM_PERMEABILITY,
        q_e: ELEMENTARY_CHARGE,
        m_e: ELECTRON_MASS,
        m_p: PROTON_MASS,
    }
}

/// In normalized units lengths are in c/omega_p, densities in n_0, fields
/// in the cold wavebreaking limit. All table entries collapse to unity.
pub fn make_constants_normalized() -> PhysConst {
    PhysConst {
        c: 1.0,
        ep0: 1.0,
        mu0: 1.0,
        q_e: 1.0,
        m_e: 1.0,
        m_p: PROTON_MASS / ELECTRON_MASS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_wave_equation_closure() {
        // mu0 ep0 c^2 = 1 must hold in both unit systems
        let si = make_constants_si();
        assert!((si.mu0 * si.ep0 * si.c * si.c - 1.0).abs() < 1.0e-9);
        let norm = make_constants_normalized();
        assert!((norm.mu0 * norm.ep0 * norm.c * norm.c - 1.0).abs() < 1.0e-15);
    }
}
