//! Beam macro-particles: full 3-D state, pushed once per time step with
//! subcycling, deposited slice by slice into the beam current components.

use ndarray::Array4;
use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::constants::PhysConst;
use crate::dispatch_depos_order;
use crate::fields::slices::{SliceRole, Slices};
use crate::grid::{Geometry, SliceBox};
use crate::particles::shape::compute_shape_factor;
use crate::particles::{gather_fields, FieldViews};

pub struct BeamParticles {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub ux: Vec<f64>,
    pub uy: Vec<f64>,
    pub uz: Vec<f64>,
    pub w: Vec<f64>,
    pub id: Vec<i64>,
    pub charge: f64,
    pub mass: f64,
    pub n_subcycles: usize,
    pub do_z_push: bool,
}

impl BeamParticles {
    /// A Gaussian bunch in position and momentum. Momenta are given in
    /// units of c (normalized u = gamma v / c) and stored as gamma v; the
    /// weight distributes the integrated peak density over the macros.
    #[allow(clippy::too_many_arguments)]
    pub fn new_gaussian<R: Rng>(
        num_particles: usize,
        position_mean: [f64; 3],
        position_std: [f64; 3],
        u_mean: [f64; 3],
        u_std: [f64; 3],
        density: f64,
        pc: &PhysConst,
        rng: &mut R,
    ) -> BeamParticles {
        let mut b = BeamParticles {
            x: Vec::with_capacity(num_particles),
            y: Vec::with_capacity(num_particles),
            z: Vec::with_capacity(num_particles),
            ux: Vec::with_capacity(num_particles),
            uy: Vec::with_capacity(num_particles),
            uz: Vec::with_capacity(num_particles),
            w: Vec::with_capacity(num_particles),
            id: Vec::with_capacity(num_particles),
            charge: pc.q_e,
            mass: pc.m_e,
            n_subcycles: 1,
            do_z_push: true,
        };

        let total = density
            * (2.0 * std::f64::consts::PI).powf(1.5)
            * position_std[0]
            * position_std[1]
            * position_std[2];
        let weight = total / num_particles as f64;

        for ip in 0..num_particles {
            let gauss = |rng: &mut R| -> f64 { rng.sample(StandardNormal) };
            b.x.push(position_mean[0] + position_std[0] * gauss(rng));
            b.y.push(position_mean[1] + position_std[1] * gauss(rng));
            b.z.push(position_mean[2] + position_std[2] * gauss(rng));
            b.ux.push((u_mean[0] + u_std[0] * gauss(rng)) * pc.c);
            b.uy.push((u_mean[1] + u_std[1] * gauss(rng)) * pc.c);
            b.uz.push((u_mean[2] + u_std[2] * gauss(rng)) * pc.c);
            b.w.push(weight);
            b.id.push(ip as i64 + 1);
        }
        b
    }

    pub fn empty(pc: &PhysConst) -> BeamParticles {
        BeamParticles {
            x: Vec::new(),
            y: Vec::new(),
            z: Vec::new(),
            ux: Vec::new(),
            uy: Vec::new(),
            uz: Vec::new(),
            w: Vec::new(),
            id: Vec::new(),
            charge: pc.q_e,
            mass: pc.m_e,
            n_subcycles: 1,
            do_z_push: true,
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Marks particles leaving the transverse domain invalid; positions are
    /// wrapped instead on a periodic box.
    fn set_position_enforce_bc(
        bx: &SliceBox,
        x: &mut f64,
        y: &mut f64,
        id: &mut i64,
    ) -> bool {
        let lx = bx.nx as f64 * bx.dx;
        let ly = bx.ny as f64 * bx.dy;
        if bx.periodic {
            while *x < bx.x_lo {
                *x += lx;
            }
            while *x >= bx.x_lo + lx {
                *x -= lx;
            }
            while *y < bx.y_lo {
                *y += ly;
            }
            while *y >= bx.y_lo + ly {
                *y -= ly;
            }
            false
        } else if *x < bx.x_lo || *x >= bx.x_lo + lx || *y < bx.y_lo || *y >= bx.y_lo + ly {
            *id = -id.abs();
            true
        } else {
            false
        }
    }

    /// Pushes the particles of one slice bin through a full time step,
    /// subcycled: half transverse position, field gather, transverse
    /// momentum update, mid-step longitudinal momentum, full position.
    pub fn advance_slice(
        &mut self,
        indices: &[u32],
        slices: &Slices,
        bx: &SliceBox,
        pc: &PhysConst,
        dt_step: f64,
        depos_order: usize,
    ) {
        dispatch_depos_order!(
            depos_order,
            advance_slice_impl(self, indices, slices, bx, pc, dt_step)
        )
    }

    /// Deposits the particles of one slice bin into the beam current
    /// components on This.
    pub fn deposit_slice(
        &self,
        indices: &[u32],
        slices: &mut Slices,
        bx: &SliceBox,
        pc: &PhysConst,
        dz: f64,
        depos_order: usize,
    ) {
        dispatch_depos_order!(
            depos_order,
            deposit_slice_impl(self, indices, slices, bx, pc, dz)
        )
    }
}

fn advance_slice_impl<const ORDER: usize>(
    b: &mut BeamParticles,
    indices: &[u32],
    slices: &Slices,
    bx: &SliceBox,
    pc: &PhysConst,
    dt_step: f64,
) {
    let views = FieldViews::from_slices(slices);
    let dt = dt_step / b.n_subcycles as f64;
    let clightsq = 1.0 / (pc.c * pc.c);
    let charge_mass_ratio = b.charge / b.mass;
    let do_z_push = b.do_z_push;
    let n_subcycles = b.n_subcycles;

    for &idx in indices {
        let ip = idx as usize;
        if b.id[ip] < 0 {
            continue;
        }
        let mut xp = b.x[ip];
        let mut yp = b.y[ip];
        let mut zp = b.z[ip];
        let mut ux = b.ux[ip];
        let mut uy = b.uy[ip];
        let mut uz = b.uz[ip];
        let mut left = false;

        for _ in 0..n_subcycles {
            let gammap_inv = 1.0
                / (1.0 + ux * ux * clightsq + uy * uy * clightsq + uz * uz * clightsq).sqrt();

            // half step in the transverse position only; z follows in one
            // piece at the end of the subcycle
            xp += dt * 0.5 * ux * gammap_inv;
            yp += dt * 0.5 * uy * gammap_inv;
            if BeamParticles::set_position_enforce_bc(bx, &mut xp, &mut yp, &mut b.id[ip]) {
                left = true;
                break;
            }

            let f = gather_fields::<ORDER>(xp, yp, &views, bx);
            let (exmby, eypbx, ez, bxf, byf, _bzf) = (f[0], f[1], f[2], f[3], f[4], f[5]);

            let ux_next = ux + dt * charge_mass_ratio * (exmby + (pc.c - uz * gammap_inv) * byf);
            let uy_next = uy + dt * charge_mass_ratio * (eypbx + (uz * gammap_inv - pc.c) * bxf);

            let ux_intermediate = 0.5 * (ux_next + ux);
            let uy_intermediate = 0.5 * (uy_next + uy);
            let uz_intermediate = uz + dt * 0.5 * charge_mass_ratio * ez;

            let gamma_intermediate_inv = 1.0
                / (1.0
                    + ux_intermediate * ux_intermediate * clightsq
                    + uy_intermediate * uy_intermediate * clightsq
                    + uz_intermediate * uz_intermediate * clightsq)
                    .sqrt();

            let uz_next = uz + dt * charge_mass_ratio
                * (ez + (ux_intermediate * byf - uy_intermediate * bxf) * gamma_intermediate_inv);

            let gamma_next_inv = 1.0
                / (1.0
                    + ux_next * ux_next * clightsq
                    + uy_next * uy_next * clightsq
                    + uz_next * uz_next * clightsq)
                    .sqrt();

            xp += dt * 0.5 * ux_next * gamma_next_inv;
            yp += dt * 0.5 * uy_next * gamma_next_inv;
            if do_z_push {
                // first-order longitudinal update in the co-moving frame
                zp += dt * (uz_next * gamma_next_inv - pc.c);
            }
            if BeamParticles::set_position_enforce_bc(bx, &mut xp, &mut yp, &mut b.id[ip]) {
                left = true;
                break;
            }
            ux = ux_next;
            uy = uy_next;
            uz = uz_next;
        }
        if left {
            continue;
        }
        b.x[ip] = xp;
        b.y[ip] = yp;
        b.z[ip] = zp;
        b.ux[ip] = ux;
        b.uy[ip] = uy;
        b.uz[ip] = uz;
    }
}

fn deposit_slice_impl<const ORDER: usize>(
    b: &BeamParticles,
    indices: &[u32],
    slices: &mut Slices,
    bx: &SliceBox,
    pc: &PhysConst,
    dz: f64,
) {
    let g = bx.ghost as isize;
    let invvol = 1.0 / (bx.dx * bx.dy * dz);
    let clightsq = 1.0 / (pc.c * pc.c);

    // the four component writes go in two passes over the bin, one
    // component pair at a time
    let (mut jx, mut jy) = slices.pair_mut(SliceRole::This, "jx_beam", "jy_beam");
    for &idx in indices {
        let ip = idx as usize;
        if b.id[ip] < 0 {
            continue;
        }
        let gamma_inv = 1.0
            / (1.0
                + b.ux[ip] * b.ux[ip] * clightsq
                + b.uy[ip] * b.uy[ip] * clightsq
                + b.uz[ip] * b.uz[ip] * clightsq)
                .sqrt();
        let wq = b.charge * b.w[ip] * invvol;

        let mut sx = [0.0; 4];
        let mut sy = [0.0; 4];
        let xmid = (b.x[ip] - bx.x_lo) / bx.dx - 0.5;
        let ymid = (b.y[ip] - bx.y_lo) / bx.dy - 0.5;
        let i0 = compute_shape_factor::<ORDER>(&mut sx, xmid);
        let j0 = compute_shape_factor::<ORDER>(&mut sy, ymid);

        for ky in 0..=ORDER {
            let jj = (j0 + ky as isize + g) as usize;
            for kx in 0..=ORDER {
                let ii = (i0 + kx as isize + g) as usize;
                let s = sx[kx] * sy[ky];
                jx[[jj, ii]] += wq * b.ux[ip] * gamma_inv * s;
                jy[[jj, ii]] += wq * b.uy[ip] * gamma_inv * s;
            }
        }
    }
    drop(jx);
    drop(jy);

    let (mut jz, mut rho) = slices.pair_mut(SliceRole::This, "jz_beam", "rho_beam");
    for &idx in indices {
        let ip = idx as usize;
        if b.id[ip] < 0 {
            continue;
        }
        let gamma_inv = 1.0
            / (1.0
                + b.ux[ip] * b.ux[ip] * clightsq
                + b.uy[ip] * b.uy[ip] * clightsq
                + b.uz[ip] * b.uz[ip] * clightsq)
                .sqrt();
        let wq = b.charge * b.w[ip] * invvol;

        let mut sx = [0.0; 4];
        let mut sy = [0.0; 4];
        let xmid = (b.x[ip] - bx.x_lo) / bx.dx - 0.5;
        let ymid = (b.y[ip] - bx.y_lo) / bx.dy - 0.5;
        let i0 = compute_shape_factor::<ORDER>(&mut sx, xmid);
        let j0 = compute_shape_factor::<ORDER>(&mut sy, ymid);

        for ky in 0..=ORDER {
            let jj = (j0 + ky as isize + g) as usize;
            for kx in 0..=ORDER {
                let ii = (i0 + kx as isize + g) as usize;
                let s = sx[kx] * sy[ky];
                jz[[jj, ii]] += wq * b.uz[ip] * gamma_inv * s;
                rho[[jj, ii]] += wq * s;
            }
        }
    }
}

/// Beam currents for a whole slab, deposited off the critical path when
/// slice deposition is disabled and copied into This one slice at a time.
pub struct BeamCurrentStore {
    data: Array4<f64>,
    k_lo: usize,
    nyf: usize,
    nxf: usize,
}

impl BeamCurrentStore {
    pub fn new(geom: &Geometry, bx: &SliceBox) -> BeamCurrentStore {
        let (nyf, nxf) = bx.full_dims();
        BeamCurrentStore {
            data: Array4::zeros((4, geom.slab_size_z, nyf, nxf)),
            k_lo: geom.slab_range().0,
            nyf,
            nxf,
        }
    }

    /// Deposits every valid beam particle of this slab into its z-plane.
    pub fn deposit_all(
        &mut self,
        beam: &BeamParticles,
        geom: &Geometry,
        bx: &SliceBox,
        pc: &PhysConst,
        depos_order: usize,
    ) {
        self.data.fill(0.0);
        let dz = geom.cell_size[2];
        let (k_lo, k_hi) = geom.slab_range();
        let g = bx.ghost as isize;
        let invvol = 1.0 / (bx.dx * bx.dy * dz);
        let clightsq = 1.0 / (pc.c * pc.c);

        for ip in 0..beam.len() {
            if beam.id[ip] < 0 {
                continue;
            }
            let k = geom.slice_of(beam.z[ip]);
            if k < k_lo as isize || k > k_hi as isize {
                continue;
            }
            let kk = k as usize - k_lo;
            let gamma_inv = 1.0
                / (1.0
                    + beam.ux[ip] * beam.ux[ip] * clightsq
                    + beam.uy[ip] * beam.uy[ip] * clightsq
                    + beam.uz[ip] * beam.uz[ip] * clightsq)
                    .sqrt();
            let wq = beam.charge * beam.w[ip] * invvol;

            let mut sx = [0.0; 4];
            let mut sy = [0.0; 4];
            let xmid = (beam.x[ip] - bx.x_lo) / bx.dx - 0.5;
            let ymid = (beam.y[ip] - bx.y_lo) / bx.dy - 0.5;
            let (i0, j0, n): (isize, isize, usize) = match depos_order {
                0 => (compute_shape_factor::<0>(&mut sx, xmid), compute_shape_factor::<0>(&mut sy, ymid), 0),
                1 => (compute_shape_factor::<1>(&mut sx, xmid), compute_shape_factor::<1>(&mut sy, ymid), 1),
                2 => (compute_shape_factor::<2>(&mut sx, xmid), compute_shape_factor::<2>(&mut sy, ymid), 2),
                _ => (compute_shape_factor::<3>(&mut sx, xmid), compute_shape_factor::<3>(&mut sy, ymid), 3),
            };
            for ky in 0..=n {
                let jj = (j0 + ky as isize + g) as usize;
                for kx in 0..=n {
                    let ii = (i0 + kx as isize + g) as usize;
                    let s = sx[kx] * sy[ky];
                    self.data[[0, kk, jj, ii]] += wq * beam.ux[ip] * gamma_inv * s;
                    self.data[[1, kk, jj, ii]] += wq * beam.uy[ip] * gamma_inv * s;
                    self.data[[2, kk, jj, ii]] += wq * beam.uz[ip] * gamma_inv * s;
                    self.data[[3, kk, jj, ii]] += wq * s;
                }
            }
        }
    }

    /// Copies the stored currents of one global slice into This.
    pub fn copy_to_slice(&self, islice: usize, slices: &mut Slices) {
        let kk = islice - self.k_lo;
        for (n, name) in ["jx_beam", "jy_beam", "jz_beam", "rho_beam"].iter().enumerate() {
            let mut arr = slices.get_mut(SliceRole::This, name);
            for jj in 0..self.nyf {
                for ii in 0..self.nxf {
                    arr[[jj, ii]] = self.data[[n, kk, jj, ii]];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::make_constants_normalized;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn test_box() -> SliceBox {
        SliceBox {
            nx: 32,
            ny: 32,
            ghost: 3,
            dx: 0.5,
            dy: 0.5,
            x_lo: -8.0,
            y_lo: -8.0,
            periodic: false,
        }
    }

    #[test]
    fn gaussian_moments_are_reproduced() {
        let pc = make_constants_normalized();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let b = BeamParticles::new_gaussian(
            20_000,
            [0.0, 0.0, 0.0],
            [1.0, 1.0, 1.41],
            [0.0, 0.0, 1000.0],
            [0.0, 0.0, 10.0],
            1.0,
            &pc,
            &mut rng,
        );
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        let std = |v: &[f64]| {
            let m = mean(v);
            (v.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / v.len() as f64).sqrt()
        };
        assert!(mean(&b.x).abs() < 0.05);
        assert!((std(&b.x) - 1.0).abs() < 0.05);
        assert!((std(&b.z) - 1.41).abs() < 0.07);
        assert!((mean(&b.uz) - 1000.0).abs() < 0.5);
        // total macro-weight equals the integrated density
        let total: f64 = b.w.iter().sum();
        let expect = (2.0 * std::f64::consts::PI).powf(1.5) * 1.41;
        assert!((total - expect).abs() < 1.0e-9 * expect);
    }

    #[test]
    fn uniform_ez_accelerates_beam() {
        let pc = make_constants_normalized();
        let bx = test_box();
        let mut slices = Slices::new(bx, false);
        slices.get_mut(SliceRole::This, "Ez").fill(0.5);

        let mut b = BeamParticles::empty(&pc);
        b.charge = -1.0;
        b.x.push(0.1);
        b.y.push(0.1);
        b.z.push(0.0);
        b.ux.push(0.0);
        b.uy.push(0.0);
        b.uz.push(100.0);
        b.w.push(1.0);
        b.id.push(1);
        b.n_subcycles = 4;

        let dt = 0.1;
        let indices = [0u32];
        b.advance_slice(&indices, &slices, &bx, &pc, dt, 2);

        // duz/dt = q/m Ez with q/m = -1 in normalized units
        let expect = 100.0 + dt * (-1.0) * 0.5;
        assert!((b.uz[0] - expect).abs() < 1.0e-9, "uz = {}", b.uz[0]);
    }

    #[test]
    fn slice_deposition_conserves_charge() {
        let pc = make_constants_normalized();
        let bx = test_box();
        let mut slices = Slices::new(bx, false);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let b = BeamParticles::new_gaussian(
            500,
            [0.0, 0.0, 0.0],
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 100.0],
            [0.0, 0.0, 0.0],
            1.0,
            &pc,
            &mut rng,
        );
        let dz = 0.5;
        let indices: Vec<u32> = (0..b.len() as u32).collect();
        b.deposit_slice(&indices, &mut slices, &bx, &pc, dz, 2);

        let total: f64 = slices.get(SliceRole::This, "rho_beam").iter().sum();
        let expect: f64 = b.w.iter().sum::<f64>() * b.charge / (bx.dx * bx.dy * dz);
        assert!(
            (total - expect).abs() < 1.0e-9 * expect.abs(),
            "total = {}, expect = {}",
            total,
            expect
        );
    }
}
