//! Non-zero Dirichlet boundaries for the transverse Poisson solves.
//!
//! Boundary values are folded into the source: the 5-point Laplacian at an
//! edge cell references one ghost value, so a known potential b in the ghost
//! cell becomes a `-b/dx^2` source correction at the edge. Two suppliers of
//! boundary values exist: a multipole expansion of the slice source itself
//! (open boundary, coarsest level only) and bilinear interpolation of an
//! already-solved coarser level (nested level).

use ndarray::{Array2, ArrayView2};
use rustfft::num_complex::Complex;

use crate::grid::SliceBox;

/// Complex multipole moments m = 0..17; 36 tracked reals.
pub const MULTIPOLE_ORDERS: usize = 18;

pub struct MultipoleCoeffs {
    pub c: [Complex<f64>; MULTIPOLE_ORDERS],
    x_center: f64,
    y_center: f64,
}

/// Reduces the interior source to its multipole moments about the box
/// center. Only cells within 95% of the minimum half-box radius contribute;
/// the monopole is dropped for sources that are transverse divergences
/// (Ez, Bz), whose net "charge" vanishes analytically.
pub fn multipole_moments(
    src: ArrayView2<f64>,
    bx: &SliceBox,
    zero_monopole: bool,
) -> MultipoleCoeffs {
    assert_eq!(src.dim(), (bx.ny, bx.nx));
    let r_max = 0.95 * bx.min_half_width();
    let r_max_sq = r_max * r_max;
    let (xc, yc) = (bx.x_center(), bx.y_center());
    let da = bx.dx * bx.dy;

    let mut c = [Complex::new(0.0, 0.0); MULTIPOLE_ORDERS];
    for j in 0..bx.ny {
        for i in 0..bx.nx {
            let s = src[[j, i]];
            if s == 0.0 {
                continue;
            }
            let z = Complex::new(bx.x_of(i) - xc, bx.y_of(j) - yc);
            if z.norm_sqr() > r_max_sq {
                continue;
            }
            let sda = s * da;
            let mut zp = Complex::new(1.0, 0.0);
            for cm in c.iter_mut() {
                *cm += sda * zp;
                zp *= z;
            }
        }
    }
    if zero_monopole {
        c[0] = Complex::new(0.0, 0.0);
    }
    MultipoleCoeffs { c, x_center: xc, y_center: yc }
}

impl MultipoleCoeffs {
    /// Evaluates the truncated expansion of the free-space potential,
    ///   phi(w) = (1/2pi) [ Q ln|w| - sum_m Re(c_m w^-m) / m ].
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        let w = Complex::new(x - self.x_center, y - self.y_center);
        let mut phi = self.c[0].re * w.norm().ln();
        let winv = w.inv();
        let mut wp = winv;
        for m in 1..MULTIPOLE_ORDERS {
            phi -= (self.c[m] * wp).re / m as f64;
            wp *= winv;
        }
        phi / (2.0 * std::f64::consts::PI)
    }
}

/// Writes non-zero Dirichlet values into the Poisson source: subtracts
/// `value/dx^2` along the x edges and `value/dy^2` along the y edges, with
/// `value` evaluated at the first ghost cell center.
pub fn set_boundary_condition<F>(staging: &mut Array2<f64>, bx: &SliceBox, boundary_value: F)
where
    F: Fn(f64, f64) -> f64,
{
    let (nx, ny) = (bx.nx, bx.ny);
    let dx2_inv = 1.0 / (bx.dx * bx.dx);
    let dy2_inv = 1.0 / (bx.dy * bx.dy);
    let x_ghost_lo = bx.x_lo - 0.5 * bx.dx;
    let x_ghost_hi = bx.x_lo + (nx as f64 + 0.5) * bx.dx;
    let y_ghost_lo = bx.y_lo - 0.5 * bx.dy;
    let y_ghost_hi = bx.y_lo + (ny as f64 + 0.5) * bx.dy;

    for j in 0..ny {
        let y = bx.y_of(j);
        staging[[j, 0]] -= boundary_value(x_ghost_lo, y) * dx2_inv;
        staging[[j, nx - 1]] -= boundary_value(x_ghost_hi, y) * dx2_inv;
    }
    for i in 0..nx {
        let x = bx.x_of(i);
        staging[[0, i]] -= boundary_value(x, y_ghost_lo) * dy2_inv;
        staging[[ny - 1, i]] -= boundary_value(x, y_ghost_hi) * dy2_inv;
    }
}

/// Open boundary: boundary values from the multipole expansion of the
/// source itself.
pub fn apply_open_boundary(staging: &mut Array2<f64>, bx: &SliceBox, zero_monopole: bool) {
    let coeffs = multipole_moments(staging.view(), bx, zero_monopole);
    set_boundary_condition(staging, bx, |x, y| coeffs.eval(x, y));
}

/// Bilinear interpolation of a coarse cell-centered field at an arbitrary
/// position, clamped to the coarse box.
pub fn interp_bilinear(field: ArrayView2<f64>, bx: &SliceBox, x: f64, y: f64) -> f64 {
    let fx = ((x - bx.x_lo) / bx.dx - 0.5)
        .max(0.0)
        .min(bx.nx as f64 - 1.0);
    let fy = ((y - bx.y_lo) / bx.dy - 0.5)
        .max(0.0)
        .min(bx.ny as f64 - 1.0);
    let i0 = (fx.floor() as usize).min(bx.nx - 2);
    let j0 = (fy.floor() as usize).min(bx.ny - 2);
    let tx = fx - i0 as f64;
    let ty = fy - j0 as f64;
    (1.0 - ty) * ((1.0 - tx) * field[[j0, i0]] + tx * field[[j0, i0 + 1]])
        + ty * ((1.0 - tx) * field[[j0 + 1, i0]] + tx * field[[j0 + 1, i0 + 1]])
}

/// Nested level: boundary values for the fine solve interpolated from the
/// already-solved coarse field.
pub fn apply_nested_boundary(
    staging: &mut Array2<f64>,
    fine_bx: &SliceBox,
    coarse: ArrayView2<f64>,
    coarse_bx: &SliceBox,
) {
    set_boundary_condition(staging, fine_bx, |x, y| {
        interp_bilinear(coarse, coarse_bx, x, y)
    });
}
