//! Macro-particle containers and the kernels they share: shape factors,
//! field gathering, and forward-mode dual numbers for the plasma pusher.

use ndarray::ArrayView2;

use crate::fields::slices::{SliceRole, Slices};
use crate::grid::SliceBox;

pub mod beam;
pub mod dual;
pub mod plasma;
pub mod shape;
pub mod sort;

use self::shape::compute_shape_factor;

/// Field views of the This slice used by gather.
pub(crate) struct FieldViews<'a> {
    pub exmby: ArrayView2<'a, f64>,
    pub eypbx: ArrayView2<'a, f64>,
    pub ez: ArrayView2<'a, f64>,
    pub bx: ArrayView2<'a, f64>,
    pub by: ArrayView2<'a, f64>,
    pub bz: ArrayView2<'a, f64>,
}

impl<'a> FieldViews<'a> {
    pub fn from_slices(slices: &'a Slices) -> FieldViews<'a> {
        FieldViews {
            exmby: slices.get(SliceRole::This, "ExmBy"),
            eypbx: slices.get(SliceRole::This, "EypBx"),
            ez: slices.get(SliceRole::This, "Ez"),
            bx: slices.get(SliceRole::This, "Bx"),
            by: slices.get(SliceRole::This, "By"),
            bz: slices.get(SliceRole::This, "Bz"),
        }
    }
}

/// Gathers the six field components at a particle position with the same
/// shape factors deposition uses.
pub(crate) fn gather_fields<const ORDER: usize>(
    x: f64,
    y: f64,
    views: &FieldViews,
    bx: &SliceBox,
) -> [f64; 6] {
    let g = bx.ghost as isize;
    let xmid = (x - bx.x_lo) / bx.dx - 0.5;
    let ymid = (y - bx.y_lo) / bx.dy - 0.5;
    let mut sx = [0.0; 4];
    let mut sy = [0.0; 4];
    let i0 = compute_shape_factor::<ORDER>(&mut sx, xmid);
    let j0 = compute_shape_factor::<ORDER>(&mut sy, ymid);

    let mut out = [0.0; 6];
    for ky in 0..=ORDER {
        let jj = (j0 + ky as isize + g) as usize;
        for kx in 0..=ORDER {
            let ii = (i0 + kx as isize + g) as usize;
            let s = sx[kx] * sy[ky];
            out[0] += s * views.exmby[[jj, ii]];
            out[1] += s * views.eypbx[[jj, ii]];
            out[2] += s * views.ez[[jj, ii]];
            out[3] += s * views.bx[[jj, ii]];
            out[4] += s * views.by[[jj, ii]];
            out[5] += s * views.bz[[jj, ii]];
        }
    }
    out
}
