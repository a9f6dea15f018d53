//! Geometric multigrid for the per-slice Helmholtz problem
//! `(Lap - a) phi = rhs`, where `a` may be a real per-cell coefficient
//! (two independent field components solved at once) or a complex constant
//! (two components holding real and imaginary parts).
//!
//! V-cycle with four red-black Gauss-Seidel sweeps per leg, a 16-sweep
//! bottom solve on the coarsest level, 4-point averaged restriction and
//! piecewise-constant prolongation on cell-centered grids (9-point / bilinear
//! on node-centered grids). Dirichlet boundaries: cell-centered edges use the
//! ghost-free 4/3 closure, node-centered boundary nodes are pinned to zero.

use ndarray::{Array2, Array3};

const SMOOTH_SWEEPS: usize = 4;
const BOTTOM_SWEEPS: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SystemType {
    /// Two independent real components with a shared per-cell coefficient.
    Real,
    /// One complex component (re, im) with a complex constant coefficient.
    Complex,
}

pub struct MultiGrid {
    dx: f64,
    dy: f64,
    cell_centered: bool,
    domains: Vec<(usize, usize)>,
    acf: Vec<Array3<f64>>,
    res: Vec<Array3<f64>>,
    cor: Vec<Array3<f64>>,
    rescor: Vec<Array3<f64>>,
    system: SystemType,
}

impl MultiGrid {
    /// Builds the level hierarchy for an (nx, ny) slice. Even extents are
    /// treated as cell-centered, odd extents as node-centered; mixed parity
    /// is unsupported.
    pub fn new(dx: f64, dy: f64, nx: usize, ny: usize) -> MultiGrid {
        assert_eq!(nx % 2, ny % 2, "multigrid requires matching parity of nx and ny");
        let cell_centered = nx % 2 == 0;

        // coarsen as far as the domain allows, at most 30 levels
        let mut domains = vec![(nx, ny)];
        for _ in 0..30 {
            let (cnx, cny) = *domains.last().unwrap();
            let next = if cell_centered {
                if cnx % 2 == 0 && cny % 2 == 0 && cnx >= 4 && cny >= 4 {
                    Some((cnx / 2, cny / 2))
                } else {
                    None
                }
            } else {
                if (cnx - 1) % 2 == 0 && (cny - 1) % 2 == 0 && cnx >= 5 && cny >= 5 {
                    Some(((cnx - 1) / 2 + 1, (cny - 1) / 2 + 1))
                } else {
                    None
                }
            };
            match next {
                Some(d) => domains.push(d),
                None => break,
            }
        }

        let alloc = |(w, h): (usize, usize)| Array3::<f64>::zeros((2, h, w));
        let acf = domains.iter().map(|&d| alloc(d)).collect();
        let res = domains.iter().map(|&d| alloc(d)).collect();
        let cor = domains.iter().map(|&d| alloc(d)).collect();
        let rescor = domains.iter().map(|&d| alloc(d)).collect();

        MultiGrid {
            dx,
            dy,
            cell_centered,
            domains,
            acf,
            res,
            cor,
            rescor,
            system: SystemType::Real,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.domains.len()
    }

    /// Solves `(Lap - acf) sol_n = rhs_n` for two independent real
    /// components sharing the coefficient array.
    pub fn solve_real(
        &mut self,
        sol: &mut Array3<f64>,
        rhs: &Array3<f64>,
        acf: &Array2<f64>,
        tol_rel: f64,
        tol_abs: f64,
        nummaxiter: usize,
        verbose: bool,
    ) {
        self.system = SystemType::Real;
        for n in 0..2 {
            self.acf[0].index_axis_mut(ndarray::Axis(0), n).assign(acf);
        }
        self.average_down_acoef();
        self.solve_doit(sol, rhs, tol_rel, tol_abs, nummaxiter, verbose);
    }

    /// Solves `(Lap - alpha) (sol_re + i sol_im) = rhs_re + i rhs_im` with
    /// complex constant alpha.
    pub fn solve_complex(
        &mut self,
        sol: &mut Array3<f64>,
        rhs: &Array3<f64>,
        alpha_re: f64,
        alpha_im: f64,
        tol_rel: f64,
        tol_abs: f64,
        nummaxiter: usize,
        verbose: bool,
    ) {
        self.system = SystemType::Complex;
        self.acf[0].index_axis_mut(ndarray::Axis(0), 0).fill(alpha_re);
        self.acf[0].index_axis_mut(ndarray::Axis(0), 1).fill(alpha_im);
        self.average_down_acoef();
        self.solve_doit(sol, rhs, tol_rel, tol_abs, nummaxiter, verbose);
    }

    /// The discrete operator `(Lap - a) phi`, boundary closure included.
    /// Exposed so callers (and tests) can manufacture consistent sources.
    pub fn apply_operator(&self, phi: &Array3<f64>, acf: &Array2<f64>) -> Array3<f64> {
        let (nx, ny) = self.domains[0];
        let facx = 1.0 / (self.dx * self.dx);
        let facy = 1.0 / (self.dy * self.dy);
        let mut out = Array3::zeros((2, ny, nx));
        for n in 0..2 {
            for j in 0..ny {
                for i in 0..nx {
                    let lap = self.laplacian(phi, n, i, j, nx, ny, facx, facy);
                    out[[n, j, i]] = lap - acf[[j, i]] * phi[[n, j, i]];
                }
            }
        }
        out
    }

    fn laplacian(
        &self,
        phi: &Array3<f64>,
        n: usize,
        i: usize,
        j: usize,
        nx: usize,
        ny: usize,
        facx: f64,
        facy: f64,
    ) -> f64 {
        Self::laplacian_at(phi, n, i, j, nx, ny, facx, facy, self.cell_centered)
    }

    fn laplacian_at(
        phi: &Array3<f64>,
        n: usize,
        i: usize,
        j: usize,
        nx: usize,
        ny: usize,
        facx: f64,
        facy: f64,
        cell_centered: bool,
    ) -> f64 {
        let mut lap = -2.0 * (facx + facy) * phi[[n, j, i]];
        if cell_centered && i == 0 {
            lap += facx * ((4.0 / 3.0) * phi[[n, j, i + 1]] - 2.0 * phi[[n, j, i]]);
        } else if cell_centered && i == nx - 1 {
            lap += facx * ((4.0 / 3.0) * phi[[n, j, i - 1]] - 2.0 * phi[[n, j, i]]);
        } else {
            let left = if i == 0 { 0.0 } else { phi[[n, j, i - 1]] };
            let right = if i == nx - 1 { 0.0 } else { phi[[n, j, i + 1]] };
            lap += facx * (left + right);
        }
        if cell_centered && j == 0 {
            lap += facy * ((4.0 / 3.0) * phi[[n, j + 1, i]] - 2.0 * phi[[n, j, i]]);
        } else if cell_centered && j == ny - 1 {
            lap += facy * ((4.0 / 3.0) * phi[[n, j - 1, i]] - 2.0 * phi[[n, j, i]]);
        } else {
            let down = if j == 0 { 0.0 } else { phi[[n, j - 1, i]] };
            let up = if j == ny - 1 { 0.0 } else { phi[[n, j + 1, i]] };
            lap += facy * (down + up);
        }
        lap
    }

    /// res = rhs - (Lap - a) phi
    fn compute_residual(
        &self,
        lev: usize,
        res: &mut Array3<f64>,
        phi: &Array3<f64>,
        rhs: &Array3<f64>,
    ) {
        let (nx, ny) = self.domains[lev];
        let fac = (1u64 << lev) as f64;
        let facx = 1.0 / (self.dx * fac * (self.dx * fac));
        let facy = 1.0 / (self.dy * fac * (self.dy * fac));
        let acf = &self.acf[lev];
        let cc = self.cell_centered;
        let nc_boundary = |i: usize, j: usize| !cc && (i == 0 || j == 0 || i == nx - 1 || j == ny - 1);

        match self.system {
            SystemType::Real => {
                for n in 0..2 {
                    for j in 0..ny {
                        for i in 0..nx {
                            if nc_boundary(i, j) {
                                res[[n, j, i]] = 0.0;
                                continue;
                            }
                            let lap = Self::laplacian_at(phi, n, i, j, nx, ny, facx, facy, cc);
                            res[[n, j, i]] = rhs[[n, j, i]] + acf[[n, j, i]] * phi[[n, j, i]] - lap;
                        }
                    }
                }
            }
            SystemType::Complex => {
                for j in 0..ny {
                    for i in 0..nx {
                        if nc_boundary(i, j) {
                            res[[0, j, i]] = 0.0;
                            res[[1, j, i]] = 0.0;
                            continue;
                        }
                        let lap_r = Self::laplacian_at(phi, 0, i, j, nx, ny, facx, facy, cc);
                        let lap_i = Self::laplacian_at(phi, 1, i, j, nx, ny, facx, facy, cc);
                        let (ar, ai) = (acf[[0, j, i]], acf[[1, j, i]]);
                        res[[0, j, i]] = rhs[[0, j, i]] + ar * phi[[0, j, i]] - ai * phi[[1, j, i]] - lap_r;
                        res[[1, j, i]] = rhs[[1, j, i]] + ai * phi[[0, j, i]] + ar * phi[[1, j, i]] - lap_i;
                    }
                }
            }
        }
    }

    /// One red-black Gauss-Seidel sweep of the given color.
    fn gsrb(&mut self, lev: usize, color: usize) {
        let (nx, ny) = self.domains[lev];
        let fac = (1u64 << lev) as f64;
        let facx = 1.0 / (self.dx * fac * (self.dx * fac));
        let facy = 1.0 / (self.dy * fac * (self.dy * fac));
        let cc = self.cell_centered;
        let system = self.system;

        // phi is cor[lev], rhs is res[lev]; disjoint struct fields
        let MultiGrid { ref mut cor, ref res, ref acf, .. } = *self;
        let (cor, res, acf) = (&mut cor[lev], &res[lev], &acf[lev]);

        for j in 0..ny {
            for i in 0..nx {
                if (i + j) % 2 != color % 2 {
                    continue;
                }
                if !cc && (i == 0 || j == 0 || i == nx - 1 || j == ny - 1) {
                    continue; // node-centered boundary nodes stay at zero
                }
                match system {
                    SystemType::Real => {
                        for n in 0..2 {
                            Self::gs1(cor, n, i, j, nx, ny, res[[n, j, i]], acf[[n, j, i]], facx, facy, cc);
                        }
                    }
                    SystemType::Complex => {
                        Self::gs2(
                            cor, i, j, nx, ny,
                            res[[0, j, i]], res[[1, j, i]],
                            acf[[0, j, i]], acf[[1, j, i]],
                            facx, facy, cc,
                        );
                    }
                }
            }
        }
    }

    fn gs1(
        phi: &mut Array3<f64>,
        n: usize,
        i: usize,
        j: usize,
        nx: usize,
        ny: usize,
        rhs: f64,
        acf: f64,
        facx: f64,
        facy: f64,
        cc: bool,
    ) {
        let mut lap;
        let mut c0 = -(acf + 2.0 * (facx + facy));
        if cc && i == 0 {
            lap = facx * (4.0 / 3.0) * phi[[n, j, i + 1]];
            c0 -= 2.0 * facx;
        } else if cc && i == nx - 1 {
            lap = facx * (4.0 / 3.0) * phi[[n, j, i - 1]];
            c0 -= 2.0 * facx;
        } else {
            let left = if i == 0 { 0.0 } else { phi[[n, j, i - 1]] };
            let right = if i == nx - 1 { 0.0 } else { phi[[n, j, i + 1]] };
            lap = facx * (left + right);
        }
        if cc && j == 0 {
            lap += facy * (4.0 / 3.0) * phi[[n, j + 1, i]];
            c0 -= 2.0 * facy;
        } else if cc && j == ny - 1 {
            lap += facy * (4.0 / 3.0) * phi[[n, j - 1, i]];
            c0 -= 2.0 * facy;
        } else {
            let down = if j == 0 { 0.0 } else { phi[[n, j - 1, i]] };
            let up = if j == ny - 1 { 0.0 } else { phi[[n, j + 1, i]] };
            lap += facy * (down + up);
        }
        phi[[n, j, i]] = (rhs - lap) / c0;
    }

    #[allow(clippy::too_many_arguments)]
    fn gs2(
        phi: &mut Array3<f64>,
        i: usize,
        j: usize,
        nx: usize,
        ny: usize,
        rhs_r: f64,
        rhs_i: f64,
        ar: f64,
        ai: f64,
        facx: f64,
        facy: f64,
        cc: bool,
    ) {
        let mut lap = [0.0f64; 2];
        let mut c0 = -2.0 * (facx + facy);
        for n in 0..2 {
            if cc && i == 0 {
                lap[n] = facx * (4.0 / 3.0) * phi[[n, j, i + 1]];
            } else if cc && i == nx - 1 {
                lap[n] = facx * (4.0 / 3.0) * phi[[n, j, i - 1]];
            } else {
                let left = if i == 0 { 0.0 } else { phi[[n, j, i - 1]] };
                let right = if i == nx - 1 { 0.0 } else { phi[[n, j, i + 1]] };
                lap[n] = facx * (left + right);
            }
            if cc && j == 0 {
                lap[n] += facy * (4.0 / 3.0) * phi[[n, j + 1, i]];
            } else if cc && j == ny - 1 {
                lap[n] += facy * (4.0 / 3.0) * phi[[n, j - 1, i]];
            } else {
                let down = if j == 0 { 0.0 } else { phi[[n, j - 1, i]] };
                let up = if j == ny - 1 { 0.0 } else { phi[[n, j + 1, i]] };
                lap[n] += facy * (down + up);
            }
        }
        if cc && (i == 0 || i == nx - 1) {
            c0 -= 2.0 * facx;
        }
        if cc && (j == 0 || j == ny - 1) {
            c0 -= 2.0 * facy;
        }
        let c = [c0 - ar, -ai];
        let cmag = 1.0 / (c[0] * c[0] + c[1] * c[1]);
        phi[[0, j, i]] = ((rhs_r - lap[0]) * c[0] + (rhs_i - lap[1]) * c[1]) * cmag;
        phi[[1, j, i]] = ((rhs_i - lap[1]) * c[0] - (rhs_r - lap[0]) * c[1]) * cmag;
    }

    fn restriction(&mut self, lev: usize) {
        let (cnx, cny) = self.domains[lev + 1];
        let MultiGrid { ref mut res, ref rescor, .. } = *self;
        let (crse, fine) = (&mut res[lev + 1], &rescor[lev]);
        if self.cell_centered {
            for n in 0..2 {
                for j in 0..cny {
                    for i in 0..cnx {
                        crse[[n, j, i]] = 0.25
                            * (fine[[n, 2 * j, 2 * i]]
                                + fine[[n, 2 * j, 2 * i + 1]]
                                + fine[[n, 2 * j + 1, 2 * i]]
                                + fine[[n, 2 * j + 1, 2 * i + 1]]);
                    }
                }
            }
        } else {
            let (fnx, fny) = self.domains[lev];
            for n in 0..2 {
                for j in 0..cny {
                    for i in 0..cnx {
                        if i == 0 || j == 0 || i == cnx - 1 || j == cny - 1 {
                            crse[[n, j, i]] = 0.0;
                            continue;
                        }
                        let (fi, fj) = (2 * i, 2 * j);
                        debug_assert!(fi + 1 < fnx && fj + 1 < fny);
                        crse[[n, j, i]] = 0.0625
                            * (fine[[n, fj - 1, fi - 1]]
                                + fine[[n, fj - 1, fi + 1]]
                                + fine[[n, fj + 1, fi - 1]]
                                + fine[[n, fj + 1, fi + 1]])
                            + 0.125
                                * (fine[[n, fj - 1, fi]]
                                    + fine[[n, fj + 1, fi]]
                                    + fine[[n, fj, fi - 1]]
                                    + fine[[n, fj, fi + 1]])
                            + 0.25 * fine[[n, fj, fi]];
                    }
                }
            }
        }
    }

    /// cor[lev] += I(cor[lev+1])
    fn interpolation(&mut self, lev: usize) {
        let (fnx, fny) = self.domains[lev];
        let (cnx, cny) = self.domains[lev + 1];
        let (lo, hi) = self.cor.split_at_mut(lev + 1);
        let (fine, crse) = (&mut lo[lev], &hi[0]);
        if self.cell_centered {
            for n in 0..2 {
                for j in 0..fny {
                    for i in 0..fnx {
                        fine[[n, j, i]] += crse[[n, j / 2, i / 2]];
                    }
                }
            }
        } else {
            for n in 0..2 {
                for j in 0..fny {
                    for i in 0..fnx {
                        let (ci, cj) = (i / 2, j / 2);
                        let (wi, wj) = (i % 2, j % 2);
                        let v = if wi == 0 && wj == 0 {
                            crse[[n, cj, ci]]
                        } else if wi == 1 && wj == 0 {
                            0.5 * (crse[[n, cj, ci]] + crse[[n, cj, (ci + 1).min(cnx - 1)]])
                        } else if wi == 0 && wj == 1 {
                            0.5 * (crse[[n, cj, ci]] + crse[[n, (cj + 1).min(cny - 1), ci]])
                        } else {
                            0.25 * (crse[[n, cj, ci]]
                                + crse[[n, cj, (ci + 1).min(cnx - 1)]]
                                + crse[[n, (cj + 1).min(cny - 1), ci]]
                                + crse[[n, (cj + 1).min(cny - 1), (ci + 1).min(cnx - 1)]])
                        };
                        fine[[n, j, i]] += v;
                    }
                }
            }
        }
    }

    fn average_down_acoef(&mut self) {
        for lev in 0..self.num_levels() - 1 {
            let (cnx, cny) = self.domains[lev + 1];
            let (lo, hi) = self.acf.split_at_mut(lev + 1);
            let (crse, fine) = (&mut hi[0], &lo[lev]);
            if self.cell_centered {
                for n in 0..2 {
                    for j in 0..cny {
                        for i in 0..cnx {
                            crse[[n, j, i]] = 0.25
                                * (fine[[n, 2 * j, 2 * i]]
                                    + fine[[n, 2 * j, 2 * i + 1]]
                                    + fine[[n, 2 * j + 1, 2 * i]]
                                    + fine[[n, 2 * j + 1, 2 * i + 1]]);
                        }
                    }
                }
            } else {
                // same weighted 9-point transfer as the residual
                // restriction; boundary nodes are pinned
                for n in 0..2 {
                    for j in 0..cny {
                        for i in 0..cnx {
                            if i == 0 || j == 0 || i == cnx - 1 || j == cny - 1 {
                                crse[[n, j, i]] = 0.0;
                                continue;
                            }
                            let (fi, fj) = (2 * i, 2 * j);
                            crse[[n, j, i]] = 0.0625
                                * (fine[[n, fj - 1, fi - 1]]
                                    + fine[[n, fj - 1, fi + 1]]
                                    + fine[[n, fj + 1, fi - 1]]
                                    + fine[[n, fj + 1, fi + 1]])
                                + 0.125
                                    * (fine[[n, fj - 1, fi]]
                                        + fine[[n, fj + 1, fi]]
                                        + fine[[n, fj, fi - 1]]
                                        + fine[[n, fj, fi + 1]])
                                + 0.25 * fine[[n, fj, fi]];
                        }
                    }
                }
            }
        }
    }

    fn smooth(&mut self, lev: usize, sweeps: usize, zero_init: bool) {
        if zero_init {
            self.cor[lev].fill(0.0);
        }
        for s in 0..sweeps {
            self.gsrb(lev, s);
        }
    }

    fn vcycle(&mut self, sol: &mut Array3<f64>) {
        let nlev = self.num_levels();
        for lev in 0..nlev - 1 {
            self.smooth(lev, SMOOTH_SWEEPS, true);
            // rescor = res - (L - a) cor
            let mut rescor = std::mem::replace(&mut self.rescor[lev], Array3::zeros((0, 0, 0)));
            let cor = std::mem::replace(&mut self.cor[lev], Array3::zeros((0, 0, 0)));
            let res = std::mem::replace(&mut self.res[lev], Array3::zeros((0, 0, 0)));
            self.compute_residual(lev, &mut rescor, &cor, &res);
            self.rescor[lev] = rescor;
            self.cor[lev] = cor;
            self.res[lev] = res;
            self.restriction(lev);
        }

        self.smooth(nlev - 1, BOTTOM_SWEEPS, true);

        for lev in (0..nlev.saturating_sub(1)).rev() {
            self.interpolation(lev);
            self.smooth(lev, SMOOTH_SWEEPS, false);
        }

        let cor0 = &self.cor[0];
        for n in 0..2 {
            let (_, ny, nx) = sol.dim();
            for j in 0..ny {
                for i in 0..nx {
                    sol[[n, j, i]] += cor0[[n, j, i]];
                }
            }
        }
    }

    fn solve_doit(
        &mut self,
        sol: &mut Array3<f64>,
        rhs: &Array3<f64>,
        tol_rel: f64,
        tol_abs: f64,
        nummaxiter: usize,
        verbose: bool,
    ) {
        assert_eq!(sol.dim(), rhs.dim());
        assert_eq!(sol.dim().1, self.domains[0].1);
        assert_eq!(sol.dim().2, self.domains[0].0);

        let mut res0 = std::mem::replace(&mut self.res[0], Array3::zeros((0, 0, 0)));
        self.compute_residual(0, &mut res0, sol, rhs);
        self.res[0] = res0;

        let resnorm0 = self.res[0].iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let rhsnorm0 = rhs.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let max_norm = rhsnorm0.max(resnorm0);
        let res_target = tol_abs.max(tol_rel.max(1.0e-16) * max_norm);

        if verbose {
            println!("mg: initial resid = {:e}, rhs norm = {:e}", resnorm0, rhsnorm0);
        }
        if resnorm0 <= res_target {
            return;
        }

        let mut converged = false;
        let mut norminf = resnorm0;
        for iter in 0..nummaxiter {
            self.vcycle(sol);

            let mut res0 = std::mem::replace(&mut self.res[0], Array3::zeros((0, 0, 0)));
            self.compute_residual(0, &mut res0, sol, rhs);
            self.res[0] = res0;
            norminf = self.res[0].iter().fold(0.0f64, |m, v| m.max(v.abs()));
            if verbose {
                println!("mg: iteration {} resid = {:e}", iter + 1, norminf);
            }
            if norminf <= res_target {
                converged = true;
                break;
            } else if norminf > 1.0e20 * max_norm {
                panic!(
                    "multigrid solver diverged after {} iterations (resid = {:e}, initial = {:e})",
                    iter + 1, norminf, resnorm0
                );
            }
        }
        if !converged {
            panic!(
                "multigrid solver failed to converge after {} iterations (resid = {:e}, target = {:e})",
                nummaxiter, norminf, res_target
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manufactured_phi(nx: usize, ny: usize) -> Array3<f64> {
        Array3::from_shape_fn((2, ny, nx), |(n, j, i)| {
            let x = (i as f64 + 0.5) / nx as f64;
            let y = (j as f64 + 0.5) / ny as f64;
            let base = (std::f64::consts::PI * x).sin() * (std::f64::consts::PI * y).sin();
            if n == 0 { base } else { 0.5 * base * (2.0 * std::f64::consts::PI * x).cos() }
        })
    }

    #[test]
    fn real_poisson_converges_to_discrete_solution() {
        let (nx, ny) = (64, 64);
        let (dx, dy) = (1.0 / nx as f64, 1.0 / ny as f64);
        let mut mg = MultiGrid::new(dx, dy, nx, ny);
        assert!(mg.num_levels() > 1);

        let acf = Array2::zeros((ny, nx));
        let phi = manufactured_phi(nx, ny);
        let rhs = mg.apply_operator(&phi, &acf);

        let mut sol = Array3::zeros((2, ny, nx));
        mg.solve_real(&mut sol, &rhs, &acf, 1.0e-11, 0.0, 100, false);

        let max_err = (&sol - &phi).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let scale = phi.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        println!("real: max_err/scale = {:e}", max_err / scale);
        assert!(max_err < 1.0e-8 * scale.max(1.0));
    }

    #[test]
    fn helmholtz_with_coefficient() {
        let (nx, ny) = (32, 32);
        let (dx, dy) = (0.1, 0.1);
        let mut mg = MultiGrid::new(dx, dy, nx, ny);

        let acf = Array2::from_shape_fn((ny, nx), |(j, i)| {
            1.0 + 0.3 * ((i + j) as f64 / (nx + ny) as f64)
        });
        let phi = manufactured_phi(nx, ny);
        let rhs = mg.apply_operator(&phi, &acf);

        let mut sol = Array3::zeros((2, ny, nx));
        mg.solve_real(&mut sol, &rhs, &acf, 1.0e-11, 0.0, 100, false);
        let max_err = (&sol - &phi).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(max_err < 1.0e-8);
    }

    #[test]
    fn complex_helmholtz_converges() {
        let (nx, ny) = (32, 32);
        let (dx, dy) = (0.05, 0.05);
        let mut mg = MultiGrid::new(dx, dy, nx, ny);

        let (ar, ai) = (2.0, 0.7);
        let phi = manufactured_phi(nx, ny);
        // rhs = (L - a) phi for complex a: build from the real operator and
        // the cross terms
        let zero = Array2::zeros((ny, nx));
        let lap = mg.apply_operator(&phi, &zero);
        let mut rhs = Array3::zeros((2, ny, nx));
        for j in 0..ny {
            for i in 0..nx {
                rhs[[0, j, i]] = lap[[0, j, i]] - ar * phi[[0, j, i]] + ai * phi[[1, j, i]];
                rhs[[1, j, i]] = lap[[1, j, i]] - ai * phi[[0, j, i]] - ar * phi[[1, j, i]];
            }
        }

        let mut sol = Array3::zeros((2, ny, nx));
        mg.solve_complex(&mut sol, &rhs, ar, ai, 1.0e-11, 0.0, 100, false);
        let max_err = (&sol - &phi).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(max_err < 1.0e-8, "max_err = {:e}", max_err);
    }

    /// The coefficient array is restricted with the weighted 9-point
    /// node-centered stencil, not injected; boundary nodes are pinned.
    #[test]
    fn node_centered_coefficient_restriction_is_weighted() {
        let (nx, ny) = (33, 33);
        let mut mg = MultiGrid::new(0.1, 0.1, nx, ny);
        assert!(mg.num_levels() > 1);

        // a coefficient with curvature, so injection and averaging differ
        let acf_of = |i: usize, j: usize| 1.0 + (0.3 * i as f64).sin() + (0.2 * j as f64).cos();
        for n in 0..2 {
            for j in 0..ny {
                for i in 0..nx {
                    mg.acf[0][[n, j, i]] = acf_of(i, j);
                }
            }
        }
        mg.average_down_acoef();

        let (ci, cj) = (5, 7);
        let (fi, fj) = (2 * ci, 2 * cj);
        let expect = 0.0625
            * (acf_of(fi - 1, fj - 1) + acf_of(fi + 1, fj - 1)
                + acf_of(fi - 1, fj + 1) + acf_of(fi + 1, fj + 1))
            + 0.125
                * (acf_of(fi, fj - 1) + acf_of(fi, fj + 1)
                    + acf_of(fi - 1, fj) + acf_of(fi + 1, fj))
            + 0.25 * acf_of(fi, fj);
        let got = mg.acf[1][[0, cj, ci]];
        assert!((got - expect).abs() < 1.0e-14, "got {}, expected {}", got, expect);
        // injection would have returned the center value alone
        assert!((got - acf_of(fi, fj)).abs() > 1.0e-3);

        let (cnx, cny) = mg.domains[1];
        assert_eq!(mg.acf[1][[0, 0, 3]], 0.0);
        assert_eq!(mg.acf[1][[1, cny - 1, 3]], 0.0);
        assert_eq!(mg.acf[1][[0, 3, cnx - 1]], 0.0);
    }

    /// Odd-sized (node-centered) Helmholtz solve with a spatially varying
    /// coefficient, the configuration the explicit transverse-field solve
    /// produces from the deposited chi.
    #[test]
    fn node_centered_helmholtz_with_varying_coefficient() {
        let (nx, ny) = (33, 33);
        let (dx, dy) = (1.0 / 32.0, 1.0 / 32.0);
        let mut mg = MultiGrid::new(dx, dy, nx, ny);

        let acf = Array2::from_shape_fn((ny, nx), |(j, i)| {
            let x = i as f64 / 32.0;
            let y = j as f64 / 32.0;
            2.0 + (std::f64::consts::PI * x).sin() * (std::f64::consts::PI * y).sin()
        });
        let phi = Array3::from_shape_fn((2, ny, nx), |(n, j, i)| {
            let x = i as f64 / 32.0;
            let y = j as f64 / 32.0;
            let base = (std::f64::consts::PI * x).sin() * (std::f64::consts::PI * y).sin();
            if n == 0 { base } else { base * (2.0 * std::f64::consts::PI * x).cos() }
        });
        let rhs = mg.apply_operator(&phi, &acf);

        let mut sol = Array3::zeros((2, ny, nx));
        mg.solve_real(&mut sol, &rhs, &acf, 1.0e-10, 0.0, 100, false);
        let max_err = (&sol - &phi).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(max_err < 1.0e-7, "max_err = {:e}", max_err);
    }

    #[test]
    fn node_centered_hierarchy() {
        let (nx, ny) = (65, 65);
        let (dx, dy) = (1.0 / 64.0, 1.0 / 64.0);
        let mut mg = MultiGrid::new(dx, dy, nx, ny);
        assert!(mg.num_levels() > 1);

        let acf = Array2::zeros((ny, nx));
        // boundary nodes must be zero for the node-centered system
        let phi = Array3::from_shape_fn((2, ny, nx), |(n, j, i)| {
            let x = i as f64 / 64.0;
            let y = j as f64 / 64.0;
            let base = (std::f64::consts::PI * x).sin() * (std::f64::consts::PI * y).sin();
            if n == 0 { base } else { -base }
        });
        let rhs = mg.apply_operator(&phi, &acf);

        let mut sol = Array3::zeros((2, ny, nx));
        mg.solve_real(&mut sol, &rhs, &acf, 1.0e-10, 0.0, 100, false);
        let max_err = (&sol - &phi).iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(max_err < 1.0e-7, "max_err = {:e}", max_err);
    }
}
