//! Per-slice field solves: the Poisson-solver sum type, transverse and
//! longitudinal derivative kernels, and the wake equations for Psi, Ez, Bz
//! and the transverse magnetic field.

use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut2};

use crate::constants::PhysConst;
use crate::grid::{Direction, SliceBox};
use crate::setup::SolverConfig;

pub mod boundary;
pub mod fft;
pub mod multigrid;
pub mod slices;

use self::boundary::apply_open_boundary;
use self::fft::{FftDirichlet, FftPeriodic};
use self::multigrid::MultiGrid;
use self::slices::{SliceRole, Slices};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SliceOperator {
    Assign,
    Add,
}

/// Centered transverse derivative of a grown view, written into the
/// interior of `dst`: `dst = mult * d(src)/d(dir)`.
pub fn transverse_derivative(
    src: ArrayView2<f64>,
    mut dst: ArrayViewMut2<f64>,
    dir: Direction,
    delta: f64,
    mult: f64,
    op: SliceOperator,
    bx: &SliceBox,
) {
    let g = bx.ghost;
    let fac = mult / (2.0 * delta);
    for j in 0..bx.ny {
        for i in 0..bx.nx {
            let (jj, ii) = (j + g, i + g);
            let d = match dir {
                Direction::X => fac * (src[[jj, ii + 1]] - src[[jj, ii - 1]]),
                Direction::Y => fac * (src[[jj + 1, ii]] - src[[jj - 1, ii]]),
                Direction::Z => panic!("longitudinal derivative uses the slice ring"),
            };
            match op {
                SliceOperator::Assign => dst[[jj, ii]] = d,
                SliceOperator::Add => dst[[jj, ii]] += d,
            }
        }
    }
}

/// Longitudinal derivative across the slice ring, written into the
/// (ungrown) staging area: `dst = mult * (prev1 - next) / (2 dz)`.
pub fn longitudinal_derivative(
    prev: ArrayView2<f64>,
    next: ArrayView2<f64>,
    dst: &mut Array2<f64>,
    dz: f64,
    mult: f64,
    op: SliceOperator,
    bx: &SliceBox,
) {
    let g = bx.ghost;
    let fac = mult / (2.0 * dz);
    for j in 0..bx.ny {
        for i in 0..bx.nx {
            let d = fac * (prev[[j + g, i + g]] - next[[j + g, i + g]]);
            match op {
                SliceOperator::Assign => dst[[j, i]] = d,
                SliceOperator::Add => dst[[j, i]] += d,
            }
        }
    }
}

/// `dst = a*x + b*y` over full grown views.
pub fn lincomb(
    mut dst: ArrayViewMut2<f64>,
    a: f64,
    x: ArrayView2<f64>,
    b: f64,
    y: ArrayView2<f64>,
) {
    ndarray::Zip::from(&mut dst)
        .and(&x)
        .and(&y)
        .for_each(|d, &xv, &yv| *d = a * xv + b * yv);
}

/// Multigrid wrapped as a plain Poisson solver (zero coefficient).
pub struct MgPoisson {
    mg: MultiGrid,
    nx: usize,
    ny: usize,
    acf: Array2<f64>,
    sol: Array3<f64>,
    rhs: Array3<f64>,
    pub staging: Array2<f64>,
}

impl MgPoisson {
    pub fn new(nx: usize, ny: usize, dx: f64, dy: f64) -> MgPoisson {
        MgPoisson {
            mg: MultiGrid::new(dx, dy, nx, ny),
            nx,
            ny,
            acf: Array2::zeros((ny, nx)),
            sol: Array3::zeros((2, ny, nx)),
            rhs: Array3::zeros((2, ny, nx)),
            staging: Array2::zeros((ny, nx)),
        }
    }

    fn solve(&mut self, mut lhs: ArrayViewMut2<f64>, ghost: usize) {
        self.sol.fill(0.0);
        self.rhs.index_axis_mut(ndarray::Axis(0), 0).assign(&self.staging);
        self.rhs.index_axis_mut(ndarray::Axis(0), 1).fill(0.0);
        self.mg.solve_real(&mut self.sol, &self.rhs, &self.acf, 1.0e-10, 0.0, 100, false);
        for j in 0..self.ny {
            for i in 0..self.nx {
                lhs[[j + ghost, i + ghost]] = self.sol[[0, j, i]];
            }
        }
    }
}

/// The per-slice elliptic solver, dispatched by stored variant.
pub enum PoissonSolver {
    Periodic(FftPeriodic),
    DirichletFft(FftDirichlet),
    Multigrid(MgPoisson),
}

impl PoissonSolver {
    pub fn staging(&mut self) -> &mut Array2<f64> {
        match self {
            PoissonSolver::Periodic(s) => &mut s.staging,
            PoissonSolver::DirichletFft(s) => &mut s.staging,
            PoissonSolver::Multigrid(s) => &mut s.staging,
        }
    }

    pub fn solve(&mut self, lhs: ArrayViewMut2<f64>, ghost: usize) {
        match self {
            PoissonSolver::Periodic(s) => s.solve(lhs, ghost),
            PoissonSolver::DirichletFft(s) => s.solve(lhs, ghost),
            PoissonSolver::Multigrid(s) => s.solve(lhs, ghost),
        }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, PoissonSolver::Periodic(_))
    }
}

/// Owns the slice store and the solvers; exposes the wake-equation solves
/// and the predictor-corrector primitives the driver iterates with.
pub struct FieldSolver {
    pub slices: Slices,
    pub solver: PoissonSolver,
    mg_bxby: Option<MultiGrid>,
    pub bx: SliceBox,
    pub dz: f64,
    open_boundary: bool,
    pub extended_solve: bool,
    pub predcorr_b_error_tolerance: f64,
    pub predcorr_max_iterations: usize,
    pub predcorr_b_mixing_factor: f64,
    mg_tol_rel: f64,
    mg_tol_abs: f64,
    mg_max_iters: usize,
}

impl FieldSolver {
    pub fn new(bx: SliceBox, dz: f64, cfg: &SolverConfig) -> FieldSolver {
        let solver = if !cfg.do_dirichlet_poisson {
            PoissonSolver::Periodic(FftPeriodic::new(bx.nx, bx.ny, bx.dx, bx.dy))
        } else if cfg.poisson_multigrid {
            PoissonSolver::Multigrid(MgPoisson::new(bx.nx, bx.ny, bx.dx, bx.dy))
        } else {
            PoissonSolver::DirichletFft(FftDirichlet::new(bx.nx, bx.ny, bx.dx, bx.dy))
        };
        let mg_bxby = if cfg.explicit_solve {
            Some(MultiGrid::new(bx.dx, bx.dy, bx.nx, bx.ny))
        } else {
            None
        };
        FieldSolver {
            slices: Slices::new(bx, cfg.explicit_solve),
            solver,
            mg_bxby,
            bx,
            dz,
            open_boundary: cfg.open_boundary,
            extended_solve: cfg.extended_solve,
            predcorr_b_error_tolerance: cfg.predcorr_b_error_tolerance,
            predcorr_max_iterations: cfg.predcorr_max_iterations,
            predcorr_b_mixing_factor: cfg.predcorr_b_mixing_factor,
            mg_tol_rel: cfg.mg_tolerance_rel,
            mg_tol_abs: cfg.mg_tolerance_abs,
            mg_max_iters: cfg.mg_max_iterations,
        }
    }

    /// Folds ghost-cell deposition back into the interior. Collective only
    /// within the transverse communicator; with the supported 1x1 transverse
    /// grid this is a local wrap (periodic) or a discard (Dirichlet).
    pub fn sum_boundary(&mut self, role: SliceRole, comps: &[&str]) {
        let g = self.bx.ghost;
        let (nx, ny) = (self.bx.nx, self.bx.ny);
        let periodic = self.bx.periodic;
        for name in comps {
            let mut arr = self.slices.get_mut(role, name);
            if periodic {
                let (nrows, _) = arr.dim();
                for j in 0..nrows {
                    for k in 0..g {
                        let left = arr[[j, g - 1 - k]];
                        arr[[j, g + nx - 1 - k]] += left;
                        let right = arr[[j, g + nx + k]];
                        arr[[j, g + k]] += right;
                    }
                }
                let (_, ncols) = arr.dim();
                for i in 0..ncols {
                    for k in 0..g {
                        let bottom = arr[[g - 1 - k, i]];
                        arr[[g + ny - 1 - k, i]] += bottom;
                        let top = arr[[g + ny + k, i]];
                        arr[[g + k, i]] += top;
                    }
                }
            }
            // ghost contributions are consumed (periodic) or dropped
            zero_ghosts(&mut arr, g, nx, ny);
        }
    }

    /// Refreshes ghost cells from the interior: periodic wrap, or zero for
    /// Dirichlet boundaries where the field vanishes outside the box.
    pub fn fill_boundary(&mut self, role: SliceRole, comps: &[&str]) {
        let g = self.bx.ghost;
        let (nx, ny) = (self.bx.nx, self.bx.ny);
        let periodic = self.bx.periodic;
        for name in comps {
            let mut arr = self.slices.get_mut(role, name);
            if periodic {
                let (nrows, _) = arr.dim();
                for j in 0..nrows {
                    for k in 0..g {
                        arr[[j, g - 1 - k]] = arr[[j, g + nx - 1 - k]];
                        arr[[j, g + nx + k]] = arr[[j, g + k]];
                    }
                }
                let (_, ncols) = arr.dim();
                for i in 0..ncols {
                    for k in 0..g {
                        arr[[g - 1 - k, i]] = arr[[g + ny - 1 - k, i]];
                        arr[[g + ny + k, i]] = arr[[g + k, i]];
                    }
                }
            } else {
                zero_ghosts(&mut arr, g, nx, ny);
            }
        }
    }

    /// Assembles a Poisson source on the staging area from a closure over
    /// interior cell indices.
    fn stage<F>(&mut self, f: F)
    where
        F: Fn(&Slices, usize, usize) -> f64,
    {
        let g = self.bx.ghost;
        let (nx, ny) = (self.bx.nx, self.bx.ny);
        let mut staging = std::mem::replace(self.solver.staging(), Array2::zeros((0, 0)));
        for j in 0..ny {
            for i in 0..nx {
                staging[[j, i]] = f(&self.slices, j + g, i + g);
            }
        }
        *self.solver.staging() = staging;
    }

    fn apply_boundaries(&mut self, zero_monopole: bool) {
        if self.open_boundary && !self.solver.is_periodic() {
            let bx = self.bx;
            apply_open_boundary(self.solver.staging(), &bx, zero_monopole);
        }
    }

    /// Solves Lap(Psi) = -(rho - jz/c)/ep0 and derives the transverse
    /// focusing fields ExmBy = -dPsi/dx, EypBx = -dPsi/dy.
    pub fn solve_psi_exmby_eypbx(&mut self, pc: &PhysConst) {
        let clight_inv = 1.0 / pc.c;
        let ep0_inv = 1.0 / pc.ep0;
        self.stage(|s, j, i| {
            let rho = s.get(SliceRole::This, "rho")[[j, i]]
                + s.get(SliceRole::This, "rho_beam")[[j, i]];
            let jz = s.get(SliceRole::This, "jz")[[j, i]]
                + s.get(SliceRole::This, "jz_beam")[[j, i]];
            -(rho - jz * clight_inv) * ep0_inv
        });
        self.apply_boundaries(false);

        let ghost = self.bx.ghost;
        let FieldSolver { ref mut slices, ref mut solver, .. } = *self;
        solver.solve(slices.get_mut(SliceRole::This, "Psi"), ghost);
        self.fill_boundary(SliceRole::This, &["Psi"]);

        let bx = self.bx;
        let (psi, exmby) = self.slices.pair_mut(SliceRole::This, "Psi", "ExmBy");
        transverse_derivative(psi.view(), exmby, Direction::X, bx.dx, -1.0, SliceOperator::Assign, &bx);
        let (psi, eypbx) = self.slices.pair_mut(SliceRole::This, "Psi", "EypBx");
        transverse_derivative(psi.view(), eypbx, Direction::Y, bx.dy, -1.0, SliceOperator::Assign, &bx);
    }

    /// Solves Lap(Ez) = 1/(ep0 c) (d_x jx + d_y jy), total currents.
    pub fn solve_ez(&mut self, pc: &PhysConst) {
        let fac = 1.0 / (pc.ep0 * pc.c);
        let (dx, dy) = (self.bx.dx, self.bx.dy);
        self.stage(|s, j, i| {
            let jx = |jj: usize, ii: usize| {
                s.get(SliceRole::This, "jx")[[jj, ii]] + s.get(SliceRole::This, "jx_beam")[[jj, ii]]
            };
            let jy = |jj: usize, ii: usize| {
                s.get(SliceRole::This, "jy")[[jj, ii]] + s.get(SliceRole::This, "jy_beam")[[jj, ii]]
            };
            fac * ((jx(j, i + 1) - jx(j, i - 1)) / (2.0 * dx)
                + (jy(j + 1, i) - jy(j - 1, i)) / (2.0 * dy))
        });
        self.apply_boundaries(true);
        let ghost = self.bx.ghost;
        let FieldSolver { ref mut slices, ref mut solver, .. } = *self;
        solver.solve(slices.get_mut(SliceRole::This, "Ez"), ghost);
    }

    /// Solves Lap(Bz) = mu0 (d_y jx - d_x jy), total currents.
    pub fn solve_bz(&mut self, pc: &PhysConst) {
        let mu0 = pc.mu0;
        let (dx, dy) = (self.bx.dx, self.bx.dy);
        self.stage(|s, j, i| {
            let jx = |jj: usize, ii: usize| {
                s.get(SliceRole::This, "jx")[[jj, ii]] + s.get(SliceRole::This, "jx_beam")[[jj, ii]]
            };
            let jy = |jj: usize, ii: usize| {
                s.get(SliceRole::This, "jy")[[jj, ii]] + s.get(SliceRole::This, "jy_beam")[[jj, ii]]
            };
            mu0 * ((jx(j + 1, i) - jx(j - 1, i)) / (2.0 * dy)
                - (jy(j, i + 1) - jy(j, i - 1)) / (2.0 * dx))
        });
        self.apply_boundaries(true);
        let ghost = self.bx.ghost;
        let FieldSolver { ref mut slices, ref mut solver, .. } = *self;
        solver.solve(slices.get_mut(SliceRole::This, "Bz"), ghost);
    }

    /// Solves Lap(Bx) = mu0 (-d_y jz + d_z jy) into the iteration buffer.
    /// The longitudinal derivative spans the Previous1 and Next slices.
    pub fn solve_bx_into(&mut self, b_iter: &mut Array2<f64>, pc: &PhysConst) {
        let mu0 = pc.mu0;
        let dy = self.bx.dy;
        self.stage(|s, j, i| {
            let jz = |jj: usize, ii: usize| {
                s.get(SliceRole::This, "jz")[[jj, ii]] + s.get(SliceRole::This, "jz_beam")[[jj, ii]]
            };
            -mu0 * (jz(j + 1, i) - jz(j - 1, i)) / (2.0 * dy)
        });
        let mut staging = std::mem::replace(self.solver.staging(), Array2::zeros((0, 0)));
        longitudinal_derivative(
            self.slices.get(SliceRole::Previous1, "jy"),
            self.slices.get(SliceRole::Next, "jy"),
            &mut staging,
            self.dz,
            mu0,
            SliceOperator::Add,
            &self.bx,
        );
        *self.solver.staging() = staging;
        self.apply_boundaries(false);
        self.solver.solve(b_iter.view_mut(), 0);
    }

    /// Solves Lap(By) = mu0 (d_x jz - d_z jx) into the iteration buffer.
    pub fn solve_by_into(&mut self, b_iter: &mut Array2<f64>, pc: &PhysConst) {
        let mu0 = pc.mu0;
        let dx = self.bx.dx;
        self.stage(|s, j, i| {
            let jz = |jj: usize, ii: usize| {
                s.get(SliceRole::This, "jz")[[jj, ii]] + s.get(SliceRole::This, "jz_beam")[[jj, ii]]
            };
            mu0 * (jz(j, i + 1) - jz(j, i - 1)) / (2.0 * dx)
        });
        let mut staging = std::mem::replace(self.solver.staging(), Array2::zeros((0, 0)));
        longitudinal_derivative(
            self.slices.get(SliceRole::Previous1, "jx"),
            self.slices.get(SliceRole::Next, "jx"),
            &mut staging,
            self.dz,
            -mu0,
            SliceOperator::Add,
            &self.bx,
        );
        *self.solver.staging() = staging;
        self.apply_boundaries(false);
        self.solver.solve(b_iter.view_mut(), 0);
    }

    /// Explicit transverse-field solve: `(Lap - chi) Bx = -Sy`,
    /// `(Lap - chi) By = Sx`, no iteration.
    pub fn explicit_solve_bxby(&mut self) {
        let g = self.bx.ghost;
        let (nx, ny) = (self.bx.nx, self.bx.ny);
        let mut rhs = Array3::zeros((2, ny, nx));
        let mut acf = Array2::zeros((ny, nx));
        {
            let sx = self.slices.get(SliceRole::This, "Sx");
            let sy = self.slices.get(SliceRole::This, "Sy");
            let chi = self.slices.get(SliceRole::This, "chi");
            for j in 0..ny {
                for i in 0..nx {
                    rhs[[0, j, i]] = -sy[[j + g, i + g]];
                    rhs[[1, j, i]] = sx[[j + g, i + g]];
                    acf[[j, i]] = chi[[j + g, i + g]];
                }
            }
        }
        let mut sol = Array3::zeros((2, ny, nx));
        {
            let mg = self.mg_bxby.as_mut()
                .expect("explicit transverse solve requires fields.explicit_solve = 1");
            mg.solve_real(&mut sol, &rhs, &acf, self.mg_tol_rel, self.mg_tol_abs,
                          self.mg_max_iters, false);
        }
        let mut bx_arr = self.slices.get_mut(SliceRole::This, "Bx");
        for j in 0..ny {
            for i in 0..nx {
                bx_arr[[j + g, i + g]] = sol[[0, j, i]];
            }
        }
        let mut by_arr = self.slices.get_mut(SliceRole::This, "By");
        for j in 0..ny {
            for i in 0..nx {
                by_arr[[j + g, i + g]] = sol[[1, j, i]];
            }
        }
    }

    /// Initial guess for (Bx, By) on This from the two previous slices,
    /// weighted by how well they agreed.
    pub fn initial_b_field_guess(&mut self, relative_b_field_error: f64) {
        let mix = (-0.5 * (relative_b_field_error
            / (2.5 * self.predcorr_b_error_tolerance)).powi(2)).exp();
        for name in &["Bx", "By"] {
            let prev1 = self.slices.get(SliceRole::Previous1, name).to_owned();
            let prev2 = self.slices.get(SliceRole::Previous2, name).to_owned();
            lincomb(
                self.slices.get_mut(SliceRole::This, name),
                1.0 + mix,
                prev1.view(),
                -mix,
                prev2.view(),
            );
        }
    }

    /// Mixes the new iterate into the working field and rotates the
    /// iteration buffers:
    /// `B <- (1-lambda) B + lambda (a B_iter + (1-a) B_prev_iter)`.
    pub fn mix_and_shift_b_fields(
        &mut self,
        b_iter: &Array2<f64>,
        b_prev_iter: &mut Array2<f64>,
        comp: &str,
        relative_b_field_error: f64,
        relative_b_field_error_prev_iter: f64,
    ) {
        let (weight_b_iter, weight_b_prev_iter) =
            if relative_b_field_error != 0.0 || relative_b_field_error_prev_iter != 0.0 {
                let sum = relative_b_field_error + relative_b_field_error_prev_iter;
                (relative_b_field_error_prev_iter / sum, relative_b_field_error / sum)
            } else {
                (0.5, 0.5)
            };

        // temporary mix stored in b_prev_iter to avoid another allocation
        ndarray::Zip::from(&mut *b_prev_iter)
            .and(b_iter)
            .for_each(|p, &it| *p = weight_b_iter * it + weight_b_prev_iter * *p);

        let lambda = self.predcorr_b_mixing_factor;
        let g = self.bx.ghost;
        let mut b = self.slices.get_mut(SliceRole::This, comp);
        for j in 0..self.bx.ny {
            for i in 0..self.bx.nx {
                b[[j + g, i + g]] = (1.0 - lambda) * b[[j + g, i + g]]
                    + lambda * b_prev_iter[[j, i]];
            }
        }

        b_prev_iter.assign(b_iter);
    }

    /// Relative error between two (Bx, By) pairs over the interior:
    /// `|| (Bx-Bx')^2 + (By-By')^2 ||^1/2 / || Bx^2 + By^2 ||^1/2`.
    pub fn relative_b_field_error(
        &self,
        bx_a: ArrayView2<f64>,
        by_a: ArrayView2<f64>,
        bx_b: ArrayView2<f64>,
        by_b: ArrayView2<f64>,
        offset_a: usize,
        offset_b: usize,
    ) -> f64 {
        let (nx, ny) = (self.bx.nx, self.bx.ny);
        let (ga, gb) = (offset_a, offset_b);
        let mut norm_b = 0.0;
        let mut norm_diff = 0.0;
        for j in 0..ny {
            for i in 0..nx {
                let ax = bx_a[[j + ga, i + ga]];
                let ay = by_a[[j + ga, i + ga]];
                let bxv = bx_b[[j + gb, i + gb]];
                let byv = by_b[[j + gb, i + gb]];
                norm_b += ax * ax + ay * ay;
                norm_diff += (ax - bxv) * (ax - bxv) + (ay - byv) * (ay - byv);
            }
        }
        let norm_b = norm_b.sqrt();
        let norm_diff = norm_diff.sqrt();
        if norm_b / (nx * ny) as f64 > 1.0e-10 {
            norm_diff / norm_b
        } else {
            0.0
        }
    }
}

fn zero_ghosts(arr: &mut ArrayViewMut2<f64>, g: usize, nx: usize, ny: usize) {
    let (nrows, ncols) = arr.dim();
    for j in 0..nrows {
        for i in 0..ncols {
            if j < g || j >= g + ny || i < g || i >= g + nx {
                arr[[j, i]] = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::{Configuration, SolverConfig};

    fn test_config(extra: &str) -> SolverConfig {
        let input = format!("---\nhipace:\n  normalized_units: 1\n{}", extra);
        let mut cfg = Configuration::from_string(&input).unwrap();
        cfg.with_context("constants");
        SolverConfig::parse(&cfg).unwrap()
    }

    fn test_solver(nx: usize, ny: usize) -> FieldSolver {
        let bx = SliceBox {
            nx,
            ny,
            ghost: 3,
            dx: 16.0 / nx as f64,
            dy: 16.0 / ny as f64,
            x_lo: -8.0,
            y_lo: -8.0,
            periodic: false,
        };
        FieldSolver::new(bx, 0.5, &test_config(""))
    }

    /// ExmBy = -dPsi/dx and EypBx = -dPsi/dy are exact to machine
    /// precision for a linear potential.
    #[test]
    fn derivatives_exact_for_linear_psi() {
        let mut fs = test_solver(16, 16);
        let bx = fs.bx;
        let g = bx.ghost;
        {
            let mut psi = fs.slices.get_mut(SliceRole::This, "Psi");
            let (nrows, ncols) = psi.dim();
            for j in 0..nrows {
                for i in 0..ncols {
                    let x = bx.x_lo + (i as f64 - g as f64 + 0.5) * bx.dx;
                    let y = bx.y_lo + (j as f64 - g as f64 + 0.5) * bx.dy;
                    psi[[j, i]] = 3.0 * x - 2.0 * y + 0.7;
                }
            }
        }
        let (psi, exmby) = fs.slices.pair_mut(SliceRole::This, "Psi", "ExmBy");
        transverse_derivative(psi.view(), exmby, Direction::X, bx.dx, -1.0, SliceOperator::Assign, &bx);
        let (psi, eypbx) = fs.slices.pair_mut(SliceRole::This, "Psi", "EypBx");
        transverse_derivative(psi.view(), eypbx, Direction::Y, bx.dy, -1.0, SliceOperator::Assign, &bx);

        let exmby = fs.slices.interior(SliceRole::This, "ExmBy");
        let eypbx = fs.slices.interior(SliceRole::This, "EypBx");
        for j in 0..bx.ny {
            for i in 0..bx.nx {
                assert!((exmby[[j, i]] + 3.0).abs() < 1.0e-13);
                assert!((eypbx[[j, i]] - 2.0).abs() < 1.0e-13);
            }
        }
    }

    #[test]
    fn initial_guess_extrapolates_previous_slices() {
        let mut fs = test_solver(8, 8);
        fs.slices.get_mut(SliceRole::Previous1, "Bx").fill(2.0);
        fs.slices.get_mut(SliceRole::Previous2, "Bx").fill(1.0);
        // converged history: full extrapolation weight
        fs.initial_b_field_guess(0.0);
        let bx_this = fs.slices.get(SliceRole::This, "Bx");
        // (1+1)*2 - 1*1 = 3
        assert!((bx_this[[4, 4]] - 3.0).abs() < 1.0e-13);

        // badly converged history: guess falls back on Previous1
        fs.slices.get_mut(SliceRole::This, "Bx").fill(0.0);
        fs.initial_b_field_guess(1.0e3);
        let bx_this = fs.slices.get(SliceRole::This, "Bx");
        assert!((bx_this[[4, 4]] - 2.0).abs() < 1.0e-12);
    }

    #[test]
    fn relative_error_of_identical_fields_is_zero() {
        let mut fs = test_solver(8, 8);
        fs.slices.get_mut(SliceRole::This, "Bx").fill(1.5);
        fs.slices.get_mut(SliceRole::This, "By").fill(-0.5);
        let bx_v = fs.slices.get(SliceRole::This, "Bx").to_owned();
        let by_v = fs.slices.get(SliceRole::This, "By").to_owned();
        let err = fs.relative_b_field_error(
            bx_v.view(), by_v.view(), bx_v.view(), by_v.view(), 3, 3);
        assert_eq!(err, 0.0);
    }

    #[test]
    fn mixing_converges_towards_iterate() {
        let mut fs = test_solver(8, 8);
        fs.slices.get_mut(SliceRole::This, "Bx").fill(0.0);
        let b_iter = Array2::from_elem((8, 8), 1.0);
        let mut b_prev_iter = Array2::from_elem((8, 8), 1.0);
        for _ in 0..200 {
            fs.mix_and_shift_b_fields(&b_iter, &mut b_prev_iter, "Bx", 0.1, 0.1);
        }
        let b = fs.slices.interior(SliceRole::This, "Bx");
        assert!((b[[4, 4]] - 1.0).abs() < 1.0e-6);
    }

    #[test]
    fn quiescent_sources_give_zero_fields() {
        let mut fs = test_solver(32, 32);
        let pc = crate::constants::make_constants_normalized();
        fs.solve_psi_exmby_eypbx(&pc);
        fs.solve_ez(&pc);
        fs.solve_bz(&pc);
        for name in &["Psi", "ExmBy", "EypBx", "Ez", "Bz"] {
            let max = fs.slices.interior(SliceRole::This, name)
                .iter().fold(0.0f64, |m, v| m.max(v.abs()));
            assert!(max < 1.0e-12, "{} should vanish, got {:e}", name, max);
        }
    }
}
