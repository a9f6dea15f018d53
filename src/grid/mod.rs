//! Domain geometry: the global 3-D box, its decomposition into one
//! z-slab per longitudinal rank, and the transverse slice box that all
//! per-slice kernels operate on.

use crate::setup::{Configuration, InputError, SolverConfig};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    X,
    Y,
    Z,
}

/// The transverse grid of one slice, shared by every component array.
/// Cell centers sit at `x_lo + (i + 0.5) dx`; arrays carry `ghost` extra
/// cells on each side so that shape factors of order up to 3 never index
/// out of bounds.
#[derive(Copy, Clone, Debug)]
pub struct SliceBox {
    pub nx: usize,
    pub ny: usize,
    pub ghost: usize,
    pub dx: f64,
    pub dy: f64,
    pub x_lo: f64,
    pub y_lo: f64,
    pub periodic: bool,
}

impl SliceBox {
    /// Ghost width for a given transverse deposition order.
    pub fn ghost_for_order(depos_order: usize) -> usize {
        (depos_order + 2) / 2 + 1
    }

    /// Allocated extent including ghost cells, (rows, cols) = (y, x).
    pub fn full_dims(&self) -> (usize, usize) {
        (self.ny + 2 * self.ghost, self.nx + 2 * self.ghost)
    }

    pub fn num_points(&self) -> usize {
        self.nx * self.ny
    }

    pub fn x_of(&self, i: usize) -> f64 {
        self.x_lo + (i as f64 + 0.5) * self.dx
    }

    pub fn y_of(&self, j: usize) -> f64 {
        self.y_lo + (j as f64 + 0.5) * self.dy
    }

    pub fn x_center(&self) -> f64 {
        self.x_lo + 0.5 * (self.nx as f64) * self.dx
    }

    pub fn y_center(&self) -> f64 {
        self.y_lo + 0.5 * (self.ny as f64) * self.dy
    }

    /// Half-extent of the shorter box side, used to bound the multipole
    /// source region.
    pub fn min_half_width(&self) -> f64 {
        let hx = 0.5 * (self.nx as f64) * self.dx;
        let hy = 0.5 * (self.ny as f64) * self.dy;
        hx.min(hy)
    }
}

/// Per-rank view of the global domain. z is decomposed one contiguous
/// slab per longitudinal rank; x and y are never decomposed.
#[derive(Clone, Debug)]
pub struct Geometry {
    pub ncells: [usize; 3],
    pub prob_lo: [f64; 3],
    pub prob_hi: [f64; 3],
    pub cell_size: [f64; 3],
    pub rank_z: usize,
    pub numprocs_z: usize,
    pub slab_size_z: usize,
    pub periodic_transverse: bool,
}

impl Geometry {
    pub fn new(
        input: &Configuration,
        cfg: &SolverConfig,
        rank_z: usize,
        numprocs_z: usize,
    ) -> Result<Geometry, InputError> {
        let nx = input.integer("grid", "nx")? as usize;
        let ny = input.integer("grid", "ny")? as usize;
        let nz = input.integer("grid", "nz")? as usize;
        let prob_lo = [
            input.real("grid", "xmin")?,
            input.real("grid", "ymin")?,
            input.real("grid", "zmin")?,
        ];
        let prob_hi = [
            input.real("grid", "xmax")?,
            input.real("grid", "ymax")?,
            input.real("grid", "zmax")?,
        ];

        let slab_size_z = if cfg.grid_size_z > 0 { cfg.grid_size_z } else { nz / numprocs_z };
        if slab_size_z * numprocs_z != nz {
            return Err(InputError::Inconsistent(
                format!("# of cells in z-direction ({}) is not divisible into {} slabs of {} cells",
                        nz, numprocs_z, slab_size_z)
            ));
        }
        if nx % cfg.numprocs_x != 0 || ny % cfg.numprocs_y != 0 {
            return Err(InputError::Inconsistent(
                "# of cells in x/y-direction is not divisible by hipace.numprocs_x/y".to_owned()
            ));
        }

        let cell_size = [
            (prob_hi[0] - prob_lo[0]) / nx as f64,
            (prob_hi[1] - prob_lo[1]) / ny as f64,
            (prob_hi[2] - prob_lo[2]) / nz as f64,
        ];

        Ok(Geometry {
            ncells: [nx, ny, nz],
            prob_lo,
            prob_hi,
            cell_size,
            rank_z,
            numprocs_z,
            slab_size_z,
            periodic_transverse: !cfg.do_dirichlet_poisson,
        })
    }

    /// Inclusive range of global z-slice indices owned by this rank.
    /// Rank 0 owns the lowest slices; the head rank (highest rank_z) owns
    /// the head of the beam and executes first.
    pub fn slab_range(&self) -> (usize, usize) {
        let lo = self.rank_z * self.slab_size_z;
        (lo, lo + self.slab_size_z - 1)
    }

    pub fn z_of(&self, k: usize) -> f64 {
        self.prob_lo[2] + (k as f64 + 0.5) * self.cell_size[2]
    }

    /// Global slice index containing longitudinal position z, clamped into
    /// the domain.
    pub fn slice_of(&self, z: f64) -> isize {
        ((z - self.prob_lo[2]) / self.cell_size[2]).floor() as isize
    }

    pub fn slice_box(&self, depos_order: usize) -> SliceBox {
        SliceBox {
            nx: self.ncells[0],
            ny: self.ncells[1],
            ghost: SliceBox::ghost_for_order(depos_order),
            dx: self.cell_size[0],
            dy: self.cell_size[1],
            x_lo: self.prob_lo[0],
            y_lo: self.prob_lo[1],
            periodic: self.periodic_transverse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_geometry(rank_z: usize, numprocs_z: usize) -> Geometry {
        let input = "---
grid:
  nx: 32
  ny: 32
  nz: 16
  xmin: -8.0
  xmax: 8.0
  ymin: -8.0
  ymax: 8.0
  zmin: -8.0
  zmax: 8.0
hipace:
  normalized_units: 1
";
        let mut cfg = Configuration::from_string(input).unwrap();
        cfg.with_context("constants");
        let sc = SolverConfig::parse(&cfg).unwrap();
        Geometry::new(&cfg, &sc, rank_z, numprocs_z).unwrap()
    }

    #[test]
    fn slab_partition_covers_domain() {
        let mut covered = vec![false; 16];
        for rz in 0..4 {
            let geom = test_geometry(rz, 4);
            let (lo, hi) = geom.slab_range();
            for k in lo..=hi {
                assert!(!covered[k]);
                covered[k] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn ghost_width_tracks_deposition_order() {
        assert_eq!(SliceBox::ghost_for_order(0), 2);
        assert_eq!(SliceBox::ghost_for_order(1), 2);
        assert_eq!(SliceBox::ghost_for_order(2), 3);
        assert_eq!(SliceBox::ghost_for_order(3), 3);
    }

    #[test]
    fn slice_lookup_is_cell_aligned() {
        let geom = test_geometry(0, 4);
        assert_eq!(geom.slice_of(geom.z_of(7)), 7);
        assert_eq!(geom.slice_of(geom.prob_lo[2] + 1.0e-9), 0);
    }
}
