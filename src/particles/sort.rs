//! Beam particle sorting: once per time step into per-rank boxes, then
//! into per-slice bins inside the local box, plus the slipped-particle
//! shift that moves particles between slice bins after the push.

use crate::grid::{Geometry, SliceBox};
use crate::particles::beam::BeamParticles;

pub type IndexType = u32;

/// Counting sort of the whole beam by destination z-box (one box per
/// longitudinal rank). Particles with invalid ids or outside the
/// transverse domain land in an overflow bin past the last box.
pub struct BoxSorter {
    pub box_counts: Vec<IndexType>,
    pub box_offsets: Vec<IndexType>,
    num_boxes: usize,
}

impl BoxSorter {
    pub fn sort_particles_by_box(
        beam: &mut BeamParticles,
        geom: &Geometry,
        bx: &SliceBox,
    ) -> BoxSorter {
        let num_boxes = geom.numprocs_z;
        let np = beam.len();
        let slab = geom.slab_size_z as isize;

        let assign_box = |beam: &BeamParticles, ip: usize| -> usize {
            if beam.id[ip] < 0 {
                return num_boxes;
            }
            let lx = bx.nx as f64 * bx.dx;
            let ly = bx.ny as f64 * bx.dy;
            if !bx.periodic
                && (beam.x[ip] < bx.x_lo
                    || beam.x[ip] >= bx.x_lo + lx
                    || beam.y[ip] < bx.y_lo
                    || beam.y[ip] >= bx.y_lo + ly)
            {
                return num_boxes;
            }
            let k = geom.slice_of(beam.z[ip]);
            if k < 0 || k >= geom.ncells[2] as isize {
                num_boxes
            } else {
                (k / slab) as usize
            }
        };

        let mut box_counts = vec![0 as IndexType; num_boxes + 1];
        let mut dst_box = vec![0usize; np];
        for ip in 0..np {
            let d = assign_box(beam, ip);
            if d == num_boxes && beam.id[ip] > 0 {
                // left the domain: invalidate and park at the end
                beam.id[ip] = -beam.id[ip];
            }
            dst_box[ip] = d;
            box_counts[d] += 1;
        }

        let mut box_offsets = vec![0 as IndexType; num_boxes + 2];
        for b in 0..=num_boxes {
            box_offsets[b + 1] = box_offsets[b] + box_counts[b];
        }

        let mut dst_indices = vec![0 as IndexType; np];
        let mut cursor = box_offsets.clone();
        for ip in 0..np {
            dst_indices[ip] = cursor[dst_box[ip]];
            cursor[dst_box[ip]] += 1;
        }

        // scatter-copy into a temporary tile and swap back
        let scatter = |v: &mut Vec<f64>| {
            let mut tmp = vec![0.0; np];
            for (ip, &d) in dst_indices.iter().enumerate() {
                tmp[d as usize] = v[ip];
            }
            std::mem::swap(v, &mut tmp);
        };
        scatter(&mut beam.x);
        scatter(&mut beam.y);
        scatter(&mut beam.z);
        scatter(&mut beam.ux);
        scatter(&mut beam.uy);
        scatter(&mut beam.uz);
        scatter(&mut beam.w);
        let mut tmp_id = vec![0i64; np];
        for (ip, &d) in dst_indices.iter().enumerate() {
            tmp_id[d as usize] = beam.id[ip];
        }
        std::mem::swap(&mut beam.id, &mut tmp_id);

        BoxSorter {
            box_counts,
            box_offsets,
            num_boxes,
        }
    }

    pub fn box_offset(&self, ibox: usize) -> usize {
        self.box_offsets[ibox] as usize
    }

    pub fn box_count(&self, ibox: usize) -> usize {
        self.box_counts[ibox] as usize
    }

    /// The lowest box index holding any particles.
    pub fn leftmost_box_with_particles(&self) -> usize {
        let mut boxid = 0;
        while boxid < self.num_boxes - 1 && self.box_counts[boxid] == 0 {
            boxid += 1;
        }
        boxid
    }
}

/// Dense per-slice bins of the local box: a permutation array ordered by
/// z-cell with queryable per-slice ranges.
pub struct SliceBins {
    pub counts: Vec<IndexType>,
    pub offsets: Vec<IndexType>,
    pub permutation: Vec<IndexType>,
    k_lo: usize,
    nslices: usize,
}

impl SliceBins {
    /// Bins the particles `box_offset..box_offset+box_count` of the sorted
    /// beam into the local slices.
    pub fn build(
        beam: &BeamParticles,
        box_offset: usize,
        box_count: usize,
        geom: &Geometry,
    ) -> SliceBins {
        let (k_lo, k_hi) = geom.slab_range();
        let nslices = k_hi - k_lo + 1;

        let local_slice = |ip: usize| -> usize {
            let k = geom.slice_of(beam.z[ip]);
            (k.max(k_lo as isize).min(k_hi as isize) - k_lo as isize) as usize
        };

        let mut counts = vec![0 as IndexType; nslices];
        for ip in box_offset..box_offset + box_count {
            counts[local_slice(ip)] += 1;
        }
        let mut offsets = vec![0 as IndexType; nslices + 1];
        for s in 0..nslices {
            offsets[s + 1] = offsets[s] + counts[s];
        }
        let mut permutation = vec![0 as IndexType; box_count];
        let mut cursor = offsets.clone();
        for ip in box_offset..box_offset + box_count {
            let s = local_slice(ip);
            permutation[cursor[s] as usize] = ip as IndexType;
            cursor[s] += 1;
        }

        SliceBins {
            counts,
            offsets,
            permutation,
            k_lo,
            nslices,
        }
    }

    pub fn empty(geom: &Geometry) -> SliceBins {
        let (k_lo, k_hi) = geom.slab_range();
        let nslices = k_hi - k_lo + 1;
        SliceBins {
            counts: vec![0; nslices],
            offsets: vec![0; nslices + 1],
            permutation: Vec::new(),
            k_lo,
            nslices,
        }
    }

    /// Particle indices of one global slice.
    pub fn slice(&self, islice: usize) -> &[IndexType] {
        let s = islice - self.k_lo;
        &self.permutation[self.offsets[s] as usize..self.offsets[s + 1] as usize]
    }

    /// After pushing slice `islice`, moves particles whose new z fell into
    /// a lower slice from this bin into the next (lower) one with a
    /// two-pass prefix-sum compact of the bin segment.
    pub fn shift_slipped(&mut self, islice: usize, beam: &BeamParticles, geom: &Geometry) {
        let s = islice - self.k_lo;
        if s == 0 {
            return; // slipping out of the slab resolves at the next box sort
        }
        let lo = self.offsets[s] as usize;
        let hi = self.offsets[s + 1] as usize;
        if lo == hi {
            return;
        }

        let slipped_pred = |&ip: &IndexType| -> bool {
            beam.id[ip as usize] >= 0 && geom.slice_of(beam.z[ip as usize]) < islice as isize
        };

        // first pass: count
        let num_slipped = self.permutation[lo..hi]
            .iter()
            .filter(|ip| slipped_pred(*ip))
            .count();
        if num_slipped == 0 {
            return;
        }

        // second pass: scatter slipped to the front, stayers behind them
        let mut seg = vec![0 as IndexType; hi - lo];
        let mut slip_cursor = 0;
        let mut stay_cursor = num_slipped;
        for &ip in &self.permutation[lo..hi] {
            if slipped_pred(&ip) {
                seg[slip_cursor] = ip;
                slip_cursor += 1;
            } else {
                seg[stay_cursor] = ip;
                stay_cursor += 1;
            }
        }
        self.permutation[lo..hi].copy_from_slice(&seg);

        // the boundary moves so the slipped tail joins the lower bin
        self.offsets[s] += num_slipped as IndexType;
        self.counts[s] -= num_slipped as IndexType;
        self.counts[s - 1] += num_slipped as IndexType;
    }

    pub fn num_slices(&self) -> usize {
        self.nslices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::make_constants_normalized;
    use crate::setup::{Configuration, SolverConfig};

    fn test_geometry(numprocs_z: usize, rank_z: usize) -> Geometry {
        let input = "---
grid:
  nx: 16
  ny: 16
  nz: 16
  xmin: -4.0
  xmax: 4.0
  ymin: -4.0
  ymax: 4.0
  zmin: -8.0
  zmax: 8.0
";
        let mut cfg = Configuration::from_string(input).unwrap();
        cfg.with_context("constants");
        let sc = SolverConfig::parse(&cfg).unwrap();
        Geometry::new(&cfg, &sc, rank_z, numprocs_z).unwrap()
    }

    fn test_beam(zs: &[f64]) -> BeamParticles {
        let pc = make_constants_normalized();
        let mut b = BeamParticles::empty(&pc);
        for (ip, &z) in zs.iter().enumerate() {
            b.x.push(0.0);
            b.y.push(0.0);
            b.z.push(z);
            b.ux.push(0.0);
            b.uy.push(0.0);
            b.uz.push(100.0);
            b.w.push(1.0);
            b.id.push(ip as i64 + 1);
        }
        b
    }

    #[test]
    fn box_sort_orders_by_slab() {
        let geom = test_geometry(4, 0);
        let bx = geom.slice_box(2);
        // z spans all four slabs plus one out-of-domain particle
        let mut beam = test_beam(&[7.0, -7.0, 1.0, -3.0, 100.0, 3.0]);
        let sorter = BoxSorter::sort_particles_by_box(&mut beam, &geom, &bx);

        assert_eq!(sorter.box_count(0), 1); // z = -7
        assert_eq!(sorter.box_count(1), 1); // z = -3
        assert_eq!(sorter.box_count(2), 2); // z = 1, 3
        assert_eq!(sorter.box_count(3), 1); // z = 7
        // overflow bin holds the escapee, now invalid
        assert_eq!(sorter.box_counts[4], 1);
        let last = beam.len() - 1;
        assert!(beam.id[last] < 0);
        // boxes are contiguous and ascending in z-slab
        for ibox in 0..4 {
            let off = sorter.box_offset(ibox);
            for ip in off..off + sorter.box_count(ibox) {
                let k = geom.slice_of(beam.z[ip]) as usize;
                assert_eq!(k / geom.slab_size_z, ibox);
            }
        }
    }

    #[test]
    fn slice_bins_partition_the_box() {
        let geom = test_geometry(1, 0);
        let bx = geom.slice_box(2);
        let mut beam = test_beam(&[-7.9, -7.0, -6.2, 0.0, 0.1, 7.9]);
        let sorter = BoxSorter::sort_particles_by_box(&mut beam, &geom, &bx);
        let bins = SliceBins::build(&beam, sorter.box_offset(0), sorter.box_count(0), &geom);

        let total: u32 = bins.counts.iter().sum();
        assert_eq!(total as usize, beam.len());
        // every particle listed under its own slice
        for k in 0..bins.num_slices() {
            for &ip in bins.slice(k) {
                assert_eq!(geom.slice_of(beam.z[ip as usize]), k as isize);
            }
        }
    }

    #[test]
    fn slipped_particles_move_to_next_bin() {
        let geom = test_geometry(1, 0);
        let bx = geom.slice_box(2);
        let mut beam = test_beam(&[0.1, 0.3, 0.7]); // all in slice 8
        let sorter = BoxSorter::sort_particles_by_box(&mut beam, &geom, &bx);
        let mut bins = SliceBins::build(&beam, sorter.box_offset(0), sorter.box_count(0), &geom);
        assert_eq!(bins.slice(8).len(), 3);
        assert_eq!(bins.slice(7).len(), 0);

        // one particle slips below the slice boundary after its push
        beam.z[bins.slice(8)[0] as usize] = -0.2;
        bins.shift_slipped(8, &beam, &geom);
        assert_eq!(bins.slice(8).len(), 2);
        assert_eq!(bins.slice(7).len(), 1);
        let slipped = bins.slice(7)[0] as usize;
        assert!((beam.z[slipped] + 0.2).abs() < 1.0e-12);
    }
}
