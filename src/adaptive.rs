//! Adaptive time step: reduce beam momentum moments per step, predict the
//! time step that resolves the betatron period where the beam will be when
//! this rank next executes, and broadcast the result down the pipeline.

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::constants::PhysConst;
use crate::fields::slices::Slices;
use crate::grid::SliceBox;
use crate::particles::beam::BeamParticles;
use crate::particles::sort::IndexType;
use crate::particles::{gather_fields, FieldViews};
use crate::setup::{Configuration, InputError, SolverConfig, TimeStep};

/// Accumulator slots per beam.
mod which {
    pub const MIN_UZ: usize = 0;
    pub const MIN_ACC: usize = 1;
    pub const SUM_WEIGHTS: usize = 2;
    pub const SUM_WEIGHTS_TIMES_UZ: usize = 3;
    pub const SUM_WEIGHTS_TIMES_UZ_SQUARED: usize = 4;
    pub const N: usize = 5;
}

pub struct AdaptiveTimeStep {
    pub do_adaptive_time_step: bool,
    nt_per_betatron: f64,
    dt_max: f64,
    threshold_uz: f64,
    adaptive_phase_tolerance: f64,
    adaptive_predict_step: bool,
    adaptive_control_phase_advance: bool,
    adaptive_phase_substeps: usize,
    pub adaptive_gather_ez: bool,
    timestep_data: Vec<[f64; which::N]>,
    pub min_uz: f64,
    nbeams: usize,
}

impl AdaptiveTimeStep {
    pub fn new(
        input: &Configuration,
        cfg: &SolverConfig,
        nbeams: usize,
    ) -> Result<AdaptiveTimeStep, InputError> {
        let do_adaptive = cfg.dt == TimeStep::Adaptive;
        let adaptive_gather_ez = input.bool_or("hipace", "adaptive_gather_ez", false)?;
        if adaptive_gather_ez {
            eprintln!("WARNING: hipace.adaptive_gather_ez = 1 is not validated and NOT recommended");
        }

        let mut ts = AdaptiveTimeStep {
            do_adaptive_time_step: do_adaptive,
            nt_per_betatron: input.real_or("hipace", "nt_per_betatron", 20.0)?,
            dt_max: input.real_or("hipace", "dt_max", f64::INFINITY)?,
            threshold_uz: input.real_or("hipace", "adaptive_threshold_uz", 2.0)?,
            adaptive_phase_tolerance: input.real_or("hipace", "adaptive_phase_tolerance", 4.0e-4)?,
            adaptive_predict_step: input.bool_or("hipace", "adaptive_predict_step", true)?,
            adaptive_control_phase_advance: input.bool_or("hipace", "adaptive_control_phase_advance", true)?,
            adaptive_phase_substeps: input.integer_or("hipace", "adaptive_phase_substeps", 2000)? as usize,
            adaptive_gather_ez,
            timestep_data: vec![[0.0; which::N]; nbeams],
            min_uz: f64::MAX,
            nbeams,
        };
        for data in ts.timestep_data.iter_mut() {
            data[which::MIN_UZ] = 1.0e30;
        }
        Ok(ts)
    }

    /// Reduces one beam's particles into the per-beam accumulators.
    /// `reset` clears them first (the step's first box).
    pub fn accumulate(
        &mut self,
        ibeam: usize,
        beam: &BeamParticles,
        offset: usize,
        count: usize,
        reset: bool,
        pc: &PhysConst,
    ) {
        if !self.do_adaptive_time_step {
            return;
        }
        let data = &mut self.timestep_data[ibeam];
        if reset {
            data[which::SUM_WEIGHTS] = 0.0;
            data[which::SUM_WEIGHTS_TIMES_UZ] = 0.0;
            data[which::SUM_WEIGHTS_TIMES_UZ_SQUARED] = 0.0;
            data[which::MIN_UZ] = 1.0e30;
        }
        let clight_inv = 1.0 / pc.c;
        for ip in offset..offset + count {
            if beam.id[ip] < 0 {
                continue;
            }
            let w = beam.w[ip];
            let uz = beam.uz[ip] * clight_inv;
            data[which::SUM_WEIGHTS] += w;
            data[which::SUM_WEIGHTS_TIMES_UZ] += w * uz;
            data[which::SUM_WEIGHTS_TIMES_UZ_SQUARED] += w * uz * uz;
            data[which::MIN_UZ] = data[which::MIN_UZ].min(uz);
        }
    }

    /// Gathers the minimum longitudinal acceleration q/m Ez / c over one
    /// slice bin. Marked not validated in the inputs; off by default.
    #[allow(clippy::too_many_arguments)]
    pub fn gather_min_acc_slice(
        &mut self,
        ibeam: usize,
        beam: &BeamParticles,
        indices: &[IndexType],
        slices: &Slices,
        bx: &SliceBox,
        pc: &PhysConst,
        depos_order: usize,
    ) {
        if !self.do_adaptive_time_step || !self.adaptive_gather_ez {
            return;
        }
        let views = FieldViews::from_slices(slices);
        let charge_mass_ratio = beam.charge / beam.mass;
        let clight_inv = 1.0 / pc.c;
        let mut min_acc: f64 = 0.0;
        for &idx in indices {
            let ip = idx as usize;
            if beam.id[ip] < 0 {
                continue;
            }
            let ez = match depos_order {
                0 => gather_fields::<0>(beam.x[ip], beam.y[ip], &views, bx)[2],
                1 => gather_fields::<1>(beam.x[ip], beam.y[ip], &views, bx)[2],
                2 => gather_fields::<2>(beam.x[ip], beam.y[ip], &views, bx)[2],
                _ => gather_fields::<3>(beam.x[ip], beam.y[ip], &views, bx)[2],
            };
            min_acc = min_acc.min(charge_mass_ratio * ez * clight_inv);
        }
        let data = &mut self.timestep_data[ibeam];
        data[which::MIN_ACC] = data[which::MIN_ACC].min(min_acc);
    }

    /// Computes the next time step from the accumulated moments. Only the
    /// head rank holds full-beam information before step 0 (`initial`);
    /// afterwards every rank computes and the broadcast keeps them aligned.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate<F>(
        &mut self,
        t: f64,
        dt: &mut f64,
        beams: &[&BeamParticles],
        plasma_density: &F,
        numprocs_z: usize,
        initial: bool,
        head_rank: bool,
        pc: &PhysConst,
    ) where
        F: Fn(f64) -> f64,
    {
        if !self.do_adaptive_time_step {
            return;
        }
        if initial && !head_rank {
            return;
        }
        assert!(
            plasma_density(pc.c * t) > 0.0,
            "a > 0 plasma density must be specified to use an adaptive time step"
        );

        let mut new_dts = vec![*dt; self.nbeams];
        let mut beams_min_uz = vec![f64::MAX; self.nbeams];

        for (ibeam, beam) in beams.iter().enumerate() {
            let data = &self.timestep_data[ibeam];
            assert!(
                data[which::SUM_WEIGHTS] != 0.0,
                "the sum of all weights is 0! Probably no beam particles are initialized"
            );
            let mean_uz = data[which::SUM_WEIGHTS_TIMES_UZ] / data[which::SUM_WEIGHTS];
            let sigma_uz = (data[which::SUM_WEIGHTS_TIMES_UZ_SQUARED] / data[which::SUM_WEIGHTS]
                - mean_uz * mean_uz)
                .abs()
                .sqrt();
            let sigma_uz_dev = mean_uz - 4.0 * sigma_uz;
            let max_supported_uz = 1.0e30;
            let chosen_min_uz = sigma_uz_dev.min(data[which::MIN_UZ]).min(max_supported_uz);

            let mass_ratio_sq = (beam.mass / pc.m_e) * (beam.mass / pc.m_e);
            let mut min_uz = chosen_min_uz * mass_ratio_sq;

            if min_uz < self.threshold_uz {
                eprintln!("WARNING: beam particles of beam {} have non-relativistic velocities!", ibeam);
            }
            min_uz = min_uz.max(self.threshold_uz);
            beams_min_uz[ibeam] = min_uz;

            /* Predict where the beam will be when this rank next executes:
             * the new step starts numprocs_z steps from now, so iterate the
             * betatron estimate forward, tracking the acceleration. */
            let mut new_dt = *dt;
            let mut new_time = t;
            let mut min_uz_pred = min_uz;
            let niter = if self.adaptive_predict_step { numprocs_z } else { 1 };
            for _ in 0..niter {
                let density = plasma_density(pc.c * new_time);
                min_uz_pred += self.timestep_data[ibeam][which::MIN_ACC] * new_dt;
                min_uz_pred = min_uz_pred.max(0.001 * self.threshold_uz);
                let omega_p = (density * pc.q_e * pc.q_e / (pc.ep0 * pc.m_e)).sqrt();
                let omega_b = omega_p / (2.0 * min_uz_pred).sqrt();
                new_dt = 2.0 * std::f64::consts::PI / omega_b / self.nt_per_betatron;
                new_time += new_dt;
                if min_uz_pred > self.threshold_uz {
                    new_dts[ibeam] = new_dt;
                }
            }
        }

        self.min_uz = beams_min_uz.iter().cloned().fold(f64::MAX, f64::min);
        *dt = new_dts.iter().cloned().fold(f64::MAX, f64::min);
        *dt = dt.min(self.dt_max);
    }

    /// Truncates the candidate time step so the betatron phase advance over
    /// it stays within tolerance of the uniform-plasma advance.
    pub fn calculate_from_density<F>(&mut self, t: f64, dt: &mut f64, plasma_density: &F, pc: &PhysConst)
    where
        F: Fn(f64) -> f64,
    {
        if !self.do_adaptive_time_step || !self.adaptive_control_phase_advance {
            return;
        }

        let dt_sub = *dt / self.adaptive_phase_substeps as f64;
        let mut phase_advance = 0.0;
        let mut phase_advance0 = 0.0;

        let density0 = plasma_density(pc.c * t);
        let omgp0 = (density0 * pc.q_e * pc.q_e / (pc.ep0 * pc.m_e)).sqrt();
        let omgb0 = omgp0 / (2.0 * self.min_uz).sqrt();

        for i in 0..self.adaptive_phase_substeps {
            let density = plasma_density(pc.c * (t + i as f64 * dt_sub));
            let omgp = (density * pc.q_e * pc.q_e / (pc.ep0 * pc.m_e)).sqrt();
            let omgb = omgp / (2.0 * self.min_uz).sqrt();
            phase_advance += omgb * dt_sub;
            phase_advance0 += omgb0 * dt_sub;
            if (phase_advance - phase_advance0).abs()
                > 2.0 * std::f64::consts::PI * self.adaptive_phase_tolerance / self.nt_per_betatron
            {
                if i == 0 {
                    eprintln!("WARNING: adaptive time step exits at first substep. \
                               Consider increasing hipace.adaptive_phase_substeps!");
                }
                *dt = i as f64 * dt_sub;
                return;
            }
        }

        for ibeam in 0..self.nbeams {
            self.timestep_data[ibeam][which::MIN_ACC] = 0.0;
        }
    }

    /// The head rank broadcasts the time step and minimum uz downstream.
    pub fn broadcast_time_step(
        &mut self,
        dt: &mut f64,
        comm_z: &SimpleCommunicator,
        numprocs_z: usize,
    ) {
        if !self.do_adaptive_time_step {
            return;
        }
        let root = comm_z.process_at_rank(numprocs_z as i32 - 1);
        root.broadcast_into(dt);
        root.broadcast_into(&mut self.min_uz);
    }
}
