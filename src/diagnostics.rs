//! Diagnostics: resampling of slice data into a time-accumulated 3-D plot
//! buffer, and the openPMD-flavored series writer (json backend).

use std::fs;
use std::io::Write;
use std::path::Path;

use ndarray::Array4;
use serde_json::{json, Map, Value};

use crate::fields::slices::{SliceRole, Slices};
use crate::grid::Geometry;
use crate::particles::beam::BeamParticles;
use crate::setup::{Configuration, InputError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiagType {
    Xyz,
    Xz,
    Yz,
}

impl DiagType {
    pub fn parse(s: &str) -> Result<DiagType, InputError> {
        match s {
            "xyz" => Ok(DiagType::Xyz),
            "xz" => Ok(DiagType::Xz),
            "yz" => Ok(DiagType::Yz),
            other => Err(InputError::Inconsistent(
                format!("unknown diagnostic.diag_type '{}'; expected xyz, xz or yz", other)
            )),
        }
    }
}

/// Owns the plot buffer one rank accumulates while walking its slices.
pub struct Diagnostic {
    pub dtype: DiagType,
    comps: Vec<String>,
    coarsening: usize,
    include_ghost_cells: bool,
    beam_data: bool,
    output_prefix: String,
    backend: String,
    // selected cell ranges in global index space
    i_range: (usize, usize),
    j_range: (usize, usize),
    k_range: (usize, usize),
    ghost: usize,
    buf: Array4<f64>,
}

impl Diagnostic {
    pub fn new(
        input: &Configuration,
        geom: &Geometry,
        slices: &Slices,
    ) -> Result<Diagnostic, InputError> {
        let dtype = DiagType::parse(&input.string_or("diagnostic", "diag_type", "xyz")?)?;
        let backend = input.string_or("diagnostic", "backend", "json")?;
        if backend != "json" {
            return Err(InputError::Inconsistent(
                format!("diagnostic backend '{}' is not available in this build; use json", backend)
            ));
        }

        let comps: Vec<String> = match input.strings("diagnostic", "field_data") {
            Ok(names) if names != ["all"] => names,
            _ => slices
                .map(SliceRole::This)
                .names()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        for name in &comps {
            if slices.map(SliceRole::This).index(name).is_none() {
                return Err(InputError::Inconsistent(
                    format!("diagnostic.field_data component '{}' is not materialized", name)
                ));
            }
        }

        let coarsening = input.integer_or("diagnostic", "coarsening", 1)?.max(1) as usize;
        let include_ghost_cells = input.bool_or("diagnostic", "include_ghost_cells", false)?;
        if include_ghost_cells && (dtype != DiagType::Xyz || coarsening != 1) {
            return Err(InputError::Inconsistent(
                "diagnostic.include_ghost_cells requires diag_type = xyz and coarsening = 1".to_owned()
            ));
        }
        let beam_data = input.bool_or("diagnostic", "beam_data", true)?;

        let patch_lo = match input.reals("diagnostic", "patch_lo") {
            Ok(v) if v.len() == 3 => [v[0], v[1], v[2]],
            _ => geom.prob_lo,
        };
        let patch_hi = match input.reals("diagnostic", "patch_hi") {
            Ok(v) if v.len() == 3 => [v[0], v[1], v[2]],
            _ => geom.prob_hi,
        };

        let clip = |dim: usize| -> (usize, usize) {
            let lo = ((patch_lo[dim] - geom.prob_lo[dim]) / geom.cell_size[dim]).floor()
                .max(0.0) as usize;
            let hi = (((patch_hi[dim] - geom.prob_lo[dim]) / geom.cell_size[dim]).ceil() as usize)
                .min(geom.ncells[dim]);
            (lo, hi.max(lo + 1))
        };
        let i_range = clip(0);
        let j_range = clip(1);
        let k_range = clip(2);

        let ghost = if include_ghost_cells { slices.bx.ghost } else { 0 };
        let nx_sel = (i_range.1 - i_range.0 + coarsening - 1) / coarsening + 2 * ghost;
        let ny_sel = (j_range.1 - j_range.0 + coarsening - 1) / coarsening + 2 * ghost;
        let nz_sel = (k_range.1 - k_range.0 + coarsening - 1) / coarsening;
        let (nx_buf, ny_buf) = match dtype {
            DiagType::Xyz => (nx_sel, ny_sel),
            DiagType::Xz => (nx_sel, 1),
            DiagType::Yz => (1, ny_sel),
        };

        let ncomp = comps.len();
        Ok(Diagnostic {
            dtype,
            comps,
            coarsening,
            include_ghost_cells,
            beam_data,
            output_prefix: input.string_or("diagnostic", "output_prefix", "diags")?,
            backend,
            i_range,
            j_range,
            k_range,
            ghost,
            buf: Array4::zeros((ncomp, nz_sel, ny_buf, nx_buf)),
        })
    }

    /// Interpolates the finished This slice into the plot buffer row of the
    /// global slice `islice`. Slices outside the patch or skipped by the
    /// longitudinal coarsening are ignored.
    pub fn resample_slice(&mut self, islice: usize, slices: &Slices) {
        if islice < self.k_range.0 || islice >= self.k_range.1 {
            return;
        }
        if (islice - self.k_range.0) % self.coarsening != 0 {
            return;
        }
        let kk = (islice - self.k_range.0) / self.coarsening;
        let bx = slices.bx;
        let g = bx.ghost;
        let c = self.coarsening;
        let cells_per_sample = (c * c) as f64;

        let (_, _, ny_buf, nx_buf) = self.buf.dim();
        for (n, name) in self.comps.iter().enumerate() {
            let arr = slices.get(SliceRole::This, name);
            match self.dtype {
                DiagType::Xyz if self.include_ghost_cells => {
                    // ghost mode copies the grown array verbatim
                    for jj in 0..ny_buf {
                        for ii in 0..nx_buf {
                            self.buf[[n, kk, jj, ii]] = arr[[jj, ii]];
                        }
                    }
                }
                DiagType::Xyz => {
                    for jj in 0..ny_buf {
                        for ii in 0..nx_buf {
                            let mut acc = 0.0;
                            for dj in 0..c {
                                for di in 0..c {
                                    let j = self.j_range.0 + jj * c + dj;
                                    let i = self.i_range.0 + ii * c + di;
                                    if j < self.j_range.1 && i < self.i_range.1 {
                                        acc += arr[[j + g, i + g]];
                                    }
                                }
                            }
                            self.buf[[n, kk, jj, ii]] = acc / cells_per_sample;
                        }
                    }
                }
                DiagType::Xz => {
                    // average the two rows straddling the y axis
                    let jc = bx.ny / 2;
                    for ii in 0..nx_buf {
                        let mut acc = 0.0;
                        for di in 0..c {
                            let i = self.i_range.0 + ii * c + di;
                            if i < self.i_range.1 {
                                acc += 0.5 * (arr[[jc - 1 + g, i + g]] + arr[[jc + g, i + g]]);
                            }
                        }
                        self.buf[[n, kk, 0, ii]] = acc / c as f64;
                    }
                }
                DiagType::Yz => {
                    let ic = bx.nx / 2;
                    for jj in 0..ny_buf {
                        let mut acc = 0.0;
                        for dj in 0..c {
                            let j = self.j_range.0 + jj * c + dj;
                            if j < self.j_range.1 {
                                acc += 0.5 * (arr[[j + g, ic - 1 + g]] + arr[[j + g, ic + g]]);
                            }
                        }
                        self.buf[[n, kk, jj, 0]] = acc / c as f64;
                    }
                }
            }
        }
    }

    /// Writes one iteration of the openPMD series,
    /// `<prefix>/openpmd_%06T.json`. Mesh data is emitted in C order with z
    /// the fastest-varying axis; slice diagnostics drop the collapsed axis.
    pub fn write(
        &self,
        step: usize,
        time: f64,
        dt: f64,
        geom: &Geometry,
        beam: &BeamParticles,
        normalized_units: bool,
        background_density_si: Option<f64>,
    ) -> std::io::Result<()> {
        if self.backend != "json" {
            unreachable!("only the json backend is linked in");
        }
        let dir = Path::new(&self.output_prefix);
        fs::create_dir_all(dir)?;
        let filename = dir.join(format!("openpmd_{:06}.json", step));

        let c = self.coarsening as f64;
        let spacing = match self.dtype {
            DiagType::Xyz => vec![
                geom.cell_size[0] * c,
                geom.cell_size[1] * c,
                geom.cell_size[2] * c,
            ],
            DiagType::Xz => vec![geom.cell_size[0] * c, geom.cell_size[2] * c],
            DiagType::Yz => vec![geom.cell_size[1] * c, geom.cell_size[2] * c],
        };
        let axis_labels = match self.dtype {
            DiagType::Xyz => vec!["x", "y", "z"],
            DiagType::Xz => vec!["x", "z"],
            DiagType::Yz => vec!["y", "z"],
        };
        let gsh = self.ghost as f64;
        let offset = match self.dtype {
            DiagType::Xyz => vec![
                geom.prob_lo[0] + (self.i_range.0 as f64 - gsh) * geom.cell_size[0],
                geom.prob_lo[1] + (self.j_range.0 as f64 - gsh) * geom.cell_size[1],
                geom.prob_lo[2] + self.k_range.0 as f64 * geom.cell_size[2],
            ],
            DiagType::Xz => vec![
                geom.prob_lo[0] + self.i_range.0 as f64 * geom.cell_size[0],
                geom.prob_lo[2] + self.k_range.0 as f64 * geom.cell_size[2],
            ],
            DiagType::Yz => vec![
                geom.prob_lo[1] + self.j_range.0 as f64 * geom.cell_size[1],
                geom.prob_lo[2] + self.k_range.0 as f64 * geom.cell_size[2],
            ],
        };

        let mut meshes = Map::new();
        let (_, nz, ny, nx) = self.buf.dim();
        for (n, name) in self.comps.iter().enumerate() {
            // flatten with z fastest-varying
            let mut data = Vec::with_capacity(nx * ny * nz);
            for ii in 0..nx {
                for jj in 0..ny {
                    for kk in 0..nz {
                        data.push(self.buf[[n, kk, jj, ii]]);
                    }
                }
            }
            let shape: Vec<usize> = match self.dtype {
                DiagType::Xyz => vec![nx, ny, nz],
                DiagType::Xz => vec![nx, nz],
                DiagType::Yz => vec![ny, nz],
            };
            meshes.insert(
                name.clone(),
                json!({
                    "geometry": "cartesian",
                    "dataOrder": "C",
                    "axisLabels": axis_labels.clone(),
                    "gridSpacing": spacing.clone(),
                    "gridGlobalOffset": offset.clone(),
                    "gridUnitSI": 1.0,
                    "unitSI": unit_si_of(name, normalized_units, background_density_si),
                    "shape": shape,
                    "data": data,
                }),
            );
        }

        let mut iteration = json!({
            "time": time,
            "dt": dt,
            "timeUnitSI": 1.0,
            "meshes": Value::Object(meshes),
        });

        if self.beam_data {
            let valid: Vec<usize> = (0..beam.len()).filter(|&ip| beam.id[ip] > 0).collect();
            let pick = |v: &[f64]| -> Vec<f64> { valid.iter().map(|&ip| v[ip]).collect() };
            let momentum = |v: &[f64]| -> Vec<f64> {
                valid.iter().map(|&ip| v[ip] * beam.mass).collect()
            };
            let ids: Vec<i64> = valid.iter().map(|&ip| beam.id[ip]).collect();
            let zeros = vec![0.0f64; valid.len()];
            iteration["particles"] = json!({
                "beam": {
                    "position": { "x": pick(&beam.x), "y": pick(&beam.y), "z": pick(&beam.z) },
                    "positionOffset": { "x": zeros.clone(), "y": zeros.clone(), "z": zeros },
                    "id": ids,
                    "charge": beam.charge,
                    "mass": beam.mass,
                    "momentum": { "x": momentum(&beam.ux), "y": momentum(&beam.uy), "z": momentum(&beam.uz) },
                    "weighting": pick(&beam.w),
                }
            });
        }

        let mut iterations = Map::new();
        iterations.insert(step.to_string(), iteration);
        let series = json!({
            "openPMD": "1.1.0",
            "openPMDextension": 0,
            "basePath": "/data/%T/",
            "iterationEncoding": "fileBased",
            "iterationFormat": "openpmd_%06T",
            "iterations": Value::Object(iterations),
        });

        let mut file = fs::File::create(filename)?;
        writeln!(file, "{}", serde_json::to_string(&series)?)?;
        Ok(())
    }

    pub fn include_ghost_cells(&self) -> bool {
        self.include_ghost_cells
    }

    pub fn buffer(&self) -> &Array4<f64> {
        &self.buf
    }
}

/// The conversion factor from normalized units to SI for one component,
/// recorded as the openPMD unitSI attribute. Requires the background
/// density the normalization refers to.
fn unit_si_of(name: &str, normalized_units: bool, background_density_si: Option<f64>) -> f64 {
    if !normalized_units {
        return 1.0;
    }
    let n0 = match background_density_si {
        Some(n0) => n0,
        None => return 1.0,
    };
    use crate::constants::*;
    let omega_p = (n0 * ELEMENTARY_CHARGE * ELEMENTARY_CHARGE
        / (VACUUM_PERMITTIVITY * ELECTRON_MASS))
        .sqrt();
    let e0 = ELECTRON_MASS * SPEED_OF_LIGHT * omega_p / ELEMENTARY_CHARGE;
    match name {
        "ExmBy" | "EypBx" | "Ez" => e0,
        "Bx" | "By" | "Bz" => e0 / SPEED_OF_LIGHT,
        "Psi" => ELECTRON_MASS * SPEED_OF_LIGHT_SQD / ELEMENTARY_CHARGE,
        "jx" | "jy" | "jz" | "jx_beam" | "jy_beam" | "jz_beam" => {
            ELEMENTARY_CHARGE * n0 * SPEED_OF_LIGHT
        }
        "rho" | "rho_beam" => ELEMENTARY_CHARGE * n0,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::SolverConfig;

    fn test_setup(diag: &str) -> (Geometry, Slices, Configuration<'static>) {
        let input = format!(
            "---
grid:
  nx: 16
  ny: 16
  nz: 8
  xmin: -4.0
  xmax: 4.0
  ymin: -4.0
  ymax: 4.0
  zmin: -2.0
  zmax: 2.0
{}",
            diag
        );
        let mut cfg = Configuration::from_string(&input).unwrap();
        cfg.with_context("constants");
        let sc = SolverConfig::parse(&cfg).unwrap();
        let geom = Geometry::new(&cfg, &sc, 0, 1).unwrap();
        let slices = Slices::new(geom.slice_box(2), false);
        (geom, slices, cfg)
    }

    fn fill_linear(slices: &mut Slices) {
        let bx = slices.bx;
        let g = bx.ghost;
        let mut ez = slices.get_mut(SliceRole::This, "Ez");
        let (nrows, ncols) = ez.dim();
        for j in 0..nrows {
            for i in 0..ncols {
                let x = bx.x_lo + (i as f64 - g as f64 + 0.5) * bx.dx;
                let y = bx.y_lo + (j as f64 - g as f64 + 0.5) * bx.dy;
                ez[[j, i]] = x + 10.0 * y;
            }
        }
    }

    #[test]
    fn unknown_diag_type_is_a_config_error() {
        assert!(DiagType::parse("xyz").is_ok());
        assert!(DiagType::parse("rz").is_err());
    }

    #[test]
    fn xyz_buffer_collects_every_slice() {
        let (geom, mut slices, cfg) = test_setup("diagnostic:\n  diag_type: xyz\n");
        let mut diag = Diagnostic::new(&cfg, &geom, &slices).unwrap();
        fill_linear(&mut slices);
        for k in 0..8 {
            diag.resample_slice(k, &slices);
        }
        let buf = diag.buffer();
        assert_eq!(buf.dim().1, 8);
        // the Ez component reproduces the cell-center values
        let n_ez = 2; // ExmBy, EypBx, Ez, ...
        let x0 = geom.prob_lo[0] + 0.5 * geom.cell_size[0];
        let y0 = geom.prob_lo[1] + 0.5 * geom.cell_size[1];
        assert!((buf[[n_ez, 0, 0, 0]] - (x0 + 10.0 * y0)).abs() < 1.0e-12);
    }

    #[test]
    fn xz_slice_drops_the_y_axis() {
        let (geom, mut slices, cfg) = test_setup("diagnostic:\n  diag_type: xz\n");
        let mut diag = Diagnostic::new(&cfg, &geom, &slices).unwrap();
        fill_linear(&mut slices);
        diag.resample_slice(3, &slices);
        let buf = diag.buffer();
        assert_eq!(buf.dim().2, 1);
        // on-axis value: the two central rows average to y = 0
        let n_ez = 2;
        let x0 = geom.prob_lo[0] + 0.5 * geom.cell_size[0];
        assert!((buf[[n_ez, 3, 0, 0]] - x0).abs() < 1.0e-12);
    }

    #[test]
    fn coarsening_averages_blocks() {
        let (geom, mut slices, cfg) =
            test_setup("diagnostic:\n  diag_type: xyz\n  coarsening: 2\n");
        let mut diag = Diagnostic::new(&cfg, &geom, &slices).unwrap();
        fill_linear(&mut slices);
        diag.resample_slice(0, &slices);
        let buf = diag.buffer();
        assert_eq!(buf.dim().3, 8);
        // block average of a linear field is the block-center value
        let n_ez = 2;
        let x_avg = geom.prob_lo[0] + geom.cell_size[0];
        let y_avg = geom.prob_lo[1] + geom.cell_size[1];
        assert!((buf[[n_ez, 0, 0, 0]] - (x_avg + 10.0 * y_avg)).abs() < 1.0e-12);
    }

    #[test]
    fn writes_an_openpmd_json_series() {
        let (geom, mut slices, cfg) = test_setup(
            "diagnostic:\n  diag_type: xyz\n  output_prefix: /tmp/wakefield_diag_test\n",
        );
        let mut diag = Diagnostic::new(&cfg, &geom, &slices).unwrap();
        fill_linear(&mut slices);
        diag.resample_slice(0, &slices);

        let pc = crate::constants::make_constants_normalized();
        let beam = BeamParticles::empty(&pc);
        diag.write(0, 0.0, 0.1, &geom, &beam, true, Some(1.0e24)).unwrap();

        let text = std::fs::read_to_string("/tmp/wakefield_diag_test/openpmd_000000.json").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        let ez = &parsed["iterations"]["0"]["meshes"]["Ez"];
        assert_eq!(ez["axisLabels"][0], "x");
        assert!(ez["unitSI"].as_f64().unwrap() > 0.0);
    }
}
