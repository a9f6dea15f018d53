//! Parse input configuration file

use std::fmt;
use std::error::Error;
use std::path::Path;
use yaml_rust::{YamlLoader, yaml::Yaml};
use meval::Context;

use crate::constants::*;

pub enum InputError {
    InvalidInputFile(&'static str),
    CouldNotParse(String, String),
    MissingField(String, String),
    Inconsistent(String),
}

impl fmt::Debug for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InputError::*;
        let help_msg = "Usage: mpirun -n np ./wakefield input-file";
        match self {
            InvalidInputFile(s) => write!(f, "invalid input file: {}\n{}", s, help_msg),
            CouldNotParse(token, field) => write!(f, "unable to parse '{}' = '{}' in configuration file", token, field),
            MissingField(section, field) => write!(f, "unable to find '{}' in section '{}' with correct type in configuration file", field, section),
            Inconsistent(msg) => write!(f, "inconsistent configuration: {}", msg),
        }
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for InputError {}

/// Represents the input configuration, can be queried
/// for desired parameters
pub struct Configuration<'a> {
    input: Yaml,
    ctx: Context<'a>,
}

impl<'a> Configuration<'a> {
    pub fn from_file(path: &Path) -> Result<Configuration, InputError> {
        let contents = std::fs::read_to_string(path).map_err(|_e| InputError::InvalidInputFile("unable to read file"))?;
        Self::from_string(&contents)
    }

    pub fn from_string(contents: &str) -> Result<Configuration, InputError> {
        let input = YamlLoader::load_from_str(contents).map_err(|_e| InputError::InvalidInputFile("yaml trouble"))?;
        let input = input.first().ok_or(InputError::InvalidInputFile("yaml trouble"))?;
        Ok(Configuration {
            input: input.clone(),
            ctx: Context::new(),
        })
    }

    pub fn with_context(&mut self, section: &str) -> &mut Self {
        // Default constants and plasma-related functions

        self.ctx
            .var("m", ELECTRON_MASS)
            .var("me", ELECTRON_MASS)
            .var("mp", PROTON_MASS)
            .var("c", SPEED_OF_LIGHT)
            .var("e", ELEMENTARY_CHARGE)
            .var("eV", ELEMENTARY_CHARGE)
            .var("keV", 1.0e3 * ELEMENTARY_CHARGE)
            .var("MeV", 1.0e6 * ELEMENTARY_CHARGE)
            .var("GeV", 1.0e9 * ELEMENTARY_CHARGE)
            .var("femto", 1.0e-15)
            .var("pico", 1.0e-12)
            .var("nano", 1.0e-9)
            .var("micro", 1.0e-6)
            .var("milli", 1.0e-3)
            .func3("step", |x, min, max| if x >= min && x < max {1.0} else {0.0})
            .func3("gauss", |x, mu, sigma| (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp())
            .func("critical", |omega| VACUUM_PERMITTIVITY * ELECTRON_MASS * omega.powi(2) / ELEMENTARY_CHARGE.powi(2))
            .func("plasma_frequency", |n| {
                (n * ELEMENTARY_CHARGE.powi(2) / (VACUUM_PERMITTIVITY * ELECTRON_MASS)).sqrt()
            });

        // Read in from 'constants' block
        let tmp = self.ctx.clone(); // a constant cannot depend on other constants yet...

        if let Some(hash) = self.input[section].as_hash() {
            for (a, b) in hash {
                match (a, b) {
                    (Yaml::String(s), Yaml::Real(v)) => {
                        if let Ok(num) = v.parse::<f64>() {self.ctx.var(s, num);}
                    },
                    (Yaml::String(s), Yaml::Integer(v)) => {
                        self.ctx.var(s, *v as f64);
                    },
                    (Yaml::String(s), Yaml::String(v)) => {
                        if let Ok(expr) = v.parse::<meval::Expr>() {
                            if let Ok(num) = expr.eval_with_context(&tmp) {self.ctx.var(s, num);}
                        }
                    },
                    _ => ()
                }
            }
        }

        self
    }

    pub fn contains(&self, section: &str, field: &str) -> bool {
        !self.input[section][field].is_badvalue()
    }

    pub fn real(&self, section: &str, field: &str) -> Result<f64, InputError> {
        let name = field.to_owned();
        match &self.input[section][field] {
            Yaml::Real(s) => s.parse::<f64>().map_err(|_| InputError::CouldNotParse(name.clone(), s.clone())),
            Yaml::Integer(i) => Ok(*i as f64),
            Yaml::String(s) => {
                let expr = s.parse::<meval::Expr>().map_err(|_| InputError::CouldNotParse(name.clone(), s.clone()))?;
                expr.eval_with_context(&self.ctx).map_err(|_| InputError::CouldNotParse(name.clone(), s.clone()))
            },
            _ => Err(InputError::MissingField(section.to_owned(), name)),
        }
    }

    /// Like `real`, but a missing field falls back on the default.
    pub fn real_or(&self, section: &str, field: &str, default: f64) -> Result<f64, InputError> {
        match self.real(section, field) {
            Err(InputError::MissingField(_, _)) => Ok(default),
            other => other,
        }
    }

    pub fn func(&'a self, section: &str, field: &str, arg: &str) -> Result<impl Fn(f64) -> f64 + 'a, InputError> {
        match &self.input[section][field] {
            Yaml::String(s) | Yaml::Real(s) => {
                let expr = s.parse::<meval::Expr>().map_err(|_| InputError::CouldNotParse(field.to_owned(), s.clone()))?;
                let func = expr.bind_with_context(&self.ctx, arg).map_err(|_| InputError::CouldNotParse(field.to_owned(), s.clone()))?;
                Ok(func)
            },
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned()))
        }
    }

    pub fn func2(&'a self, section: &str, field: &str, args: [&str; 2]) -> Result<impl Fn(f64, f64) -> f64 + 'a, InputError> {
        match &self.input[section][field] {
            Yaml::String(s) | Yaml::Real(s) => {
                let expr = s.parse::<meval::Expr>().map_err(|_| InputError::CouldNotParse(field.to_owned(), s.clone()))?;
                expr.bind2_with_context(&self.ctx, args[0], args[1]).map_err(|_| InputError::CouldNotParse(field.to_owned(), s.clone()))
            },
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned()))
        }
    }

    pub fn integer(&self, section: &str, field: &str) -> Result<i64, InputError> {
        match &self.input[section][field] {
            Yaml::Integer(i) => Ok(*i),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn integer_or(&self, section: &str, field: &str, default: i64) -> Result<i64, InputError> {
        match self.integer(section, field) {
            Err(InputError::MissingField(_, _)) => Ok(default),
            other => other,
        }
    }

    pub fn bool(&self, section: &str, field: &str) -> Result<bool, InputError> {
        match &self.input[section][field] {
            Yaml::Boolean(b) => Ok(*b),
            Yaml::Integer(i) => Ok(*i != 0),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn bool_or(&self, section: &str, field: &str, default: bool) -> Result<bool, InputError> {
        match self.bool(section, field) {
            Err(InputError::MissingField(_, _)) => Ok(default),
            other => other,
        }
    }

    pub fn strings(&self, section: &str, field: &str) -> Result<Vec<String>, InputError> {
        let name = field.to_owned();
        match &self.input[section][field] {
            Yaml::String(s) => {
                Ok(vec![s.clone()])
            },
            Yaml::Array(array) => {
                let take_yaml_string = |y: &Yaml| -> Option<String> {
                    match y {
                        Yaml::String(s) => Some(s.clone()),
                        _ => None
                    }
                };
                let got: Vec<String> = array.iter().filter_map(take_yaml_string).collect();
                if got.is_empty() {
                    Err(InputError::CouldNotParse(section.to_owned(), name))
                } else {
                    Ok(got)
                }
            },
            _ => Err(InputError::MissingField(section.to_owned(), name))
        }
    }

    pub fn string(&self, section: &str, field: &str) -> Result<String, InputError> {
        let strs = self.strings(section, field)?;
        Ok(strs[0].clone())
    }

    pub fn string_or(&self, section: &str, field: &str, default: &str) -> Result<String, InputError> {
        match self.string(section, field) {
            Err(InputError::MissingField(_, _)) => Ok(default.to_owned()),
            other => other,
        }
    }

    pub fn reals(&self, section: &str, field: &str) -> Result<Vec<f64>, InputError> {
        match &self.input[section][field] {
            Yaml::Array(array) => {
                let mut got = Vec::with_capacity(array.len());
                for y in array {
                    let v = match y {
                        Yaml::Real(s) => s.parse::<f64>().ok(),
                        Yaml::Integer(i) => Some(*i as f64),
                        Yaml::String(s) => s.parse::<meval::Expr>().ok()
                            .and_then(|e| e.eval_with_context(&self.ctx).ok()),
                        _ => None,
                    };
                    match v {
                        Some(v) => got.push(v),
                        None => return Err(InputError::CouldNotParse(section.to_owned(), field.to_owned())),
                    }
                }
                Ok(got)
            },
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }
}

/// How the time step is chosen.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TimeStep {
    Fixed(f64),
    Adaptive,
}

/// Which scheme advances the plasma between slices.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PusherKind {
    DualNumber,
    AdamsBashforth5,
}

/// Run-level solver knobs, read once at startup and passed by const
/// reference everywhere else.
#[derive(Clone, Debug)]
pub struct SolverConfig {
    pub max_step: usize,
    pub normalized_units: bool,
    pub verbose: i64,
    pub numprocs_x: usize,
    pub numprocs_y: usize,
    pub grid_size_z: usize,
    pub depos_order_xy: usize,
    pub depos_order_z: usize,
    pub predcorr_b_error_tolerance: f64,
    pub predcorr_max_iterations: usize,
    pub predcorr_b_mixing_factor: f64,
    pub slice_deposition: bool,
    pub output_period: usize,
    pub dt: TimeStep,
    pub do_dirichlet_poisson: bool,
    pub open_boundary: bool,
    pub extended_solve: bool,
    pub explicit_solve: bool,
    pub poisson_multigrid: bool,
    pub mg_tolerance_rel: f64,
    pub mg_tolerance_abs: f64,
    pub mg_max_iterations: usize,
}

impl SolverConfig {
    pub fn parse(input: &Configuration) -> Result<SolverConfig, InputError> {
        let dt = if input.contains("hipace", "dt") {
            match input.string("hipace", "dt") {
                Ok(s) if s == "adaptive" => TimeStep::Adaptive,
                _ => TimeStep::Fixed(input.real("hipace", "dt")?),
            }
        } else {
            TimeStep::Fixed(0.0)
        };

        let depos_order_xy = input.integer_or("hipace", "depos_order_xy", 2)?;
        if depos_order_xy < 0 || depos_order_xy > 3 {
            return Err(InputError::Inconsistent(
                format!("hipace.depos_order_xy = {} is outside the supported range 0..3", depos_order_xy)
            ));
        }

        Ok(SolverConfig {
            max_step: input.integer_or("control", "max_step", 0)? as usize,
            normalized_units: input.bool_or("hipace", "normalized_units", false)?,
            verbose: input.integer_or("hipace", "verbose", 0)?,
            numprocs_x: input.integer_or("hipace", "numprocs_x", 1)? as usize,
            numprocs_y: input.integer_or("hipace", "numprocs_y", 1)? as usize,
            grid_size_z: input.integer_or("hipace", "grid_size_z", 0)? as usize,
            depos_order_xy: depos_order_xy as usize,
            depos_order_z: input.integer_or("hipace", "depos_order_z", 0)? as usize,
            predcorr_b_error_tolerance: input.real_or("hipace", "predcorr_B_error_tolerance", 4.0e-2)?,
            predcorr_max_iterations: input.integer_or("hipace", "predcorr_max_iterations", 5)? as usize,
            predcorr_b_mixing_factor: input.real_or("hipace", "predcorr_B_mixing_factor", 0.1)?,
            slice_deposition: input.bool_or("hipace", "slice_deposition", false)?,
            output_period: input.integer_or("hipace", "output_period", 0)? as usize,
            dt,
            do_dirichlet_poisson: input.bool_or("fields", "do_dirichlet_poisson", true)?,
            open_boundary: input.bool_or("fields", "open_boundary", false)?,
            extended_solve: input.bool_or("fields", "extended_solve", false)?,
            explicit_solve: input.bool_or("fields", "explicit_solve", false)?,
            poisson_multigrid: input.bool_or("fields", "poisson_multigrid", false)?,
            mg_tolerance_rel: input.real_or("fields", "mg_tolerance_rel", 1.0e-4)?,
            mg_tolerance_abs: input.real_or("fields", "mg_tolerance_abs", 0.0)?,
            mg_max_iterations: input.integer_or("fields", "mg_max_iterations", 100)? as usize,
        })
    }

    /// The transverse process grid must tile the world communicator; the
    /// remaining factor is the longitudinal rank count.
    pub fn numprocs_z(&self, world_size: usize) -> Result<usize, InputError> {
        let nxy = self.numprocs_x * self.numprocs_y;
        if nxy == 0 || world_size % nxy != 0 {
            return Err(InputError::Inconsistent(
                format!("hipace.numprocs_x * hipace.numprocs_y = {} does not divide {} ranks", nxy, world_size)
            ));
        }
        Ok(world_size / nxy)
    }
}

pub fn ettc(start: std::time::Instant, current: usize, total: usize) -> std::time::Duration {
    let rt = start.elapsed().as_secs_f64();
    let ettc = rt * ((total - current) as f64) / (current as f64);
    std::time::Duration::from_secs_f64(ettc)
}

#[cfg(test)]
mod tests {
    use super::*;

    static INPUT: &str = "---
control:
  max_step: 10

hipace:
  normalized_units: 1
  depos_order_xy: 2
  predcorr_B_error_tolerance: 1.0e-3
  dt: adaptive
  nt_per_betatron: 20

fields:
  do_dirichlet_poisson: 1
  open_boundary: 1

constants:
  n0: 1.0e24
  sigma_z: 1.41

beam:
  position_std: [1.0, 1.0, sigma_z]
";

    #[test]
    fn parses_solver_config() {
        let mut cfg = Configuration::from_string(INPUT).unwrap();
        cfg.with_context("constants");
        let sc = SolverConfig::parse(&cfg).unwrap();
        assert_eq!(sc.max_step, 10);
        assert!(sc.normalized_units);
        assert_eq!(sc.depos_order_xy, 2);
        assert_eq!(sc.dt, TimeStep::Adaptive);
        assert!(sc.do_dirichlet_poisson);
        assert!(sc.open_boundary);
        assert!(!sc.explicit_solve);
        assert!((sc.predcorr_b_error_tolerance - 1.0e-3).abs() < 1.0e-12);
        // defaults
        assert_eq!(sc.predcorr_max_iterations, 5);
        assert!((sc.predcorr_b_mixing_factor - 0.1).abs() < 1.0e-12);
    }

    #[test]
    fn expressions_use_constants_block() {
        let mut cfg = Configuration::from_string(INPUT).unwrap();
        cfg.with_context("constants");
        let stds = cfg.reals("beam", "position_std").unwrap();
        assert_eq!(stds.len(), 3);
        assert!((stds[2] - 1.41).abs() < 1.0e-12);
    }

    #[test]
    fn process_grid_must_tile_world() {
        let mut cfg = Configuration::from_string(INPUT).unwrap();
        cfg.with_context("constants");
        let sc = SolverConfig::parse(&cfg).unwrap();
        assert_eq!(sc.numprocs_z(4).unwrap(), 4);
        let mut sc2 = sc.clone();
        sc2.numprocs_x = 3;
        assert!(sc2.numprocs_z(4).is_err());
    }

    #[test]
    fn missing_field_is_reported() {
        let cfg = Configuration::from_string(INPUT).unwrap();
        match cfg.real("hipace", "no_such_key") {
            Err(InputError::MissingField(s, f)) => {
                assert_eq!(s, "hipace");
                assert_eq!(f, "no_such_key");
            },
            _ => panic!("expected a missing-field error"),
        }
    }
}
