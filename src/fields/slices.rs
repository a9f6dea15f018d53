//! The slice field store: a ring of named 2-D component arrays over one
//! transverse box. Every per-slice kernel reads and writes these arrays;
//! the roles rotate as the driver walks down the beam.

use ndarray::{s, Array3, ArrayView2, ArrayViewMut2};

use crate::grid::SliceBox;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SliceRole {
    Next,
    This,
    Previous1,
    Previous2,
    RhoIons,
    Salame,
}

/// Component names resolved once at initialization into integer indices.
#[derive(Clone, Debug, Default)]
pub struct ComponentMap {
    names: Vec<&'static str>,
}

impl ComponentMap {
    fn new(names: &[&'static str]) -> ComponentMap {
        ComponentMap { names: names.to_vec() }
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|&n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[&'static str] {
        &self.names
    }
}

pub struct Slices {
    pub bx: SliceBox,
    next: Array3<f64>,
    this: Array3<f64>,
    prev1: Array3<f64>,
    prev2: Array3<f64>,
    rho_ions: Array3<f64>,
    salame: Array3<f64>,
    next_map: ComponentMap,
    this_map: ComponentMap,
    prev1_map: ComponentMap,
    prev2_map: ComponentMap,
    rho_ions_map: ComponentMap,
    salame_map: ComponentMap,
}

impl Slices {
    /// Allocates the component arrays for the chosen solver mode. Only the
    /// explicit solve materializes `Sx`, `Sy`, `chi` and the Salame role.
    pub fn new(bx: SliceBox, explicit: bool) -> Slices {
        let this_names: &[&'static str] = if explicit {
            &["ExmBy", "EypBx", "Ez", "Bx", "By", "Bz", "Psi",
              "jx", "jy", "jz", "rho",
              "jx_beam", "jy_beam", "jz_beam", "rho_beam",
              "Sx", "Sy", "chi"]
        } else {
            &["ExmBy", "EypBx", "Ez", "Bx", "By", "Bz", "Psi",
              "jx", "jy", "jz", "rho",
              "jx_beam", "jy_beam", "jz_beam", "rho_beam"]
        };
        let next_names: &[&'static str] = &["jx", "jy", "jz", "rho", "Bx", "By"];
        let prev1_names: &[&'static str] = &["Bx", "By", "jx", "jy"];
        let prev2_names: &[&'static str] = &["Bx", "By"];
        let rho_ions_names: &[&'static str] = &["rho"];
        let salame_names: &[&'static str] = if explicit {
            &["Ez", "jz_beam", "jx", "jy"]
        } else {
            &[]
        };

        let (nyf, nxf) = bx.full_dims();
        let alloc = |n: usize| Array3::<f64>::zeros((n.max(1), nyf, nxf));

        Slices {
            bx,
            next: alloc(next_names.len()),
            this: alloc(this_names.len()),
            prev1: alloc(prev1_names.len()),
            prev2: alloc(prev2_names.len()),
            rho_ions: alloc(rho_ions_names.len()),
            salame: alloc(salame_names.len()),
            next_map: ComponentMap::new(next_names),
            this_map: ComponentMap::new(this_names),
            prev1_map: ComponentMap::new(prev1_names),
            prev2_map: ComponentMap::new(prev2_names),
            rho_ions_map: ComponentMap::new(rho_ions_names),
            salame_map: ComponentMap::new(salame_names),
        }
    }

    pub fn map(&self, role: SliceRole) -> &ComponentMap {
        match role {
            SliceRole::Next => &self.next_map,
            SliceRole::This => &self.this_map,
            SliceRole::Previous1 => &self.prev1_map,
            SliceRole::Previous2 => &self.prev2_map,
            SliceRole::RhoIons => &self.rho_ions_map,
            SliceRole::Salame => &self.salame_map,
        }
    }

    fn array(&self, role: SliceRole) -> &Array3<f64> {
        match role {
            SliceRole::Next => &self.next,
            SliceRole::This => &self.this,
            SliceRole::Previous1 => &self.prev1,
            SliceRole::Previous2 => &self.prev2,
            SliceRole::RhoIons => &self.rho_ions,
            SliceRole::Salame => &self.salame,
        }
    }

    fn array_mut(&mut self, role: SliceRole) -> &mut Array3<f64> {
        match role {
            SliceRole::Next => &mut self.next,
            SliceRole::This => &mut self.this,
            SliceRole::Previous1 => &mut self.prev1,
            SliceRole::Previous2 => &mut self.prev2,
            SliceRole::RhoIons => &mut self.rho_ions,
            SliceRole::Salame => &mut self.salame,
        }
    }

    /// Resolves a component name, panicking on components that were not
    /// registered for the chosen solver mode.
    pub fn comp(&self, role: SliceRole, name: &str) -> usize {
        self.map(role).index(name).unwrap_or_else(|| {
            panic!("component '{}' is not registered for slice role {:?}", name, role)
        })
    }

    /// Full grown view (ghost cells included) of one component.
    pub fn get(&self, role: SliceRole, name: &str) -> ArrayView2<f64> {
        let c = self.comp(role, name);
        self.array(role).index_axis(ndarray::Axis(0), c)
    }

    pub fn get_mut(&mut self, role: SliceRole, name: &str) -> ArrayViewMut2<f64> {
        let c = self.comp(role, name);
        self.array_mut(role).index_axis_mut(ndarray::Axis(0), c)
    }

    /// Two simultaneously mutable component views of the same role.
    /// Aliasing (equal components) is a caller bug and panics.
    pub fn pair_mut(&mut self, role: SliceRole, a: &str, b: &str)
        -> (ArrayViewMut2<f64>, ArrayViewMut2<f64>)
    {
        let ca = self.comp(role, a);
        let cb = self.comp(role, b);
        self.array_mut(role)
            .multi_slice_mut((s![ca, .., ..], s![cb, .., ..]))
    }

    /// Splits a role's storage along the component axis, giving read access
    /// to components below `at` and write access to those above. Used where
    /// a kernel scatters into late components while gathering from early
    /// ones of the same role.
    pub fn split_mut(&mut self, role: SliceRole, at: usize)
        -> (ndarray::ArrayViewMut3<f64>, ndarray::ArrayViewMut3<f64>)
    {
        self.array_mut(role).view_mut().split_at(ndarray::Axis(0), at)
    }

    /// Valid-region view of one component.
    pub fn interior(&self, role: SliceRole, name: &str) -> ArrayView2<f64> {
        let g = self.bx.ghost as isize;
        let c = self.comp(role, name);
        self.array(role).slice(s![c, g..-g, g..-g])
    }

    pub fn zero(&mut self, role: SliceRole, names: &[&str]) {
        for name in names {
            self.get_mut(role, name).fill(0.0);
        }
    }

    /// `dst_role.dst = src_role.src`.
    pub fn duplicate(&mut self, src_role: SliceRole, src: &str, dst_role: SliceRole, dst: &str) {
        let tmp = self.get(src_role, src).to_owned();
        self.get_mut(dst_role, dst).assign(&tmp);
    }

    /// `dst_role.dst += src_role.src`.
    pub fn add(&mut self, dst_role: SliceRole, dst: &str, src_role: SliceRole, src: &str) {
        let tmp = self.get(src_role, src).to_owned();
        let mut d = self.get_mut(dst_role, dst);
        d += &tmp;
    }

    /// Rotates `Previous2 <- Previous1 <- This` for every component the
    /// destination role registers. Called once per slice after the fields
    /// on `This` are final.
    pub fn shift_slices(&mut self) {
        let prev2_names: Vec<&'static str> = self.prev2_map.names().to_vec();
        for name in prev2_names {
            self.duplicate(SliceRole::Previous1, name, SliceRole::Previous2, name);
        }
        let prev1_names: Vec<&'static str> = self.prev1_map.names().to_vec();
        for name in prev1_names {
            self.duplicate(SliceRole::This, name, SliceRole::Previous1, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> SliceBox {
        SliceBox {
            nx: 8,
            ny: 8,
            ghost: 3,
            dx: 1.0,
            dy: 1.0,
            x_lo: -4.0,
            y_lo: -4.0,
            periodic: false,
        }
    }

    #[test]
    fn registered_components_resolve() {
        let slices = Slices::new(test_box(), false);
        assert_eq!(slices.comp(SliceRole::This, "Psi"), 6);
        assert!(slices.map(SliceRole::This).index("Sx").is_none());
        let explicit = Slices::new(test_box(), true);
        assert!(explicit.map(SliceRole::This).index("Sx").is_some());
        assert_eq!(explicit.map(SliceRole::Salame).len(), 4);
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn unregistered_component_panics() {
        let slices = Slices::new(test_box(), false);
        let _ = slices.get(SliceRole::Previous2, "jz");
    }

    #[test]
    fn shift_rotates_previous_slices() {
        let mut slices = Slices::new(test_box(), false);
        slices.get_mut(SliceRole::This, "Bx").fill(3.0);
        slices.get_mut(SliceRole::Previous1, "Bx").fill(2.0);
        slices.shift_slices();
        assert_eq!(slices.get(SliceRole::Previous2, "Bx")[[4, 4]], 2.0);
        assert_eq!(slices.get(SliceRole::Previous1, "Bx")[[4, 4]], 3.0);
        // This is untouched by the rotation
        assert_eq!(slices.get(SliceRole::This, "Bx")[[4, 4]], 3.0);
    }

    #[test]
    fn interior_excludes_ghosts() {
        let bx = test_box();
        let mut slices = Slices::new(bx, false);
        slices.get_mut(SliceRole::This, "rho").fill(1.0);
        let inner = slices.interior(SliceRole::This, "rho");
        assert_eq!(inner.dim(), (8, 8));
        assert_eq!(inner.iter().sum::<f64>(), 64.0);
    }

    #[test]
    fn disjoint_pair_views() {
        let mut slices = Slices::new(test_box(), false);
        {
            let (mut a, mut b) = slices.pair_mut(SliceRole::This, "Bx", "By");
            a.fill(1.0);
            b.fill(2.0);
        }
        assert_eq!(slices.get(SliceRole::This, "Bx")[[0, 0]], 1.0);
        assert_eq!(slices.get(SliceRole::This, "By")[[0, 0]], 2.0);
    }
}
