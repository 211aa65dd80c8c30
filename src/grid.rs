//! The mixed-dimensional grid model and its per-grid data stores.
//!
//! Geometry and discretization are produced by external collaborators; this
//! module records only what the assembly engine consumes: entity counts, the
//! coupling maps of interfaces, variable declarations, state arrays, boundary
//! values and precomputed discretization matrices.

use std::collections::HashMap;
use std::fmt;

use nalgebra as na;
use nalgebra_sparse as nas;

/// Identifier of a subdomain within one [`MixedGrid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubdomainId(pub(crate) usize);

/// Identifier of an interface within one [`MixedGrid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub(crate) usize);

/// Reference to either a subdomain or an interface.
///
/// This is the grid half of every `(grid, variable)` key in the dof layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GridRef {
    /// A subdomain grid.
    Subdomain(SubdomainId),
    /// An interface (mortar) grid.
    Interface(InterfaceId),
}

impl From<SubdomainId> for GridRef {
    fn from(id: SubdomainId) -> Self {
        GridRef::Subdomain(id)
    }
}

impl From<InterfaceId> for GridRef {
    fn from(id: InterfaceId) -> Self {
        GridRef::Interface(id)
    }
}

impl fmt::Display for GridRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridRef::Subdomain(SubdomainId(i)) => write!(f, "subdomain {i}"),
            GridRef::Interface(InterfaceId(i)) => write!(f, "interface {i}"),
        }
    }
}

/// A grid occupying one geometric dimension of the model.
#[derive(Clone, Debug)]
pub struct Subdomain {
    /// Geometric dimension.
    pub dim: usize,
    /// Number of cells.
    pub num_cells: usize,
    /// Number of faces.
    pub num_faces: usize,
}

/// A lower-dimensional coupling grid between two subdomains of adjacent
/// dimension.
///
/// Each mortar cell couples one face of the higher-dimensional (primary)
/// subdomain to one cell of the lower-dimensional (secondary) subdomain.
/// The two geometric sides of the interface occupy the first and second half
/// of the mortar cell ordering.
#[derive(Clone, Debug)]
pub struct Interface {
    /// Geometric dimension (that of the secondary subdomain).
    pub dim: usize,
    /// The higher-dimensional subdomain.
    pub primary: SubdomainId,
    /// The lower-dimensional subdomain.
    pub secondary: SubdomainId,
    /// `primary_faces[k]` is the primary face coupled to mortar cell `k`.
    pub primary_faces: Vec<usize>,
    /// `secondary_cells[k]` is the secondary cell coupled to mortar cell `k`.
    pub secondary_cells: Vec<usize>,
}

impl Interface {
    /// Number of mortar cells.
    pub fn num_cells(&self) -> usize {
        self.primary_faces.len()
    }
}

/// Declaration of a variable on one grid.
#[derive(Clone, Debug)]
pub struct VariableDecl {
    /// Variable name.
    pub name: String,
    /// Number of unknowns per cell.
    pub dofs_per_cell: usize,
}

/// Per-grid stores consumed by the assembly engine.
#[derive(Clone, Debug, Default)]
struct GridData {
    declarations: Vec<VariableDecl>,
    iterate: HashMap<String, na::DVector<f64>>,
    previous: HashMap<String, na::DVector<f64>>,
    discretizations: HashMap<(String, String), nas::CsrMatrix<f64>>,
    boundary_values: HashMap<String, na::DVector<f64>>,
}

/// The mixed-dimensional model: subdomains, interfaces, and the per-grid data
/// stores filled by external collaborators.
///
/// Subdomains and interfaces are iterated in insertion order; that order is
/// also the order the dof layout is built in, so it must be fixed before any
/// [`DofManager`][crate::DofManager] is constructed.
#[derive(Clone, Debug, Default)]
pub struct MixedGrid {
    subdomains: Vec<Subdomain>,
    interfaces: Vec<Interface>,
    subdomain_data: Vec<GridData>,
    interface_data: Vec<GridData>,
}

impl MixedGrid {
    /// An empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subdomain with the given entity counts.
    pub fn add_subdomain(&mut self, dim: usize, num_cells: usize, num_faces: usize) -> SubdomainId {
        self.subdomains.push(Subdomain {
            dim,
            num_cells,
            num_faces,
        });
        self.subdomain_data.push(GridData::default());
        SubdomainId(self.subdomains.len() - 1)
    }

    /// Add an interface coupling `primary` and `secondary`.
    ///
    /// Panics if the coupling maps differ in length or index out of the
    /// adjacent grids' entity ranges.
    pub fn add_interface(
        &mut self,
        primary: SubdomainId,
        secondary: SubdomainId,
        primary_faces: Vec<usize>,
        secondary_cells: Vec<usize>,
    ) -> InterfaceId {
        assert_eq!(
            primary_faces.len(),
            secondary_cells.len(),
            "one primary face and one secondary cell per mortar cell"
        );
        assert!(
            primary_faces
                .iter()
                .all(|f| *f < self.subdomains[primary.0].num_faces),
            "primary face index out of range"
        );
        assert!(
            secondary_cells
                .iter()
                .all(|c| *c < self.subdomains[secondary.0].num_cells),
            "secondary cell index out of range"
        );
        self.interfaces.push(Interface {
            dim: self.subdomains[secondary.0].dim,
            primary,
            secondary,
            primary_faces,
            secondary_cells,
        });
        self.interface_data.push(GridData::default());
        InterfaceId(self.interfaces.len() - 1)
    }

    /// Look up a subdomain.
    pub fn subdomain(&self, id: SubdomainId) -> &Subdomain {
        &self.subdomains[id.0]
    }

    /// Look up an interface.
    pub fn interface(&self, id: InterfaceId) -> &Interface {
        &self.interfaces[id.0]
    }

    /// Iterate subdomains in insertion order.
    pub fn subdomains(&self) -> impl Iterator<Item = (SubdomainId, &Subdomain)> {
        self.subdomains
            .iter()
            .enumerate()
            .map(|(i, sd)| (SubdomainId(i), sd))
    }

    /// Iterate interfaces in insertion order.
    pub fn interfaces(&self) -> impl Iterator<Item = (InterfaceId, &Interface)> {
        self.interfaces
            .iter()
            .enumerate()
            .map(|(i, intf)| (InterfaceId(i), intf))
    }

    /// Number of cells of a subdomain, or mortar cells of an interface.
    pub fn num_cells(&self, grid: GridRef) -> usize {
        match grid {
            GridRef::Subdomain(id) => self.subdomains[id.0].num_cells,
            GridRef::Interface(id) => self.interfaces[id.0].num_cells(),
        }
    }

    fn data(&self, grid: GridRef) -> &GridData {
        match grid {
            GridRef::Subdomain(SubdomainId(i)) => &self.subdomain_data[i],
            GridRef::Interface(InterfaceId(i)) => &self.interface_data[i],
        }
    }

    fn data_mut(&mut self, grid: GridRef) -> &mut GridData {
        match grid {
            GridRef::Subdomain(SubdomainId(i)) => &mut self.subdomain_data[i],
            GridRef::Interface(InterfaceId(i)) => &mut self.interface_data[i],
        }
    }

    /// Declare a variable on a grid or interface, updating the multiplicity if
    /// it was already declared.
    ///
    /// Declarations made after a dof layout has been built only take effect
    /// in layouts built afterwards.
    pub fn declare_variable(&mut self, grid: impl Into<GridRef>, name: &str, dofs_per_cell: usize) {
        let data = self.data_mut(grid.into());
        if let Some(decl) = data.declarations.iter_mut().find(|d| d.name == name) {
            decl.dofs_per_cell = dofs_per_cell;
        } else {
            data.declarations.push(VariableDecl {
                name: name.to_owned(),
                dofs_per_cell,
            });
        }
    }

    /// Variables declared on a grid, in declaration order.
    pub fn declarations(&self, grid: GridRef) -> &[VariableDecl] {
        &self.data(grid).declarations
    }

    /// Store the current-iterate values of a variable.
    pub fn set_iterate(&mut self, grid: impl Into<GridRef>, name: &str, values: na::DVector<f64>) {
        self.data_mut(grid.into())
            .iterate
            .insert(name.to_owned(), values);
    }

    /// Stored current-iterate values of a variable, if any.
    pub fn iterate(&self, grid: impl Into<GridRef>, name: &str) -> Option<&na::DVector<f64>> {
        self.data(grid.into()).iterate.get(name)
    }

    /// Store the previous-timestep values of a variable.
    pub fn set_previous(&mut self, grid: impl Into<GridRef>, name: &str, values: na::DVector<f64>) {
        self.data_mut(grid.into())
            .previous
            .insert(name.to_owned(), values);
    }

    /// Stored previous-timestep values of a variable, if any.
    pub fn previous(&self, grid: impl Into<GridRef>, name: &str) -> Option<&na::DVector<f64>> {
        self.data(grid.into()).previous.get(name)
    }

    /// Store a precomputed discretization matrix under `(keyword, matrix)`.
    pub fn set_discretization_matrix(
        &mut self,
        grid: SubdomainId,
        keyword: &str,
        matrix: &str,
        mat: nas::CsrMatrix<f64>,
    ) {
        self.subdomain_data[grid.0]
            .discretizations
            .insert((keyword.to_owned(), matrix.to_owned()), mat);
    }

    /// A stored discretization matrix, if any.
    pub fn discretization_matrix(
        &self,
        grid: SubdomainId,
        keyword: &str,
        matrix: &str,
    ) -> Option<&nas::CsrMatrix<f64>> {
        self.subdomain_data[grid.0]
            .discretizations
            .get(&(keyword.to_owned(), matrix.to_owned()))
    }

    /// Store per-face boundary values under a parameter keyword.
    pub fn set_boundary_values(
        &mut self,
        grid: SubdomainId,
        keyword: &str,
        values: na::DVector<f64>,
    ) {
        self.subdomain_data[grid.0]
            .boundary_values
            .insert(keyword.to_owned(), values);
    }

    /// Stored boundary values for a keyword, if any.
    pub fn boundary_values(&self, grid: SubdomainId, keyword: &str) -> Option<&na::DVector<f64>> {
        self.subdomain_data[grid.0].boundary_values.get(keyword)
    }
}

/// A small fixed mixed-dimensional model used in tests: a 2d matrix grid with
/// 2x2 cells, two 1d fracture grids crossing it, and one interface per
/// fracture with two mortar cells on each side.
#[doc(hidden)]
pub fn tiny_md_grid() -> MixedGrid {
    let mut mdg = MixedGrid::new();
    let sd0 = mdg.add_subdomain(2, 4, 12);
    let sd1 = mdg.add_subdomain(1, 2, 3);
    let sd2 = mdg.add_subdomain(1, 2, 3);
    // both sides of each fracture, two mortar cells per side
    mdg.add_interface(sd0, sd1, vec![2, 5, 8, 11], vec![0, 1, 0, 1]);
    mdg.add_interface(sd0, sd2, vec![1, 4, 7, 10], vec![0, 1, 0, 1]);
    mdg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_is_preserved() {
        let mdg = tiny_md_grid();
        let dims: Vec<usize> = mdg.subdomains().map(|(_, sd)| sd.dim).collect();
        assert_eq!(dims, vec![2, 1, 1]);
        assert_eq!(mdg.interfaces().count(), 2);
        for (_, intf) in mdg.interfaces() {
            assert_eq!(intf.num_cells(), 4);
            assert_eq!(intf.dim, 1);
        }
    }

    #[test]
    fn declarations_keep_order_and_update_in_place() {
        let mut mdg = tiny_md_grid();
        let sd0 = mdg.subdomains().next().unwrap().0;
        mdg.declare_variable(sd0, "pressure", 1);
        mdg.declare_variable(sd0, "displacement", 2);
        mdg.declare_variable(sd0, "pressure", 3);

        let decls = mdg.declarations(sd0.into());
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].name, "pressure");
        assert_eq!(decls[0].dofs_per_cell, 3);
        assert_eq!(decls[1].name, "displacement");
    }

    #[test]
    fn state_stores_are_per_grid() {
        let mut mdg = tiny_md_grid();
        let ids: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        mdg.set_iterate(ids[1], "pressure", na::DVector::from_vec(vec![1.0, 2.0]));
        mdg.set_previous(ids[1], "pressure", na::DVector::from_vec(vec![0.5, 1.5]));

        assert_eq!(
            mdg.iterate(ids[1], "pressure").unwrap(),
            &na::DVector::from_vec(vec![1.0, 2.0])
        );
        assert_eq!(
            mdg.previous(ids[1], "pressure").unwrap(),
            &na::DVector::from_vec(vec![0.5, 1.5])
        );
        assert!(mdg.iterate(ids[0], "pressure").is_none());
    }
}
