//! Projection operators between local, global and mortar index spaces.
//!
//! All projections are sparse 0/1 selections (±1 for the side-sign matrix),
//! scaled per-dof: with `nd` unknowns per entity, entity index `i` occupies
//! the `nd` consecutive positions starting at `i*nd`.

use std::collections::HashMap;

use log::debug;
use nalgebra as na;
use nalgebra_sparse as nas;

use crate::{
    error::Error,
    grid::{InterfaceId, MixedGrid, SubdomainId},
    sparse,
};

/// Restriction and prolongation between the concatenated cell/face orderings
/// of an ordered set of subdomains and the local orderings of its members.
///
/// Built once per (grid set, dofs-per-entity); the matrices are assembled on
/// demand from the stored offsets.
#[derive(Clone, Debug)]
pub struct SubdomainProjections {
    grids: Vec<SubdomainId>,
    cell_offsets: Vec<usize>,
    face_offsets: Vec<usize>,
    nd: usize,
}

impl SubdomainProjections {
    /// Projections over the given ordered subdomain set with `nd` dofs per
    /// entity.
    pub fn new(mdg: &MixedGrid, grids: &[SubdomainId], nd: usize) -> Self {
        let mut cell_offsets = vec![0];
        let mut face_offsets = vec![0];
        for &g in grids {
            let sd = mdg.subdomain(g);
            cell_offsets.push(cell_offsets.last().unwrap() + sd.num_cells);
            face_offsets.push(face_offsets.last().unwrap() + sd.num_faces);
        }
        Self {
            grids: grids.to_vec(),
            cell_offsets,
            face_offsets,
            nd,
        }
    }

    fn position(&self, grid: SubdomainId) -> Result<usize, Error> {
        self.grids
            .iter()
            .position(|g| *g == grid)
            .ok_or(Error::UnknownGrid { grid: grid.into() })
    }

    fn restriction(
        &self,
        grids: &[SubdomainId],
        offsets: &[usize],
    ) -> Result<nas::CsrMatrix<f64>, Error> {
        let total = offsets.last().copied().unwrap_or(0);
        let mut entity_cols = Vec::new();
        for &g in grids {
            let pos = self.position(g)?;
            entity_cols.extend(offsets[pos]..offsets[pos + 1]);
        }
        Ok(sparse::selection(
            &sparse::expand_indices_nd(&entity_cols, self.nd),
            total * self.nd,
        ))
    }

    /// Restrict the global cell vector to the listed grids' cells, with rows
    /// stacked in list order.
    pub fn cell_restriction(&self, grids: &[SubdomainId]) -> Result<nas::CsrMatrix<f64>, Error> {
        self.restriction(grids, &self.cell_offsets)
    }

    /// Prolong the listed grids' cell values into the global cell vector; the
    /// transpose of [`cell_restriction`](Self::cell_restriction).
    pub fn cell_prolongation(&self, grids: &[SubdomainId]) -> Result<nas::CsrMatrix<f64>, Error> {
        Ok(self.cell_restriction(grids)?.transpose())
    }

    /// Restrict the global face vector to the listed grids' faces, with rows
    /// stacked in list order.
    pub fn face_restriction(&self, grids: &[SubdomainId]) -> Result<nas::CsrMatrix<f64>, Error> {
        self.restriction(grids, &self.face_offsets)
    }

    /// Prolong the listed grids' face values into the global face vector; the
    /// transpose of [`face_restriction`](Self::face_restriction).
    pub fn face_prolongation(&self, grids: &[SubdomainId]) -> Result<nas::CsrMatrix<f64>, Error> {
        Ok(self.face_restriction(grids)?.transpose())
    }
}

/// The mappings between the mortar cells of a set of interfaces and the
/// face/cell spaces of the subdomains they couple, plus the side-sign matrix
/// enforcing flux continuity.
///
/// `_int` variants sum extensive quantities (fluxes); `_avg` variants carry
/// intensive quantities (pressures). They share the sparsity pattern and,
/// with the unit weighting used here, the values; finer geometric averaging
/// would only change the `_avg` scaling.
#[derive(Clone, Debug)]
pub struct MortarProjections {
    /// Map mortar values to faces of the primary subdomains, summing.
    pub mortar_to_primary_int: nas::CsrMatrix<f64>,
    /// Map mortar values to faces of the primary subdomains, averaging.
    pub mortar_to_primary_avg: nas::CsrMatrix<f64>,
    /// Map primary face values to the mortar cells, summing.
    pub primary_to_mortar_int: nas::CsrMatrix<f64>,
    /// Map primary face values to the mortar cells, averaging.
    pub primary_to_mortar_avg: nas::CsrMatrix<f64>,
    /// Map mortar values to cells of the secondary subdomains, summing.
    pub mortar_to_secondary_int: nas::CsrMatrix<f64>,
    /// Map mortar values to cells of the secondary subdomains, averaging.
    pub mortar_to_secondary_avg: nas::CsrMatrix<f64>,
    /// Map secondary cell values to the mortar cells, summing.
    pub secondary_to_mortar_int: nas::CsrMatrix<f64>,
    /// Map secondary cell values to the mortar cells, averaging.
    pub secondary_to_mortar_avg: nas::CsrMatrix<f64>,
    /// Diagonal ±1 matrix over all mortar cells: the first half of each
    /// interface's cells carry −1, the second half +1, so that summing the
    /// two sides' contributions expresses flux continuity.
    pub sign_of_mortar_sides: nas::CsrMatrix<f64>,
}

impl MortarProjections {
    /// Build all mortar projections for the given ordered subdomain and
    /// interface sets, with `nd` dofs per entity.
    ///
    /// Fails if an interface couples a subdomain outside the subdomain set.
    pub fn new(
        mdg: &MixedGrid,
        subdomains: &[SubdomainId],
        interfaces: &[InterfaceId],
        nd: usize,
    ) -> Result<Self, Error> {
        let mut cell_offset = HashMap::new();
        let mut face_offset = HashMap::new();
        let (mut cells, mut faces) = (0, 0);
        for &g in subdomains {
            let sd = mdg.subdomain(g);
            cell_offset.insert(g, cells);
            face_offset.insert(g, faces);
            cells += sd.num_cells;
            faces += sd.num_faces;
        }

        let mut primary_face_cols = Vec::new();
        let mut secondary_cell_cols = Vec::new();
        let mut signs = Vec::new();
        for &i in interfaces {
            let intf = mdg.interface(i);
            let f0 = *face_offset
                .get(&intf.primary)
                .ok_or(Error::UnknownGrid {
                    grid: intf.primary.into(),
                })?;
            let c0 = *cell_offset
                .get(&intf.secondary)
                .ok_or(Error::UnknownGrid {
                    grid: intf.secondary.into(),
                })?;
            primary_face_cols.extend(intf.primary_faces.iter().map(|f| f0 + f));
            secondary_cell_cols.extend(intf.secondary_cells.iter().map(|c| c0 + c));
            // opposite signs on the two geometric sides
            let half = intf.num_cells() / 2;
            signs.extend(std::iter::repeat(-1.0).take(half * nd));
            signs.extend(std::iter::repeat(1.0).take((intf.num_cells() - half) * nd));
        }

        let primary_to_mortar = sparse::selection(
            &sparse::expand_indices_nd(&primary_face_cols, nd),
            faces * nd,
        );
        let secondary_to_mortar = sparse::selection(
            &sparse::expand_indices_nd(&secondary_cell_cols, nd),
            cells * nd,
        );
        let mortar_to_primary = primary_to_mortar.transpose();
        let mortar_to_secondary = secondary_to_mortar.transpose();
        debug!(
            "mortar projections over {} interfaces: {} mortar cells, nd = {nd}",
            interfaces.len(),
            primary_face_cols.len()
        );
        Ok(Self {
            mortar_to_primary_int: mortar_to_primary.clone(),
            mortar_to_primary_avg: mortar_to_primary,
            primary_to_mortar_int: primary_to_mortar.clone(),
            primary_to_mortar_avg: primary_to_mortar,
            mortar_to_secondary_int: mortar_to_secondary.clone(),
            mortar_to_secondary_avg: mortar_to_secondary,
            secondary_to_mortar_int: secondary_to_mortar.clone(),
            secondary_to_mortar_avg: secondary_to_mortar,
            sign_of_mortar_sides: sparse::diag(&na::DVector::from_vec(signs)),
        })
    }
}
