//! The global degree-of-freedom layout.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use nalgebra as na;

use crate::{
    error::Error,
    grid::{GridRef, MixedGrid},
};

/// Source of the crate-unique revision stamps carried by layouts.
static NEXT_REVISION: AtomicU64 = AtomicU64::new(0);

/// One assigned block of the global unknown vector.
#[derive(Clone, Debug)]
pub struct DofBlock {
    /// Owning grid or interface.
    pub grid: GridRef,
    /// Variable name.
    pub name: String,
    /// Declared unknowns per cell.
    pub dofs_per_cell: usize,
    /// Columns assigned to this block.
    pub range: Range<usize>,
}

/// Maps every declared `(grid, variable)` pair to a contiguous block of
/// columns in one global unknown vector.
///
/// The layout is built once from a [`MixedGrid`] and immutable afterwards:
/// subdomains first, then interfaces, in store order, with each grid's
/// variables in declaration order and running offsets, so blocks are disjoint
/// and cover `0..num_dofs()` without gaps. Declaring further variables
/// requires building a new manager, which carries a fresh revision stamp and
/// invalidates expressions bound to the old one.
#[derive(Clone, Debug)]
pub struct DofManager {
    blocks: Vec<DofBlock>,
    index: HashMap<(GridRef, String), usize>,
    num_dofs: usize,
    revision: u64,
}

impl DofManager {
    /// Build the layout for the model's current declarations.
    pub fn new(mdg: &MixedGrid) -> Self {
        let mut blocks = Vec::new();
        let mut index = HashMap::new();
        let mut offset = 0;
        let grids = mdg
            .subdomains()
            .map(|(id, _)| GridRef::from(id))
            .chain(mdg.interfaces().map(|(id, _)| GridRef::from(id)));
        for grid in grids {
            let num_cells = mdg.num_cells(grid);
            for decl in mdg.declarations(grid) {
                let size = decl.dofs_per_cell * num_cells;
                index.insert((grid, decl.name.clone()), blocks.len());
                blocks.push(DofBlock {
                    grid,
                    name: decl.name.clone(),
                    dofs_per_cell: decl.dofs_per_cell,
                    range: offset..offset + size,
                });
                offset += size;
            }
        }
        let revision = NEXT_REVISION.fetch_add(1, Ordering::Relaxed);
        debug!(
            "dof layout revision {revision}: {offset} dofs in {} blocks",
            blocks.len()
        );
        Self {
            blocks,
            index,
            num_dofs: offset,
            revision,
        }
    }

    /// Length of the global unknown vector.
    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    /// The crate-unique stamp of this layout.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Iterate the assigned blocks in layout order.
    pub fn blocks(&self) -> impl Iterator<Item = &DofBlock> {
        self.blocks.iter()
    }

    fn lookup(&self, grid: GridRef, name: &str) -> Result<&DofBlock, Error> {
        self.index
            .get(&(grid, name.to_owned()))
            .map(|i| &self.blocks[*i])
            .ok_or_else(|| Error::UnknownVariable {
                grid,
                name: name.to_owned(),
            })
    }

    /// Columns assigned to `(grid, name)`.
    pub fn block(&self, grid: impl Into<GridRef>, name: &str) -> Result<Range<usize>, Error> {
        Ok(self.lookup(grid.into(), name)?.range.clone())
    }

    /// Declared unknowns per cell of `(grid, name)`.
    pub fn dofs_per_cell(&self, grid: impl Into<GridRef>, name: &str) -> Result<usize, Error> {
        Ok(self.lookup(grid.into(), name)?.dofs_per_cell)
    }

    /// The default global state vector: every variable's stored current
    /// iterate placed at its block, in layout order.
    pub fn assemble_iterate(&self, mdg: &MixedGrid) -> Result<na::DVector<f64>, Error> {
        let mut state = na::DVector::zeros(self.num_dofs);
        for block in &self.blocks {
            let values = mdg
                .iterate(block.grid, &block.name)
                .ok_or_else(|| Error::MissingState {
                    grid: block.grid,
                    name: block.name.clone(),
                    which: "iterate",
                })?;
            if values.len() != block.range.len() {
                return Err(Error::Shape {
                    op: "assemble_iterate",
                    detail: format!(
                        "stored iterate for `{}` on {} has {} entries, block holds {}",
                        block.name,
                        block.grid,
                        values.len(),
                        block.range.len()
                    ),
                });
            }
            state
                .rows_mut(block.range.start, values.len())
                .copy_from(values);
        }
        Ok(state)
    }
}
