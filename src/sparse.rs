//! CSR construction helpers used throughout the assembly engine.
//!
//! `nalgebra-sparse` covers the arithmetic; the selection, stacking and
//! scaling shapes needed here are assembled directly from raw CSR data.

use itertools::izip;
use nalgebra as na;
use nalgebra_sparse as nas;

/// A 0/1 selection matrix with one entry per row: row `r` selects column
/// `cols[r]` of a `ncols`-wide space.
pub(crate) fn selection(cols: &[usize], ncols: usize) -> nas::CsrMatrix<f64> {
    let offsets: Vec<usize> = (0..=cols.len()).collect();
    nas::CsrMatrix::try_from_csr_data(cols.len(), ncols, offsets, cols.to_vec(), vec![1.0; cols.len()])
        .unwrap()
}

/// A square diagonal matrix holding the entries of `values`.
pub(crate) fn diag(values: &na::DVector<f64>) -> nas::CsrMatrix<f64> {
    // an identity matrix gives the right sparsity pattern; replace the entries
    let mut mat = nas::CsrMatrix::identity(values.len());
    for (v, entry) in izip!(values.iter(), mat.values_mut()) {
        *entry = *v;
    }
    mat
}

/// Scale row `i` of `mat` by `scale[i]`, equivalent to `diag(scale) * mat`.
pub(crate) fn scale_rows(mat: &nas::CsrMatrix<f64>, scale: &na::DVector<f64>) -> nas::CsrMatrix<f64> {
    assert_eq!(mat.nrows(), scale.len(), "one scale entry per row");
    let mut out = mat.clone();
    let (offsets, _, values) = out.csr_data_mut();
    for (i, s) in scale.iter().enumerate() {
        for k in offsets[i]..offsets[i + 1] {
            values[k] *= s;
        }
    }
    out
}

/// Multiply every stored entry by a constant.
pub(crate) fn scaled(mat: &nas::CsrMatrix<f64>, factor: f64) -> nas::CsrMatrix<f64> {
    let mut out = mat.clone();
    for v in out.values_mut() {
        *v *= factor;
    }
    out
}

/// Stack matrices with a shared column count on top of each other.
pub(crate) fn vstack(blocks: &[nas::CsrMatrix<f64>]) -> nas::CsrMatrix<f64> {
    let ncols = blocks.first().map_or(0, |b| b.ncols());
    let mut offsets = vec![0usize];
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for block in blocks {
        assert_eq!(block.ncols(), ncols, "stacked blocks must share a column count");
        let nnz_base = *offsets.last().unwrap();
        offsets.extend(block.row_offsets()[1..].iter().map(|o| nnz_base + o));
        cols.extend_from_slice(block.col_indices());
        values.extend_from_slice(block.values());
    }
    let nrows = offsets.len() - 1;
    nas::CsrMatrix::try_from_csr_data(nrows, ncols, offsets, cols, values).unwrap()
}

/// Assemble blocks into one block-diagonal matrix, in iteration order.
pub(crate) fn block_diag<'a>(
    blocks: impl IntoIterator<Item = &'a nas::CsrMatrix<f64>>,
) -> nas::CsrMatrix<f64> {
    let mut offsets = vec![0usize];
    let mut cols = Vec::new();
    let mut values = Vec::new();
    let (mut nrows, mut ncols) = (0, 0);
    for block in blocks {
        let nnz_base = *offsets.last().unwrap();
        offsets.extend(block.row_offsets()[1..].iter().map(|o| nnz_base + o));
        cols.extend(block.col_indices().iter().map(|c| ncols + c));
        values.extend_from_slice(block.values());
        nrows += block.nrows();
        ncols += block.ncols();
    }
    nas::CsrMatrix::try_from_csr_data(nrows, ncols, offsets, cols, values).unwrap()
}

/// Expand entity indices to dof columns: with `nd` dofs per entity, index `i`
/// becomes the `nd` consecutive indices `i*nd .. (i+1)*nd`.
pub(crate) fn expand_indices_nd(indices: &[usize], nd: usize) -> Vec<usize> {
    indices.iter().flat_map(|&i| i * nd..(i + 1) * nd).collect()
}

#[cfg(test)]
pub(crate) fn to_dense(mat: &nas::CsrMatrix<f64>) -> na::DMatrix<f64> {
    let mut out = na::DMatrix::zeros(mat.nrows(), mat.ncols());
    for (i, j, v) in mat.triplet_iter() {
        out[(i, j)] = *v;
    }
    out
}
