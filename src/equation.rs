//! The equation/variable manager, the user-facing assembly facade.

use log::debug;
use nalgebra as na;
use nalgebra_sparse as nas;

use crate::{
    dof::DofManager,
    error::Error,
    grid::{GridRef, MixedGrid},
    operator::{EvalContext, EvalValue, Expr, MergedVariable, Variable},
    sparse,
};

/// Creates variable leaves bound to one dof layout and drives tree
/// evaluation and system assembly.
///
/// The manager borrows the grid stores and the layout; registered equations
/// are its only owned state.
pub struct EquationManager<'a> {
    mdg: &'a MixedGrid,
    dofs: &'a DofManager,
    equations: Vec<(String, Expr)>,
}

impl<'a> EquationManager<'a> {
    /// A manager over the given grid stores and dof layout.
    pub fn new(mdg: &'a MixedGrid, dofs: &'a DofManager) -> Self {
        Self {
            mdg,
            dofs,
            equations: Vec::new(),
        }
    }

    /// A variable leaf for `(grid, name)`; fails if the pair was never
    /// declared.
    pub fn variable(&self, grid: impl Into<GridRef>, name: &str) -> Result<Variable, Error> {
        Variable::new(self.dofs, grid, name)
    }

    /// Merge one variable over several grids, preserving the given order.
    ///
    /// Fails if any constituent is unregistered or the names disagree.
    pub fn merge_variables(&self, pairs: &[(GridRef, &str)]) -> Result<MergedVariable, Error> {
        let sub_vars = pairs
            .iter()
            .map(|(grid, name)| Variable::new(self.dofs, *grid, name))
            .collect::<Result<Vec<_>, _>>()?;
        MergedVariable::new(sub_vars)
    }

    /// Evaluate a tree; without an explicit `state`, every current-state
    /// variable falls back to its stored iterate.
    pub fn evaluate(
        &self,
        expr: &Expr,
        state: Option<&na::DVector<f64>>,
    ) -> Result<EvalValue, Error> {
        expr.evaluate(&EvalContext::new(self.mdg, self.dofs, state))
    }

    /// Register a named equation for assembly.
    pub fn add_equation(&mut self, name: &str, eq: Expr) {
        self.equations.push((name.to_owned(), eq));
    }

    /// Evaluate every registered equation and assemble the linearized system.
    ///
    /// Returns `(A, b)` where `A` stacks the equations' Jacobians in
    /// registration order and `b` is the negated residual, so that solving
    /// `A·dx = b` gives the Newton update. Every equation must evaluate to a
    /// differentiable pair.
    pub fn assemble(
        &self,
        state: Option<&na::DVector<f64>>,
    ) -> Result<(nas::CsrMatrix<f64>, na::DVector<f64>), Error> {
        let cx = EvalContext::new(self.mdg, self.dofs, state);
        let mut jacs = Vec::with_capacity(self.equations.len());
        let mut rhs = Vec::new();
        for (name, eq) in &self.equations {
            match eq.evaluate(&cx)? {
                EvalValue::Ad(ad) => {
                    rhs.extend(ad.val.iter().map(|v| -v));
                    jacs.push(ad.jac);
                }
                other => {
                    return Err(Error::Shape {
                        op: "assemble",
                        detail: format!(
                            "equation `{name}` evaluated to a non-differentiable {}",
                            other.kind()
                        ),
                    });
                }
            }
        }
        let jac = sparse::vstack(&jacs);
        debug!(
            "assembled {} equations: {} residual entries over {} dofs",
            self.equations.len(),
            rhs.len(),
            self.dofs.num_dofs()
        );
        Ok((jac, na::DVector::from_vec(rhs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::tiny_md_grid;
    use crate::sparse::to_dense;
    use approx::assert_abs_diff_eq;

    fn populated_model() -> (MixedGrid, DofManager) {
        let mut mdg = tiny_md_grid();
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        for &sd in &sds {
            mdg.declare_variable(sd, "pressure", 1);
            let n = mdg.subdomain(sd).num_cells;
            mdg.set_iterate(
                sd,
                "pressure",
                na::DVector::from_iterator(n, (0..n).map(|i| sd.0 as f64 + i as f64 + 1.0)),
            );
        }
        let dofs = DofManager::new(&mdg);
        (mdg, dofs)
    }

    #[test]
    fn variables_and_merges_go_through_the_layout() {
        let (mdg, dofs) = populated_model();
        let manager = EquationManager::new(&mdg, &dofs);
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();

        let v = manager.variable(sds[0], "pressure").unwrap();
        assert_eq!(v.size(), 4);
        assert!(manager.variable(sds[0], "temperature").is_err());

        let pairs: Vec<(GridRef, &str)> = sds.iter().map(|&sd| (sd.into(), "pressure")).collect();
        let merged = manager.merge_variables(&pairs).unwrap();
        assert_eq!(merged.size(), 8);
        // constituents keep the requested order
        let grids: Vec<GridRef> = merged.sub_vars().iter().map(|v| v.grid()).collect();
        assert_eq!(grids, pairs.iter().map(|(g, _)| *g).collect::<Vec<_>>());
    }

    #[test]
    fn evaluation_defaults_to_stored_iterates() {
        let (mdg, dofs) = populated_model();
        let manager = EquationManager::new(&mdg, &dofs);
        let sd1 = mdg.subdomains().nth(1).unwrap().0;

        let p = manager.variable(sd1, "pressure").unwrap();
        let ad = manager
            .evaluate(&Expr::from(p.clone()), None)
            .unwrap()
            .into_ad()
            .unwrap();
        assert_eq!(&ad.val, mdg.iterate(sd1, "pressure").unwrap());

        // explicit state takes precedence
        let state = na::DVector::from_element(dofs.num_dofs(), 2.0);
        let ad2 = manager
            .evaluate(&Expr::from(p), Some(&state))
            .unwrap()
            .into_ad()
            .unwrap();
        assert_eq!(ad2.val, na::DVector::from_element(2, 2.0));
    }

    #[test]
    fn assembly_stacks_equations_in_registration_order() {
        let (mdg, dofs) = populated_model();
        let mut manager = EquationManager::new(&mdg, &dofs);
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();

        let p0 = manager.variable(sds[0], "pressure").unwrap();
        let p1 = manager.variable(sds[1], "pressure").unwrap();
        manager.add_equation("bulk", p0.clone() * p0 - 4.0);
        manager.add_equation("fracture", p1 * 2.0);

        let (a, b) = manager.assemble(None).unwrap();
        assert_eq!(a.nrows(), 6);
        assert_eq!(a.ncols(), dofs.num_dofs());
        assert_eq!(b.len(), 6);

        // first block: -(p0^2 - 4), Jacobian 2 diag(p0) at the bulk columns
        let p0_vals = mdg.iterate(sds[0], "pressure").unwrap();
        let dense = to_dense(&a);
        for i in 0..4 {
            assert_abs_diff_eq!(b[i], -(p0_vals[i] * p0_vals[i] - 4.0), epsilon = 1e-12);
            assert_abs_diff_eq!(dense[(i, i)], 2.0 * p0_vals[i], epsilon = 1e-12);
        }
        // second block: -2 p1, Jacobian 2 at the fracture columns
        let p1_vals = mdg.iterate(sds[1], "pressure").unwrap();
        let block = dofs.block(sds[1], "pressure").unwrap();
        for i in 0..2 {
            assert_abs_diff_eq!(b[4 + i], -2.0 * p1_vals[i], epsilon = 1e-12);
            assert_abs_diff_eq!(dense[(4 + i, block.start + i)], 2.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn non_differentiable_equations_are_rejected() {
        let (mdg, dofs) = populated_model();
        let mut manager = EquationManager::new(&mdg, &dofs);
        manager.add_equation("constant", Expr::Scalar(1.0));
        assert!(matches!(manager.assemble(None), Err(Error::Shape { .. })));
    }
}
