//! Composable operator expressions and their evaluation.
//!
//! An [`Expr`] is an immutable tree: leaves wrap unknowns, constants and
//! references into the per-grid stores; internal nodes combine subtrees
//! arithmetically or through projection matrices. Trees are built with the
//! usual operator syntax,
//!
//! ```
//! # use mixdim::{grid::tiny_md_grid, DofManager, EquationManager};
//! # let mut mdg = tiny_md_grid();
//! # let sd0 = mdg.subdomains().next().unwrap().0;
//! # mdg.declare_variable(sd0, "pressure", 1);
//! # let dofs = DofManager::new(&mdg);
//! # let manager = EquationManager::new(&mdg, &dofs);
//! let p = manager.variable(sd0, "pressure")?;
//! let residual = p.clone() * p - 1.0;
//! # Ok::<(), mixdim::Error>(())
//! ```
//!
//! and evaluated any number of times against different global state vectors;
//! building or evaluating a tree never mutates grid state.

use nalgebra as na;
use nalgebra_sparse as nas;

use crate::{
    dof::DofManager,
    error::Error,
    forward_mode::AdArray,
    grid::{GridRef, MixedGrid, SubdomainId},
    sparse,
};

/// Which stored state a variable leaf refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateRef {
    /// The current iterate: the unknowns being solved for.
    Current,
    /// The value frozen at the previous nonlinear iteration.
    PreviousIteration,
    /// The value frozen at the previous time step.
    PreviousTimestep,
}

/// A named unknown on one grid or interface.
///
/// Bound to the dof layout it was created against; evaluating it through a
/// layout with a different revision fails with [`Error::StaleLayout`].
#[derive(Clone, Debug)]
pub struct Variable {
    grid: GridRef,
    name: String,
    dofs_per_cell: usize,
    size: usize,
    state: StateRef,
    layout_revision: u64,
}

impl Variable {
    /// Bind a variable leaf to a dof layout; fails if `(grid, name)` was
    /// never declared.
    pub fn new(dofs: &DofManager, grid: impl Into<GridRef>, name: &str) -> Result<Self, Error> {
        let grid = grid.into();
        let range = dofs.block(grid, name)?;
        Ok(Self {
            grid,
            name: name.to_owned(),
            dofs_per_cell: dofs.dofs_per_cell(grid, name)?,
            size: range.len(),
            state: StateRef::Current,
            layout_revision: dofs.revision(),
        })
    }

    /// The owning grid or interface.
    pub fn grid(&self) -> GridRef {
        self.grid
    }

    /// The variable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared unknowns per cell.
    pub fn dofs_per_cell(&self) -> usize {
        self.dofs_per_cell
    }

    /// Total unknowns of this variable.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Which stored state this leaf refers to.
    pub fn state(&self) -> StateRef {
        self.state
    }

    /// A copy frozen at the previous time step.
    ///
    /// Such leaves evaluate to plain arrays read from the grid stores; they
    /// never carry a Jacobian, whatever state vector is supplied.
    pub fn previous_timestep(&self) -> Self {
        Self {
            state: StateRef::PreviousTimestep,
            ..self.clone()
        }
    }

    /// A copy frozen at the previous nonlinear iteration.
    pub fn previous_iteration(&self) -> Self {
        Self {
            state: StateRef::PreviousIteration,
            ..self.clone()
        }
    }

    fn stored(&self, cx: &EvalContext, state: StateRef) -> Result<na::DVector<f64>, Error> {
        let (values, which) = match state {
            StateRef::PreviousTimestep => (
                cx.mdg.previous(self.grid, &self.name),
                "previous-timestep",
            ),
            _ => (cx.mdg.iterate(self.grid, &self.name), "iterate"),
        };
        let values = values.ok_or_else(|| Error::MissingState {
            grid: self.grid,
            name: self.name.clone(),
            which,
        })?;
        if values.len() != self.size {
            return Err(Error::Shape {
                op: "variable",
                detail: format!(
                    "stored {which} values for `{}` on {} have {} entries, variable has {}",
                    self.name,
                    self.grid,
                    values.len(),
                    self.size
                ),
            });
        }
        Ok(values.clone())
    }

    fn evaluate(&self, cx: &EvalContext) -> Result<EvalValue, Error> {
        if self.layout_revision != cx.dofs.revision() {
            return Err(Error::StaleLayout {
                built: self.layout_revision,
                found: cx.dofs.revision(),
            });
        }
        match self.state {
            StateRef::Current => {
                let range = cx.dofs.block(self.grid, &self.name)?;
                let val = match cx.state {
                    Some(state) => {
                        if state.len() != cx.dofs.num_dofs() {
                            return Err(Error::Shape {
                                op: "variable",
                                detail: format!(
                                    "state vector has {} entries, dof layout has {}",
                                    state.len(),
                                    cx.dofs.num_dofs()
                                ),
                            });
                        }
                        state.rows(range.start, range.len()).into_owned()
                    }
                    None => self.stored(cx, StateRef::Current)?,
                };
                let cols: Vec<usize> = range.clone().collect();
                let jac = sparse::selection(&cols, cx.dofs.num_dofs());
                Ok(EvalValue::Ad(AdArray::new(val, jac)))
            }
            // frozen states are plain data, never differentiable
            state => Ok(EvalValue::Array(self.stored(cx, state)?)),
        }
    }
}

/// One variable concatenated over several grids and interfaces.
///
/// The merge order is preserved: values concatenate and selection matrices
/// stack in the order the constituents were given, so repeated evaluations
/// are reproducible.
#[derive(Clone, Debug)]
pub struct MergedVariable {
    sub_vars: Vec<Variable>,
}

impl MergedVariable {
    /// Merge the given variables; all constituents must share one name.
    pub fn new(sub_vars: Vec<Variable>) -> Result<Self, Error> {
        if let Some(first) = sub_vars.first() {
            for v in &sub_vars[1..] {
                if v.name != first.name {
                    return Err(Error::NameMismatch {
                        first: first.name.clone(),
                        second: v.name.clone(),
                    });
                }
            }
        }
        Ok(Self { sub_vars })
    }

    /// The constituents in merge order.
    pub fn sub_vars(&self) -> &[Variable] {
        &self.sub_vars
    }

    /// Total unknowns over all constituents.
    pub fn size(&self) -> usize {
        self.sub_vars.iter().map(Variable::size).sum()
    }

    /// A copy with every constituent frozen at the previous time step.
    pub fn previous_timestep(&self) -> Self {
        Self {
            sub_vars: self
                .sub_vars
                .iter()
                .map(Variable::previous_timestep)
                .collect(),
        }
    }

    /// A copy with every constituent frozen at the previous iteration.
    pub fn previous_iteration(&self) -> Self {
        Self {
            sub_vars: self
                .sub_vars
                .iter()
                .map(Variable::previous_iteration)
                .collect(),
        }
    }

    fn evaluate(&self, cx: &EvalContext) -> Result<EvalValue, Error> {
        let mut vals = Vec::with_capacity(self.size());
        let mut jacs: Vec<(usize, Option<nas::CsrMatrix<f64>>)> = Vec::new();
        for v in &self.sub_vars {
            match v.evaluate(cx)? {
                EvalValue::Ad(ad) => {
                    vals.extend(ad.val.iter().copied());
                    jacs.push((ad.len(), Some(ad.jac)));
                }
                EvalValue::Array(arr) => {
                    jacs.push((arr.len(), None));
                    vals.extend(arr.iter().copied());
                }
                // variables only ever evaluate to pairs or arrays
                _ => unreachable!(),
            }
        }
        if jacs.iter().all(|(_, jac)| jac.is_none()) {
            return Ok(EvalValue::Array(na::DVector::from_vec(vals)));
        }
        // frozen constituents contribute zero blocks to the stacked Jacobian
        let blocks: Vec<nas::CsrMatrix<f64>> = jacs
            .into_iter()
            .map(|(rows, jac)| {
                jac.unwrap_or_else(|| nas::CsrMatrix::zeros(rows, cx.dofs.num_dofs()))
            })
            .collect();
        Ok(EvalValue::Ad(AdArray::new(
            na::DVector::from_vec(vals),
            sparse::vstack(&blocks),
        )))
    }
}

/// A reference to one named discretization matrix per subdomain, assembled
/// block-diagonally over the span of the operator.
#[derive(Clone, Debug)]
pub struct Discretization {
    keyword: String,
    matrix: String,
    subdomains: Vec<SubdomainId>,
}

impl Discretization {
    /// Reference the matrix stored under `(keyword, matrix)` on each listed
    /// subdomain.
    pub fn new(keyword: &str, matrix: &str, subdomains: Vec<SubdomainId>) -> Self {
        Self {
            keyword: keyword.to_owned(),
            matrix: matrix.to_owned(),
            subdomains,
        }
    }

    fn evaluate(&self, cx: &EvalContext) -> Result<EvalValue, Error> {
        let mut blocks = Vec::with_capacity(self.subdomains.len());
        for &sd in &self.subdomains {
            let mat = cx
                .mdg
                .discretization_matrix(sd, &self.keyword, &self.matrix)
                .ok_or_else(|| Error::MissingMatrix {
                    grid: sd.into(),
                    keyword: self.keyword.clone(),
                    matrix: self.matrix.clone(),
                })?;
            blocks.push(mat);
        }
        Ok(EvalValue::Matrix(sparse::block_diag(blocks)))
    }
}

/// Binary combinators of the expression tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication: elementwise between vector-valued operands, a matrix
    /// product when a matrix is involved.
    Mul,
    /// Division.
    Div,
    /// Power.
    Pow,
}

/// Unary operations of the expression tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Negation.
    Neg,
}

/// A composable operator expression.
#[derive(Clone, Debug)]
pub enum Expr {
    /// A single unknown on one grid.
    Variable(Variable),
    /// One unknown concatenated over several grids.
    Merged(MergedVariable),
    /// A constant sparse matrix.
    Matrix(nas::CsrMatrix<f64>),
    /// A constant dense vector.
    Array(na::DVector<f64>),
    /// A constant scalar.
    Scalar(f64),
    /// Per-subdomain discretization matrices, block-diagonal over the span.
    Discretization(Discretization),
    /// Stored boundary values for a keyword, concatenated over subdomains.
    Boundary {
        /// Parameter keyword the values are stored under.
        keyword: String,
        /// Subdomains whose values concatenate, in order.
        subdomains: Vec<SubdomainId>,
    },
    /// A projection matrix applied to a subtree.
    Projection {
        /// The projection matrix.
        mat: nas::CsrMatrix<f64>,
        /// The projected subtree.
        operand: Box<Expr>,
    },
    /// An arithmetic combination of two subtrees.
    Binary {
        /// The combinator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// A unary operation on a subtree.
    Unary {
        /// The operation.
        op: UnaryOp,
        /// The operand.
        operand: Box<Expr>,
    },
}

impl Expr {
    /// Apply a projection matrix to a subtree.
    pub fn project(mat: nas::CsrMatrix<f64>, operand: impl Into<Expr>) -> Expr {
        Expr::Projection {
            mat,
            operand: Box::new(operand.into()),
        }
    }

    /// Reference a named discretization matrix over the given subdomains.
    pub fn discretization(keyword: &str, matrix: &str, subdomains: Vec<SubdomainId>) -> Expr {
        Expr::Discretization(Discretization::new(keyword, matrix, subdomains))
    }

    /// Reference stored boundary values over the given subdomains.
    pub fn boundary(keyword: &str, subdomains: Vec<SubdomainId>) -> Expr {
        Expr::Boundary {
            keyword: keyword.to_owned(),
            subdomains,
        }
    }

    /// This subtree raised to a constant power.
    pub fn powf(self, exp: f64) -> Expr {
        self.pow(exp)
    }

    /// This subtree raised to a variable power.
    pub fn pow(self, exp: impl Into<Expr>) -> Expr {
        Expr::Binary {
            op: BinaryOp::Pow,
            lhs: Box::new(self),
            rhs: Box::new(exp.into()),
        }
    }

    /// Evaluate the tree against the given context.
    ///
    /// Returns an [`EvalValue::Ad`] pair when any node below depends on the
    /// current unknowns, and a plain array, matrix or scalar otherwise.
    pub fn evaluate(&self, cx: &EvalContext) -> Result<EvalValue, Error> {
        match self {
            Expr::Variable(v) => v.evaluate(cx),
            Expr::Merged(m) => m.evaluate(cx),
            Expr::Matrix(m) => Ok(EvalValue::Matrix(m.clone())),
            Expr::Array(a) => Ok(EvalValue::Array(a.clone())),
            Expr::Scalar(c) => Ok(EvalValue::Scalar(*c)),
            Expr::Discretization(d) => d.evaluate(cx),
            Expr::Boundary {
                keyword,
                subdomains,
            } => {
                let mut vals = Vec::new();
                for &sd in subdomains {
                    let arr =
                        cx.mdg
                            .boundary_values(sd, keyword)
                            .ok_or_else(|| Error::MissingState {
                                grid: sd.into(),
                                name: keyword.clone(),
                                which: "boundary",
                            })?;
                    vals.extend(arr.iter().copied());
                }
                Ok(EvalValue::Array(na::DVector::from_vec(vals)))
            }
            Expr::Projection { mat, operand } => apply_projection(mat, operand.evaluate(cx)?),
            Expr::Binary { op, lhs, rhs } => apply_binary(*op, lhs.evaluate(cx)?, rhs.evaluate(cx)?),
            Expr::Unary { op, operand } => apply_unary(*op, operand.evaluate(cx)?),
        }
    }
}

/// Everything an evaluation reads: grid stores, the dof layout, and
/// optionally an explicit global state vector.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    /// Grid model and per-grid stores.
    pub mdg: &'a MixedGrid,
    /// The dof layout state vectors are aligned with.
    pub dofs: &'a DofManager,
    /// State to evaluate current-state variables at; stored iterates are used
    /// when absent.
    pub state: Option<&'a na::DVector<f64>>,
}

impl<'a> EvalContext<'a> {
    /// Bundle a context from its parts.
    pub fn new(
        mdg: &'a MixedGrid,
        dofs: &'a DofManager,
        state: Option<&'a na::DVector<f64>>,
    ) -> Self {
        Self { mdg, dofs, state }
    }
}

/// The result of evaluating an expression.
#[derive(Clone, Debug)]
pub enum EvalValue {
    /// A differentiable pair: the subtree depends on current unknowns.
    Ad(AdArray),
    /// A plain array: constants and frozen states only.
    Array(na::DVector<f64>),
    /// A matrix: no vector-valued leaf below.
    Matrix(nas::CsrMatrix<f64>),
    /// A scalar constant.
    Scalar(f64),
}

impl EvalValue {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            EvalValue::Ad(_) => "ad pair",
            EvalValue::Array(_) => "array",
            EvalValue::Matrix(_) => "matrix",
            EvalValue::Scalar(_) => "scalar",
        }
    }

    /// The differentiable pair, if the result carries one.
    pub fn into_ad(self) -> Option<AdArray> {
        match self {
            EvalValue::Ad(ad) => Some(ad),
            _ => None,
        }
    }

    /// The plain array, if the result is one.
    pub fn into_array(self) -> Option<na::DVector<f64>> {
        match self {
            EvalValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// The matrix, if the result is one.
    pub fn into_matrix(self) -> Option<nas::CsrMatrix<f64>> {
        match self {
            EvalValue::Matrix(m) => Some(m),
            _ => None,
        }
    }
}

fn expect_len(op: &'static str, lhs: usize, rhs: usize) -> Result<(), Error> {
    if lhs == rhs {
        Ok(())
    } else {
        Err(Error::Shape {
            op,
            detail: format!("operand lengths {lhs} and {rhs} disagree"),
        })
    }
}

fn nonzero(op: &'static str, v: &na::DVector<f64>) -> Result<(), Error> {
    if v.iter().any(|x| *x == 0.0) {
        Err(Error::Domain {
            op,
            detail: "division by a zero entry".into(),
        })
    } else {
        Ok(())
    }
}

fn unsupported(op: &'static str, lhs: &EvalValue, rhs: &EvalValue) -> Error {
    Error::Shape {
        op,
        detail: format!("no rule for {} {op} {}", lhs.kind(), rhs.kind()),
    }
}

fn apply_projection(mat: &nas::CsrMatrix<f64>, operand: EvalValue) -> Result<EvalValue, Error> {
    let check = |len: usize| expect_len("projection", mat.ncols(), len);
    match operand {
        EvalValue::Ad(ad) => {
            check(ad.len())?;
            Ok(EvalValue::Ad(AdArray::new(mat * &ad.val, mat * &ad.jac)))
        }
        EvalValue::Array(a) => {
            check(a.len())?;
            Ok(EvalValue::Array(mat * &a))
        }
        EvalValue::Matrix(m) => {
            check(m.nrows())?;
            Ok(EvalValue::Matrix(mat * &m))
        }
        EvalValue::Scalar(_) => Err(Error::Shape {
            op: "projection",
            detail: "cannot project a scalar".into(),
        }),
    }
}

fn apply_unary(op: UnaryOp, operand: EvalValue) -> Result<EvalValue, Error> {
    match op {
        UnaryOp::Neg => Ok(match operand {
            EvalValue::Ad(ad) => EvalValue::Ad(-&ad),
            EvalValue::Array(a) => EvalValue::Array(-a),
            EvalValue::Matrix(m) => EvalValue::Matrix(sparse::scaled(&m, -1.0)),
            EvalValue::Scalar(c) => EvalValue::Scalar(-c),
        }),
    }
}

/// The arithmetic rules over evaluated operand kinds, one exhaustive match
/// per combinator.
fn apply_binary(op: BinaryOp, lhs: EvalValue, rhs: EvalValue) -> Result<EvalValue, Error> {
    use EvalValue::{Ad, Array, Matrix, Scalar};
    match op {
        BinaryOp::Add => match (lhs, rhs) {
            (Ad(a), Ad(b)) => {
                expect_len("add", a.len(), b.len())?;
                Ok(Ad(&a + &b))
            }
            (Ad(a), Array(b)) | (Array(b), Ad(a)) => {
                expect_len("add", a.len(), b.len())?;
                Ok(Ad(&a + &b))
            }
            (Ad(a), Scalar(c)) | (Scalar(c), Ad(a)) => Ok(Ad(&a + c)),
            (Array(a), Array(b)) => {
                expect_len("add", a.len(), b.len())?;
                Ok(Array(a + b))
            }
            (Array(a), Scalar(c)) | (Scalar(c), Array(a)) => Ok(Array(a.add_scalar(c))),
            (Scalar(a), Scalar(b)) => Ok(Scalar(a + b)),
            (Matrix(a), Matrix(b)) => {
                if a.nrows() != b.nrows() || a.ncols() != b.ncols() {
                    return Err(Error::Shape {
                        op: "add",
                        detail: format!(
                            "matrix shapes {}x{} and {}x{} disagree",
                            a.nrows(),
                            a.ncols(),
                            b.nrows(),
                            b.ncols()
                        ),
                    });
                }
                Ok(Matrix(&a + &b))
            }
            (lhs, rhs) => Err(unsupported("add", &lhs, &rhs)),
        },
        BinaryOp::Sub => match (lhs, rhs) {
            (Ad(a), Ad(b)) => {
                expect_len("sub", a.len(), b.len())?;
                Ok(Ad(&a - &b))
            }
            (Ad(a), Array(b)) => {
                expect_len("sub", a.len(), b.len())?;
                Ok(Ad(&a - &b))
            }
            (Array(a), Ad(b)) => {
                expect_len("sub", a.len(), b.len())?;
                Ok(Ad(&(-&b) + &a))
            }
            (Ad(a), Scalar(c)) => Ok(Ad(&a - c)),
            (Scalar(c), Ad(a)) => Ok(Ad(c - &a)),
            (Array(a), Array(b)) => {
                expect_len("sub", a.len(), b.len())?;
                Ok(Array(a - b))
            }
            (Array(a), Scalar(c)) => Ok(Array(a.add_scalar(-c))),
            (Scalar(c), Array(a)) => Ok(Array(a.map(|v| c - v))),
            (Scalar(a), Scalar(b)) => Ok(Scalar(a - b)),
            (Matrix(a), Matrix(b)) => {
                if a.nrows() != b.nrows() || a.ncols() != b.ncols() {
                    return Err(Error::Shape {
                        op: "sub",
                        detail: format!(
                            "matrix shapes {}x{} and {}x{} disagree",
                            a.nrows(),
                            a.ncols(),
                            b.nrows(),
                            b.ncols()
                        ),
                    });
                }
                Ok(Matrix(&a - &b))
            }
            (lhs, rhs) => Err(unsupported("sub", &lhs, &rhs)),
        },
        BinaryOp::Mul => match (lhs, rhs) {
            (Ad(a), Ad(b)) => {
                expect_len("mul", a.len(), b.len())?;
                Ok(Ad(&a * &b))
            }
            (Ad(a), Array(b)) | (Array(b), Ad(a)) => {
                expect_len("mul", a.len(), b.len())?;
                Ok(Ad(&a * &b))
            }
            (Ad(a), Scalar(c)) | (Scalar(c), Ad(a)) => Ok(Ad(&a * c)),
            (Matrix(m), Ad(a)) => {
                expect_len("mul", m.ncols(), a.len())?;
                Ok(Ad(&m * &a))
            }
            (Ad(a), Matrix(m)) => {
                expect_len("mul", a.len(), m.nrows())?;
                expect_len("mul", a.jac.ncols(), m.nrows())?;
                Ok(Ad(&a * &m))
            }
            (Matrix(a), Matrix(b)) => {
                expect_len("mul", a.ncols(), b.nrows())?;
                Ok(Matrix(&a * &b))
            }
            (Matrix(m), Array(v)) => {
                expect_len("mul", m.ncols(), v.len())?;
                Ok(Array(&m * &v))
            }
            (Array(v), Matrix(m)) => {
                expect_len("mul", v.len(), m.nrows())?;
                Ok(Array(&m.transpose() * &v))
            }
            (Matrix(m), Scalar(c)) | (Scalar(c), Matrix(m)) => Ok(Matrix(sparse::scaled(&m, c))),
            (Array(a), Array(b)) => {
                expect_len("mul", a.len(), b.len())?;
                Ok(Array(a.component_mul(&b)))
            }
            (Array(a), Scalar(c)) | (Scalar(c), Array(a)) => Ok(Array(&a * c)),
            (Scalar(a), Scalar(b)) => Ok(Scalar(a * b)),
        },
        BinaryOp::Div => match (lhs, rhs) {
            (Ad(a), Ad(b)) => {
                expect_len("div", a.len(), b.len())?;
                nonzero("div", &b.val)?;
                Ok(Ad(&a / &b))
            }
            (Ad(a), Array(b)) => {
                expect_len("div", a.len(), b.len())?;
                nonzero("div", &b)?;
                Ok(Ad(&a / &b))
            }
            (Array(a), Ad(b)) => {
                expect_len("div", a.len(), b.len())?;
                nonzero("div", &b.val)?;
                let inv = b.val.map(|v| 1.0 / v);
                let val = a.component_mul(&inv);
                let scale = val.component_mul(&inv).map(|x| -x);
                Ok(Ad(AdArray::new(val, sparse::scale_rows(&b.jac, &scale))))
            }
            (Ad(a), Scalar(c)) => {
                if c == 0.0 {
                    return Err(Error::Domain {
                        op: "div",
                        detail: "division by zero".into(),
                    });
                }
                Ok(Ad(&a / c))
            }
            (Scalar(c), Ad(b)) => {
                nonzero("div", &b.val)?;
                Ok(Ad(c / &b))
            }
            (Array(a), Array(b)) => {
                expect_len("div", a.len(), b.len())?;
                nonzero("div", &b)?;
                Ok(Array(a.component_div(&b)))
            }
            (Array(a), Scalar(c)) => {
                if c == 0.0 {
                    return Err(Error::Domain {
                        op: "div",
                        detail: "division by zero".into(),
                    });
                }
                Ok(Array(a / c))
            }
            (Scalar(c), Array(b)) => {
                nonzero("div", &b)?;
                Ok(Array(b.map(|v| c / v)))
            }
            (Scalar(a), Scalar(b)) => {
                if b == 0.0 {
                    return Err(Error::Domain {
                        op: "div",
                        detail: "division by zero".into(),
                    });
                }
                Ok(Scalar(a / b))
            }
            (lhs, rhs) => Err(unsupported("div", &lhs, &rhs)),
        },
        BinaryOp::Pow => match (lhs, rhs) {
            (Ad(a), Scalar(c)) => Ok(Ad(a.powf(c)?)),
            (Ad(a), Ad(b)) => Ok(Ad(a.pow(&b)?)),
            (Scalar(c), Ad(b)) => Ok(Ad(AdArray::base_pow(c, &b)?)),
            (Array(a), Scalar(c)) => {
                if c.fract() != 0.0 && a.iter().any(|v| *v < 0.0) {
                    return Err(Error::Domain {
                        op: "pow",
                        detail: format!("non-integer exponent {c} over a negative entry"),
                    });
                }
                if (c.fract() != 0.0 || c < 0.0) && a.iter().any(|v| *v == 0.0) {
                    return Err(Error::Domain {
                        op: "pow",
                        detail: format!("exponent {c} over a zero entry"),
                    });
                }
                Ok(Array(a.map(|v| v.powf(c))))
            }
            (Scalar(a), Scalar(b)) => {
                if a < 0.0 && b.fract() != 0.0 {
                    return Err(Error::Domain {
                        op: "pow",
                        detail: format!("non-integer exponent {b} over negative base {a}"),
                    });
                }
                if a == 0.0 && b < 0.0 {
                    return Err(Error::Domain {
                        op: "pow",
                        detail: "negative exponent over zero base".into(),
                    });
                }
                Ok(Scalar(a.powf(b)))
            }
            (lhs, rhs) => Err(unsupported("pow", &lhs, &rhs)),
        },
    }
}

// Tree builders via the std ops.
// One generic impl per combinator covers pairs, merged variables, constants
// and subtrees on the right-hand side; f64 gets its own impls for the left.

impl From<Variable> for Expr {
    fn from(v: Variable) -> Expr {
        Expr::Variable(v)
    }
}

impl From<MergedVariable> for Expr {
    fn from(m: MergedVariable) -> Expr {
        Expr::Merged(m)
    }
}

impl From<f64> for Expr {
    fn from(c: f64) -> Expr {
        Expr::Scalar(c)
    }
}

impl From<na::DVector<f64>> for Expr {
    fn from(a: na::DVector<f64>) -> Expr {
        Expr::Array(a)
    }
}

impl From<nas::CsrMatrix<f64>> for Expr {
    fn from(m: nas::CsrMatrix<f64>) -> Expr {
        Expr::Matrix(m)
    }
}

macro_rules! impl_expr_ops {
    ($lhs:ty) => {
        impl<R: Into<Expr>> std::ops::Add<R> for $lhs {
            type Output = Expr;

            fn add(self, rhs: R) -> Expr {
                Expr::Binary {
                    op: BinaryOp::Add,
                    lhs: Box::new(self.into()),
                    rhs: Box::new(rhs.into()),
                }
            }
        }

        impl<R: Into<Expr>> std::ops::Sub<R> for $lhs {
            type Output = Expr;

            fn sub(self, rhs: R) -> Expr {
                Expr::Binary {
                    op: BinaryOp::Sub,
                    lhs: Box::new(self.into()),
                    rhs: Box::new(rhs.into()),
                }
            }
        }

        impl<R: Into<Expr>> std::ops::Mul<R> for $lhs {
            type Output = Expr;

            fn mul(self, rhs: R) -> Expr {
                Expr::Binary {
                    op: BinaryOp::Mul,
                    lhs: Box::new(self.into()),
                    rhs: Box::new(rhs.into()),
                }
            }
        }

        impl<R: Into<Expr>> std::ops::Div<R> for $lhs {
            type Output = Expr;

            fn div(self, rhs: R) -> Expr {
                Expr::Binary {
                    op: BinaryOp::Div,
                    lhs: Box::new(self.into()),
                    rhs: Box::new(rhs.into()),
                }
            }
        }

        impl std::ops::Neg for $lhs {
            type Output = Expr;

            fn neg(self) -> Expr {
                Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(self.into()),
                }
            }
        }
    };
}

impl_expr_ops!(Expr);
impl_expr_ops!(Variable);
impl_expr_ops!(MergedVariable);

impl std::ops::Add<Expr> for f64 {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::from(self) + rhs
    }
}

impl std::ops::Sub<Expr> for f64 {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::from(self) - rhs
    }
}

impl std::ops::Mul<Expr> for f64 {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::from(self) * rhs
    }
}

impl std::ops::Div<Expr> for f64 {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        Expr::from(self) / rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dof::DofManager;
    use crate::grid::tiny_md_grid;
    use crate::sparse::to_dense;
    use approx::assert_abs_diff_eq;

    /// The tiny model with a pressure variable on every subdomain, a mortar
    /// flux on both interfaces, and deterministic iterate/previous arrays.
    fn populated_model() -> (MixedGrid, DofManager) {
        let mut mdg = tiny_md_grid();
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        let intfs: Vec<_> = mdg.interfaces().map(|(id, _)| id).collect();
        for &sd in &sds {
            mdg.declare_variable(sd, "pressure", 1);
            let n = mdg.subdomain(sd).num_cells;
            let base = sd.0 as f64 * 10.0;
            mdg.set_iterate(
                sd,
                "pressure",
                na::DVector::from_iterator(n, (0..n).map(|i| base + i as f64 + 1.0)),
            );
            mdg.set_previous(
                sd,
                "pressure",
                na::DVector::from_iterator(n, (0..n).map(|i| -(base + i as f64 + 1.0))),
            );
        }
        for &intf in &intfs {
            mdg.declare_variable(intf, "mortar_flux", 1);
            let n = mdg.interface(intf).num_cells();
            mdg.set_iterate(
                intf,
                "mortar_flux",
                na::DVector::from_iterator(n, (0..n).map(|i| 100.0 + i as f64)),
            );
        }
        let dofs = DofManager::new(&mdg);
        (mdg, dofs)
    }

    #[test]
    fn variable_slices_the_supplied_state() {
        let (mdg, dofs) = populated_model();
        let sd1 = mdg.subdomains().nth(1).unwrap().0;
        let var = Variable::new(&dofs, sd1, "pressure").unwrap();

        let state =
            na::DVector::from_iterator(dofs.num_dofs(), (0..dofs.num_dofs()).map(|i| i as f64));
        let cx = EvalContext::new(&mdg, &dofs, Some(&state));
        let ad = Expr::from(var).evaluate(&cx).unwrap().into_ad().unwrap();

        let block = dofs.block(sd1, "pressure").unwrap();
        assert_eq!(ad.val, state.rows(block.start, block.len()).into_owned());
        assert_eq!(ad.jac.nrows(), block.len());
        assert_eq!(ad.jac.ncols(), dofs.num_dofs());
        let cols: Vec<usize> = block.collect();
        assert_eq!(
            to_dense(&ad.jac),
            to_dense(&sparse::selection(&cols, dofs.num_dofs()))
        );
    }

    #[test]
    fn variable_falls_back_to_the_stored_iterate() {
        let (mdg, dofs) = populated_model();
        let sd1 = mdg.subdomains().nth(1).unwrap().0;
        let var = Variable::new(&dofs, sd1, "pressure").unwrap();

        let cx = EvalContext::new(&mdg, &dofs, None);
        let ad = Expr::from(var).evaluate(&cx).unwrap().into_ad().unwrap();
        assert_eq!(&ad.val, mdg.iterate(sd1, "pressure").unwrap());
    }

    #[test]
    fn previous_states_are_plain_arrays() {
        let (mdg, dofs) = populated_model();
        let sd0 = mdg.subdomains().next().unwrap().0;
        let var = Variable::new(&dofs, sd0, "pressure").unwrap();
        let prev = var.previous_timestep();
        assert_eq!(prev.state(), StateRef::PreviousTimestep);

        // a state vector is supplied and must be ignored
        let state = na::DVector::from_element(dofs.num_dofs(), 7.0);
        let cx = EvalContext::new(&mdg, &dofs, Some(&state));
        match Expr::from(prev).evaluate(&cx).unwrap() {
            EvalValue::Array(arr) => {
                assert_eq!(&arr, mdg.previous(sd0, "pressure").unwrap());
            }
            other => panic!("expected a plain array, got {}", other.kind()),
        }

        // previous iterates read the stored iterate instead
        let prev_iter = var.previous_iteration();
        let arr = Expr::from(prev_iter)
            .evaluate(&cx)
            .unwrap()
            .into_array()
            .unwrap();
        assert_eq!(&arr, mdg.iterate(sd0, "pressure").unwrap());
    }

    #[test]
    fn merged_variables_concatenate_in_order() {
        let (mdg, dofs) = populated_model();
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        let merged = MergedVariable::new(
            sds.iter()
                .map(|&sd| Variable::new(&dofs, sd, "pressure").unwrap())
                .collect(),
        )
        .unwrap();
        assert_eq!(merged.size(), 8);

        let cx = EvalContext::new(&mdg, &dofs, None);
        let ad = Expr::from(merged.clone())
            .evaluate(&cx)
            .unwrap()
            .into_ad()
            .unwrap();

        let mut expected = Vec::new();
        for &sd in &sds {
            expected.extend(mdg.iterate(sd, "pressure").unwrap().iter().copied());
        }
        assert_eq!(ad.val, na::DVector::from_vec(expected));
        // the stacked selection spans the full layout no matter the span
        assert_eq!(ad.jac.ncols(), dofs.num_dofs());
        assert_eq!(ad.jac.nrows(), merged.size());

        // explicit state evaluation must agree with the fallback
        let state = dofs.assemble_iterate(&mdg).unwrap();
        let cx_state = EvalContext::new(&mdg, &dofs, Some(&state));
        let ad_state = Expr::from(merged)
            .evaluate(&cx_state)
            .unwrap()
            .into_ad()
            .unwrap();
        assert_eq!(ad.val, ad_state.val);
        assert_eq!(to_dense(&ad.jac), to_dense(&ad_state.jac));
    }

    #[test]
    fn merged_previous_timestep_is_one_array() {
        let (mdg, dofs) = populated_model();
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        let merged = MergedVariable::new(
            sds.iter()
                .map(|&sd| Variable::new(&dofs, sd, "pressure").unwrap())
                .collect(),
        )
        .unwrap();

        let cx = EvalContext::new(&mdg, &dofs, None);
        let arr = Expr::from(merged.previous_timestep())
            .evaluate(&cx)
            .unwrap()
            .into_array()
            .unwrap();
        let mut expected = Vec::new();
        for &sd in &sds {
            expected.extend(mdg.previous(sd, "pressure").unwrap().iter().copied());
        }
        assert_eq!(arr, na::DVector::from_vec(expected));
    }

    #[test]
    fn merging_different_names_fails() {
        let (mut mdg, _) = populated_model();
        let sd0 = mdg.subdomains().next().unwrap().0;
        mdg.declare_variable(sd0, "temperature", 1);
        let dofs = DofManager::new(&mdg);

        let p = Variable::new(&dofs, sd0, "pressure").unwrap();
        let t = Variable::new(&dofs, sd0, "temperature").unwrap();
        assert!(matches!(
            MergedVariable::new(vec![p, t]),
            Err(Error::NameMismatch { .. })
        ));
    }

    #[test]
    fn unregistered_variables_fail_at_binding() {
        let (mdg, dofs) = populated_model();
        let sd0 = mdg.subdomains().next().unwrap().0;
        assert!(matches!(
            Variable::new(&dofs, sd0, "temperature"),
            Err(Error::UnknownVariable { .. })
        ));
    }

    #[test]
    fn stale_layouts_are_rejected() {
        let (mut mdg, dofs) = populated_model();
        let sd0 = mdg.subdomains().next().unwrap().0;
        let var = Variable::new(&dofs, sd0, "pressure").unwrap();

        // rebuild the layout with an extra variable; the old binding is stale
        mdg.declare_variable(sd0, "temperature", 1);
        let rebuilt = DofManager::new(&mdg);
        let cx = EvalContext::new(&mdg, &rebuilt, None);
        assert!(matches!(
            Expr::from(var).evaluate(&cx),
            Err(Error::StaleLayout { .. })
        ));
    }

    #[test]
    fn discretization_assembles_block_diagonally() {
        let (mut mdg, dofs) = populated_model();
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        // per-grid diagonal matrices with recognizable entries
        for (k, &sd) in sds[..2].iter().enumerate() {
            let n = mdg.subdomain(sd).num_cells;
            let mat = sparse::diag(&na::DVector::from_element(n, (k + 1) as f64));
            mdg.set_discretization_matrix(sd, "flow", "mass", mat);
        }

        let expr = Expr::discretization("flow", "mass", sds[..2].to_vec());
        let cx = EvalContext::new(&mdg, &dofs, None);
        let mat = expr.evaluate(&cx).unwrap().into_matrix().unwrap();
        assert_eq!(mat.nrows(), 6);
        let dense = to_dense(&mat);
        for i in 0..4 {
            assert_eq!(dense[(i, i)], 1.0);
        }
        for i in 4..6 {
            assert_eq!(dense[(i, i)], 2.0);
        }

        // a missing entry is a lookup failure
        let missing = Expr::discretization("flow", "mass", sds.clone());
        assert!(matches!(
            missing.evaluate(&cx),
            Err(Error::MissingMatrix { .. })
        ));
    }

    #[test]
    fn boundary_values_concatenate() {
        let (mut mdg, dofs) = populated_model();
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        for &sd in &sds {
            let n = mdg.subdomain(sd).num_faces;
            mdg.set_boundary_values(
                sd,
                "flow",
                na::DVector::from_iterator(n, (0..n).map(|i| sd.0 as f64 * 100.0 + i as f64)),
            );
        }

        let expr = Expr::boundary("flow", sds.clone());
        let cx = EvalContext::new(&mdg, &dofs, None);
        let arr = expr.evaluate(&cx).unwrap().into_array().unwrap();
        assert_eq!(arr.len(), 18);
        assert_eq!(arr[0], 0.0);
        assert_eq!(arr[12], 100.0);
        assert_eq!(arr[15], 200.0);
    }

    #[test]
    fn arithmetic_trees_follow_the_forward_rules() {
        let (mdg, dofs) = populated_model();
        let sd1 = mdg.subdomains().nth(1).unwrap().0;
        let p = Variable::new(&dofs, sd1, "pressure").unwrap();

        let state = dofs.assemble_iterate(&mdg).unwrap();
        let cx = EvalContext::new(&mdg, &dofs, Some(&state));

        // (p * p + 2) evaluated through the tree vs. directly on the pair
        let tree = p.clone() * p.clone() + 2.0;
        let result = tree.evaluate(&cx).unwrap().into_ad().unwrap();

        let direct = Expr::from(p.clone())
            .evaluate(&cx)
            .unwrap()
            .into_ad()
            .unwrap();
        let expected = &(&direct * &direct) + 2.0;
        assert_eq!(result.val, expected.val);
        assert_eq!(to_dense(&result.jac), to_dense(&expected.jac));

        // division and powers propagate the same rules
        let quotient = (p.clone() / 2.0).powf(2.0);
        let q = quotient.evaluate(&cx).unwrap().into_ad().unwrap();
        let expected_q = (&direct / 2.0).powf(2.0).unwrap();
        assert_eq!(q.val, expected_q.val);
        assert_eq!(to_dense(&q.jac), to_dense(&expected_q.jac));

        // scalar on the left works the same as on the right
        let left = 3.0 * Expr::from(p.clone());
        let right = Expr::from(p) * 3.0;
        let lv = left.evaluate(&cx).unwrap().into_ad().unwrap();
        let rv = right.evaluate(&cx).unwrap().into_ad().unwrap();
        assert_eq!(lv.val, rv.val);
        assert_eq!(to_dense(&lv.jac), to_dense(&rv.jac));
    }

    #[test]
    fn division_by_zero_entries_is_a_domain_error() {
        let (mut mdg, _) = populated_model();
        let sd1 = mdg.subdomains().nth(1).unwrap().0;
        mdg.set_iterate(sd1, "pressure", na::DVector::from_vec(vec![1.0, 0.0]));
        let dofs = DofManager::new(&mdg);
        let p = Variable::new(&dofs, sd1, "pressure").unwrap();

        let cx = EvalContext::new(&mdg, &dofs, None);
        let tree = Expr::Scalar(1.0) / p;
        assert!(matches!(
            tree.evaluate(&cx),
            Err(Error::Domain { op: "div", .. })
        ));
    }

    #[test]
    fn mismatched_lengths_are_a_shape_error() {
        let (mdg, dofs) = populated_model();
        let sd0 = mdg.subdomains().next().unwrap().0;
        let p = Variable::new(&dofs, sd0, "pressure").unwrap();

        let cx = EvalContext::new(&mdg, &dofs, None);
        let tree = p + na::DVector::from_vec(vec![1.0, 2.0]);
        assert!(matches!(tree.evaluate(&cx), Err(Error::Shape { .. })));
    }

    #[test]
    fn projections_apply_to_pairs() {
        let (mdg, dofs) = populated_model();
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        let merged = MergedVariable::new(
            sds.iter()
                .map(|&sd| Variable::new(&dofs, sd, "pressure").unwrap())
                .collect(),
        )
        .unwrap();

        // restrict the merged pressure (8 cells) to the first fracture's block
        let restrict = sparse::selection(&[4, 5], 8);
        let tree = Expr::project(restrict, merged);
        let cx = EvalContext::new(&mdg, &dofs, None);
        let ad = tree.evaluate(&cx).unwrap().into_ad().unwrap();
        assert_eq!(&ad.val, mdg.iterate(sds[1], "pressure").unwrap());
        assert_eq!(ad.jac.ncols(), dofs.num_dofs());

        // projecting a scalar has no meaning
        let bad = Expr::project(sparse::selection(&[0], 2), Expr::Scalar(1.0));
        assert!(matches!(bad.evaluate(&cx), Err(Error::Shape { .. })));
    }

    #[test]
    fn merged_plus_prolonged_single_variable() {
        let (mdg, dofs) = populated_model();
        let sds: Vec<_> = mdg.subdomains().map(|(id, _)| id).collect();
        let merged = MergedVariable::new(
            sds.iter()
                .map(|&sd| Variable::new(&dofs, sd, "pressure").unwrap())
                .collect(),
        )
        .unwrap();
        let single = Variable::new(&dofs, sds[1], "pressure").unwrap();

        // prolong the single variable into the merged ordering before adding
        let nr = merged.size();
        let rows: Vec<usize> = (4..6).collect();
        let prolong = sparse::selection(&rows, nr).transpose();
        let tree = merged + Expr::project(prolong, single);

        let cx = EvalContext::new(&mdg, &dofs, None);
        let ad = tree.evaluate(&cx).unwrap().into_ad().unwrap();
        assert_eq!(ad.jac.ncols(), dofs.num_dofs());
        // the fracture block is doubled
        let p1 = mdg.iterate(sds[1], "pressure").unwrap();
        assert_abs_diff_eq!(ad.val[4], 2.0 * p1[0], epsilon = 1e-12);
        assert_abs_diff_eq!(ad.val[5], 2.0 * p1[1], epsilon = 1e-12);
    }

    #[test]
    fn negation_flips_values_and_jacobians() {
        let (mdg, dofs) = populated_model();
        let sd2 = mdg.subdomains().nth(2).unwrap().0;
        let p = Variable::new(&dofs, sd2, "pressure").unwrap();

        let cx = EvalContext::new(&mdg, &dofs, None);
        let direct = Expr::from(p.clone())
            .evaluate(&cx)
            .unwrap()
            .into_ad()
            .unwrap();
        let negated = (-p).evaluate(&cx).unwrap().into_ad().unwrap();
        assert_eq!(negated.val, -&direct.val);
        assert_eq!(to_dense(&negated.jac), -to_dense(&direct.jac));
    }
}
