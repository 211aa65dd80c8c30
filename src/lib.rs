//! Assembly engine for systems of equations on mixed-dimensional grids:
//! a bulk domain, lower-dimensional fracture grids, and the mortar grids
//! coupling them.
//!
//! The crate evaluates composable operator expressions ([`Expr`]) against a
//! global unknown vector laid out by a [`DofManager`], producing forward-mode
//! AD pairs ([`AdArray`]) whose sparse Jacobians are aligned with the global
//! dof layout. Geometry and discretization weights come from external
//! collaborators and enter through the per-grid stores of a [`MixedGrid`];
//! the assembled value/Jacobian pairs feed a linear solver downstream.

#![warn(missing_docs)]

pub mod error;
#[doc(inline)]
pub use error::Error;

pub(crate) mod sparse;

pub mod forward_mode;
#[doc(inline)]
pub use forward_mode::AdArray;

pub mod grid;
#[doc(inline)]
pub use grid::{GridRef, Interface, InterfaceId, MixedGrid, Subdomain, SubdomainId};

pub mod dof;
#[doc(inline)]
pub use dof::{DofBlock, DofManager};

pub mod projection;
#[doc(inline)]
pub use projection::{MortarProjections, SubdomainProjections};

pub mod operator;
#[doc(inline)]
pub use operator::{
    BinaryOp, Discretization, EvalContext, EvalValue, Expr, MergedVariable, StateRef, UnaryOp,
    Variable,
};

pub mod equation;
#[doc(inline)]
pub use equation::EquationManager;

// nalgebra re-exports for convenience

pub use nalgebra as na;
pub use nalgebra_sparse as nas;
