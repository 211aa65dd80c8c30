//! Errors raised while building or evaluating operator expressions.

use crate::grid::GridRef;

/// The crate-wide error type.
///
/// Every variant signals a modeling or bookkeeping mistake upstream: a
/// reference to something never registered, incompatible shapes, a value
/// outside an operation's domain, or an expression evaluated against a dof
/// layout other than the one it was built for. All are raised synchronously
/// at the point of evaluation and none are transient.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A variable was referenced on a grid where it was never declared.
    #[error("variable `{name}` is not registered on {grid}")]
    UnknownVariable {
        /// The grid or interface the lookup targeted.
        grid: GridRef,
        /// The variable name.
        name: String,
    },

    /// A grid outside the set a projection was built for.
    #[error("{grid} is not part of this projection's grid set")]
    UnknownGrid {
        /// The offending grid or interface.
        grid: GridRef,
    },

    /// A discretization matrix was referenced but never stored.
    #[error("no discretization matrix `{keyword}.{matrix}` stored on {grid}")]
    MissingMatrix {
        /// The subdomain the lookup targeted.
        grid: GridRef,
        /// The discretization keyword.
        keyword: String,
        /// The matrix name within the keyword's store.
        matrix: String,
    },

    /// A state array was referenced but never stored.
    #[error("no stored {which} values for `{name}` on {grid}")]
    MissingState {
        /// The grid or interface the lookup targeted.
        grid: GridRef,
        /// The variable name (or parameter keyword).
        name: String,
        /// Which store was consulted.
        which: &'static str,
    },

    /// Dimensions disagree in an arithmetic or projection combination.
    #[error("shape mismatch in `{op}`: {detail}")]
    Shape {
        /// The operation that failed.
        op: &'static str,
        /// What disagreed.
        detail: String,
    },

    /// A value outside the domain of the operation (zero division, invalid power).
    #[error("domain error in `{op}`: {detail}")]
    Domain {
        /// The operation that failed.
        op: &'static str,
        /// What was out of domain.
        detail: String,
    },

    /// An expression was evaluated against a dof layout other than the one it
    /// was built for. Rebuilding the layout invalidates all earlier trees.
    #[error("expression was built against dof layout revision {built}, evaluated against revision {found}")]
    StaleLayout {
        /// Revision the expression's variables were bound to.
        built: u64,
        /// Revision of the layout supplied at evaluation.
        found: u64,
    },

    /// Variables with different names cannot be merged.
    #[error("cannot merge variable `{second}` with `{first}`; merged variables share one name")]
    NameMismatch {
        /// Name of the first constituent.
        first: String,
        /// The disagreeing name.
        second: String,
    },
}
