//! Forward-mode AD: values paired with sparse Jacobians.

use nalgebra as na;
use nalgebra_sparse as nas;

use crate::{error::Error, sparse};

/// A value paired with its Jacobian with respect to the global unknown vector.
///
/// Arithmetic follows the forward-mode chain rule and always allocates a
/// fresh result; operands are never mutated. Cloning is deep (the value and
/// Jacobian buffers are owned), so a clone can be edited in place without
/// affecting its source.
///
/// Scalar quantities are represented as length-1 pairs, constructed with
/// [`AdArray::scalar`].
#[derive(Clone, Debug, PartialEq)]
pub struct AdArray {
    /// The value, one entry per Jacobian row.
    pub val: na::DVector<f64>,
    /// The Jacobian; columns are aligned with the global dof layout.
    pub jac: nas::CsrMatrix<f64>,
}

impl AdArray {
    /// Pair a value with its Jacobian.
    ///
    /// Panics unless the Jacobian has one row per value entry.
    pub fn new(val: na::DVector<f64>, jac: nas::CsrMatrix<f64>) -> Self {
        assert_eq!(
            val.len(),
            jac.nrows(),
            "jacobian must have one row per value entry"
        );
        Self { val, jac }
    }

    /// A single scalar with the given derivative.
    pub fn scalar(val: f64, jac: f64) -> Self {
        Self::new(
            na::DVector::from_element(1, val),
            sparse::diag(&na::DVector::from_element(1, jac)),
        )
    }

    /// A value that depends on no unknown: the Jacobian is all zeros with the
    /// given column count.
    pub fn constant(val: na::DVector<f64>, ncols: usize) -> Self {
        let nrows = val.len();
        Self {
            val,
            jac: nas::CsrMatrix::zeros(nrows, ncols),
        }
    }

    /// Number of value entries.
    pub fn len(&self) -> usize {
        self.val.len()
    }

    /// True if the value has no entries.
    pub fn is_empty(&self) -> bool {
        self.val.len() == 0
    }

    /// The Jacobian as a single matrix whose columns span the full dof layout.
    ///
    /// Blockwise contributions are merged when pairs are built (merged
    /// variables stack their selection matrices), so this returns an
    /// independent copy that callers may subtract or compare directly.
    pub fn full_jac(&self) -> nas::CsrMatrix<f64> {
        self.jac.clone()
    }

    /// Elementwise power with a constant exponent, `u^c`.
    ///
    /// The Jacobian follows `c·u^(c-1)·J`. Non-integer exponents require
    /// non-negative entries, and negative exponents reject zero entries.
    pub fn powf(&self, exp: f64) -> Result<Self, Error> {
        if exp.fract() != 0.0 && self.val.iter().any(|v| *v < 0.0) {
            return Err(Error::Domain {
                op: "powf",
                detail: format!("non-integer exponent {exp} over a negative entry"),
            });
        }
        if (exp.fract() != 0.0 || exp < 0.0) && self.val.iter().any(|v| *v == 0.0) {
            return Err(Error::Domain {
                op: "powf",
                detail: format!("exponent {exp} over a zero entry"),
            });
        }
        let val = self.val.map(|v| v.powf(exp));
        let scale = if exp == 0.0 {
            na::DVector::zeros(self.val.len())
        } else {
            self.val.map(|v| exp * v.powf(exp - 1.0))
        };
        Ok(Self {
            val,
            jac: sparse::scale_rows(&self.jac, &scale),
        })
    }

    /// Elementwise power with a variable exponent, `u^v = exp(v·ln u)`.
    ///
    /// Requires strictly positive base entries and equal lengths.
    pub fn pow(&self, exp: &AdArray) -> Result<Self, Error> {
        if self.len() != exp.len() {
            return Err(Error::Shape {
                op: "pow",
                detail: format!("base has {} entries, exponent {}", self.len(), exp.len()),
            });
        }
        if self.val.iter().any(|v| *v <= 0.0) {
            return Err(Error::Domain {
                op: "pow",
                detail: "variable exponent over a non-positive base entry".into(),
            });
        }
        let val = self.val.zip_map(&exp.val, |a, b| a.powf(b));
        let base_scale = self.val.zip_map(&exp.val, |a, b| b * a.powf(b - 1.0));
        let exp_scale = self.val.zip_map(&exp.val, |a, b| a.powf(b) * a.ln());
        Ok(Self {
            val,
            jac: &sparse::scale_rows(&self.jac, &base_scale)
                + &sparse::scale_rows(&exp.jac, &exp_scale),
        })
    }

    /// A constant base raised to a variable exponent, `c^u`.
    ///
    /// The Jacobian follows `c^u·ln(c)·J`; the base must be strictly positive.
    pub fn base_pow(base: f64, exp: &AdArray) -> Result<Self, Error> {
        if base <= 0.0 {
            return Err(Error::Domain {
                op: "base_pow",
                detail: format!("non-positive base {base} with a variable exponent"),
            });
        }
        let val = exp.val.map(|v| base.powf(v));
        let scale = val.map(|v| v * base.ln());
        Ok(Self {
            jac: sparse::scale_rows(&exp.jac, &scale),
            val,
        })
    }
}

// std trait impls for math ops.
// The core rules live in the reference impls; owned variants delegate.

// Add

impl std::ops::Add for &AdArray {
    type Output = AdArray;

    fn add(self, rhs: &AdArray) -> AdArray {
        AdArray::new(&self.val + &rhs.val, &self.jac + &rhs.jac)
    }
}

impl std::ops::Add for AdArray {
    type Output = AdArray;

    fn add(self, rhs: AdArray) -> AdArray {
        &self + &rhs
    }
}

impl std::ops::Add<f64> for &AdArray {
    type Output = AdArray;

    fn add(self, rhs: f64) -> AdArray {
        AdArray::new(self.val.add_scalar(rhs), self.jac.clone())
    }
}

impl std::ops::Add<f64> for AdArray {
    type Output = AdArray;

    fn add(self, rhs: f64) -> AdArray {
        &self + rhs
    }
}

impl std::ops::Add<&AdArray> for f64 {
    type Output = AdArray;

    fn add(self, rhs: &AdArray) -> AdArray {
        rhs + self
    }
}

impl std::ops::Add<AdArray> for f64 {
    type Output = AdArray;

    fn add(self, rhs: AdArray) -> AdArray {
        &rhs + self
    }
}

impl std::ops::Add<&na::DVector<f64>> for &AdArray {
    type Output = AdArray;

    fn add(self, rhs: &na::DVector<f64>) -> AdArray {
        AdArray::new(&self.val + rhs, self.jac.clone())
    }
}

// Sub

impl std::ops::Sub for &AdArray {
    type Output = AdArray;

    fn sub(self, rhs: &AdArray) -> AdArray {
        AdArray::new(&self.val - &rhs.val, &self.jac - &rhs.jac)
    }
}

impl std::ops::Sub for AdArray {
    type Output = AdArray;

    fn sub(self, rhs: AdArray) -> AdArray {
        &self - &rhs
    }
}

impl std::ops::Sub<f64> for &AdArray {
    type Output = AdArray;

    fn sub(self, rhs: f64) -> AdArray {
        AdArray::new(self.val.add_scalar(-rhs), self.jac.clone())
    }
}

impl std::ops::Sub<f64> for AdArray {
    type Output = AdArray;

    fn sub(self, rhs: f64) -> AdArray {
        &self - rhs
    }
}

impl std::ops::Sub<&AdArray> for f64 {
    type Output = AdArray;

    fn sub(self, rhs: &AdArray) -> AdArray {
        AdArray::new(rhs.val.map(|v| self - v), sparse::scaled(&rhs.jac, -1.0))
    }
}

impl std::ops::Sub<AdArray> for f64 {
    type Output = AdArray;

    fn sub(self, rhs: AdArray) -> AdArray {
        self - &rhs
    }
}

impl std::ops::Sub<&na::DVector<f64>> for &AdArray {
    type Output = AdArray;

    fn sub(self, rhs: &na::DVector<f64>) -> AdArray {
        AdArray::new(&self.val - rhs, self.jac.clone())
    }
}

// Neg

impl std::ops::Neg for &AdArray {
    type Output = AdArray;

    fn neg(self) -> AdArray {
        AdArray::new(-&self.val, sparse::scaled(&self.jac, -1.0))
    }
}

impl std::ops::Neg for AdArray {
    type Output = AdArray;

    fn neg(self) -> AdArray {
        -&self
    }
}

// Mul

impl std::ops::Mul for &AdArray {
    type Output = AdArray;

    /// Elementwise product rule: `diag(v)·Ju + diag(u)·Jv`.
    fn mul(self, rhs: &AdArray) -> AdArray {
        AdArray::new(
            self.val.component_mul(&rhs.val),
            &sparse::scale_rows(&self.jac, &rhs.val) + &sparse::scale_rows(&rhs.jac, &self.val),
        )
    }
}

impl std::ops::Mul for AdArray {
    type Output = AdArray;

    fn mul(self, rhs: AdArray) -> AdArray {
        &self * &rhs
    }
}

impl std::ops::Mul<f64> for &AdArray {
    type Output = AdArray;

    fn mul(self, rhs: f64) -> AdArray {
        AdArray::new(&self.val * rhs, sparse::scaled(&self.jac, rhs))
    }
}

impl std::ops::Mul<f64> for AdArray {
    type Output = AdArray;

    fn mul(self, rhs: f64) -> AdArray {
        &self * rhs
    }
}

impl std::ops::Mul<&AdArray> for f64 {
    type Output = AdArray;

    fn mul(self, rhs: &AdArray) -> AdArray {
        rhs * self
    }
}

impl std::ops::Mul<AdArray> for f64 {
    type Output = AdArray;

    fn mul(self, rhs: AdArray) -> AdArray {
        &rhs * self
    }
}

impl std::ops::Mul<&na::DVector<f64>> for &AdArray {
    type Output = AdArray;

    /// Elementwise broadcast: the Jacobian rows are scaled by the vector entries.
    fn mul(self, rhs: &na::DVector<f64>) -> AdArray {
        AdArray::new(
            self.val.component_mul(rhs),
            sparse::scale_rows(&self.jac, rhs),
        )
    }
}

impl std::ops::Mul<&AdArray> for &nas::CsrMatrix<f64> {
    type Output = AdArray;

    /// Matrix times pair: value `A·u`, Jacobian `A·J`.
    fn mul(self, rhs: &AdArray) -> AdArray {
        AdArray::new(self * &rhs.val, self * &rhs.jac)
    }
}

impl std::ops::Mul<&nas::CsrMatrix<f64>> for &AdArray {
    type Output = AdArray;

    /// Pair times matrix in row-vector convention: value `Aᵀ·u`, Jacobian `J·A`.
    fn mul(self, rhs: &nas::CsrMatrix<f64>) -> AdArray {
        AdArray::new(&rhs.transpose() * &self.val, &self.jac * rhs)
    }
}

// Div

impl std::ops::Div for &AdArray {
    type Output = AdArray;

    /// Quotient rule; entries of the denominator must be nonzero.
    fn div(self, rhs: &AdArray) -> AdArray {
        let inv = rhs.val.map(|v| 1.0 / v);
        let val = self.val.component_mul(&inv);
        let den_scale = val.component_mul(&inv).map(|x| -x);
        AdArray::new(
            val,
            &sparse::scale_rows(&self.jac, &inv) + &sparse::scale_rows(&rhs.jac, &den_scale),
        )
    }
}

impl std::ops::Div for AdArray {
    type Output = AdArray;

    fn div(self, rhs: AdArray) -> AdArray {
        &self / &rhs
    }
}

impl std::ops::Div<f64> for &AdArray {
    type Output = AdArray;

    fn div(self, rhs: f64) -> AdArray {
        self * (1.0 / rhs)
    }
}

impl std::ops::Div<f64> for AdArray {
    type Output = AdArray;

    fn div(self, rhs: f64) -> AdArray {
        &self / rhs
    }
}

impl std::ops::Div<&AdArray> for f64 {
    type Output = AdArray;

    /// Constant over pair; entries of the denominator must be nonzero.
    fn div(self, rhs: &AdArray) -> AdArray {
        let inv = rhs.val.map(|v| 1.0 / v);
        let val = &inv * self;
        let scale = val.component_mul(&inv).map(|x| -x);
        AdArray::new(val, sparse::scale_rows(&rhs.jac, &scale))
    }
}

impl std::ops::Div<AdArray> for f64 {
    type Output = AdArray;

    fn div(self, rhs: AdArray) -> AdArray {
        self / &rhs
    }
}

impl std::ops::Div<&na::DVector<f64>> for &AdArray {
    type Output = AdArray;

    fn div(self, rhs: &na::DVector<f64>) -> AdArray {
        let inv = rhs.map(|v| 1.0 / v);
        AdArray::new(
            self.val.component_mul(&inv),
            sparse::scale_rows(&self.jac, &inv),
        )
    }
}
