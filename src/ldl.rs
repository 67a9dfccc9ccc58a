//! Sparse LDLᵀ factorization of symmetric positive definite matrices.
//!
//! Up-looking factorization in two phases: [`LdlSymbolic`] runs once per
//! sparsity pattern (elimination tree and column counts), the numeric
//! phase refactorizes in place any number of times and is generic over
//! [`Scalar`], so the identical code path that evaluates the Laplace
//! objective with `f64` also records it onto a tape.
//!
//! The input is the lower triangle of the matrix as (row, col, value)
//! triples with `row >= col`, sorted ascending by (col, row) — the
//! layout every sparse Hessian extractor in this crate produces.

use crate::error::MixedError;
use crate::scalar::Scalar;

const EMPTY: usize = usize::MAX;

/// Pattern-level analysis, reused across numeric refactorizations.
pub struct LdlSymbolic {
    n: usize,
    /// Upper-CSC view of the lower-triangle triples: column k holds the
    /// rows i <= k.
    a_colptr: Vec<usize>,
    a_rowidx: Vec<usize>,
    /// Position in the caller's triple order for each CSC slot.
    a_valperm: Vec<usize>,
    parent: Vec<isize>,
    l_colptr: Vec<usize>,
}

impl LdlSymbolic {
    /// Analyze the pattern of an `n` x `n` matrix given as lower-triangle
    /// (row, col) pairs sorted ascending by (col, row).
    pub fn new(n: usize, rows: &[usize], cols: &[usize]) -> Self {
        assert_eq!(rows.len(), cols.len());
        let nnz = rows.len();
        debug_assert!(rows.iter().zip(cols).all(|(&r, &c)| r >= c && r < n));

        // regroup by row: upper CSC column = triple row
        let mut a_colptr = vec![0usize; n + 1];
        for &r in rows {
            a_colptr[r + 1] += 1;
        }
        for k in 0..n {
            a_colptr[k + 1] += a_colptr[k];
        }
        let mut next = a_colptr.clone();
        let mut a_rowidx = vec![0usize; nnz];
        let mut a_valperm = vec![0usize; nnz];
        for (t, (&r, &c)) in rows.iter().zip(cols).enumerate() {
            let p = next[r];
            next[r] += 1;
            a_rowidx[p] = c;
            a_valperm[p] = t;
        }

        // elimination tree and column counts
        let mut parent = vec![-1isize; n];
        let mut lnz = vec![0usize; n];
        let mut flag = vec![EMPTY; n];
        for k in 0..n {
            flag[k] = k;
            for p in a_colptr[k]..a_colptr[k + 1] {
                let mut i = a_rowidx[p];
                while i < k && flag[i] != k {
                    if parent[i] == -1 {
                        parent[i] = k as isize;
                    }
                    lnz[i] += 1;
                    flag[i] = k;
                    i = parent[i] as usize;
                }
            }
        }
        let mut l_colptr = vec![0usize; n + 1];
        for k in 0..n {
            l_colptr[k + 1] = l_colptr[k] + lnz[k];
        }

        LdlSymbolic {
            n,
            a_colptr,
            a_rowidx,
            a_valperm,
            parent,
            l_colptr,
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Nonzeros in the strictly-lower factor L.
    pub fn l_nnz(&self) -> usize {
        self.l_colptr[self.n]
    }
}

/// Numeric factor plus its workspaces. Refactorized in place; the
/// engine keeps one of these per pattern behind a `RefCell` and treats
/// it as a single-writer resource.
pub struct LdlFactor<T> {
    l_rowidx: Vec<usize>,
    l_val: Vec<T>,
    d: Vec<T>,
    // workspaces for the up-looking sweep
    y: Vec<T>,
    pattern: Vec<usize>,
    stack: Vec<usize>,
    flag: Vec<usize>,
    lnz: Vec<usize>,
}

impl<T: Scalar> LdlFactor<T> {
    pub fn new(sym: &LdlSymbolic) -> Self {
        let n = sym.n;
        LdlFactor {
            l_rowidx: vec![0; sym.l_nnz()],
            l_val: vec![T::zero(); sym.l_nnz()],
            d: vec![T::zero(); n],
            y: vec![T::zero(); n],
            pattern: vec![0; n],
            stack: vec![0; n],
            flag: vec![EMPTY; n],
            lnz: vec![0; n],
        }
    }

    /// Factorize from triple values aligned with the pattern the
    /// symbolic analysis was built from. Fails on the first non-positive
    /// pivot; the factor contents are then unspecified and the next
    /// successful call fully overwrites them.
    pub fn factorize(&mut self, sym: &LdlSymbolic, vals: &[T]) -> Result<(), MixedError> {
        let n = sym.n;
        self.flag.iter_mut().for_each(|f| *f = EMPTY);
        self.lnz.iter_mut().for_each(|z| *z = 0);
        self.y.iter_mut().for_each(|v| *v = T::zero());

        for k in 0..n {
            let mut top = n;
            self.flag[k] = k;
            for p in sym.a_colptr[k]..sym.a_colptr[k + 1] {
                let mut i = sym.a_rowidx[p];
                self.y[i] += vals[sym.a_valperm[p]];
                let mut len = 0;
                while self.flag[i] != k {
                    self.stack[len] = i;
                    len += 1;
                    self.flag[i] = k;
                    i = sym.parent[i] as usize;
                }
                while len > 0 {
                    len -= 1;
                    top -= 1;
                    self.pattern[top] = self.stack[len];
                }
            }
            let mut dk = self.y[k];
            self.y[k] = T::zero();
            for t in top..n {
                let i = self.pattern[t];
                let yi = self.y[i];
                self.y[i] = T::zero();
                let p2 = sym.l_colptr[i] + self.lnz[i];
                for p in sym.l_colptr[i]..p2 {
                    self.y[self.l_rowidx[p]] -= self.l_val[p] * yi;
                }
                let l_ki = yi / self.d[i];
                dk -= l_ki * yi;
                self.l_rowidx[p2] = k;
                self.l_val[p2] = l_ki;
                self.lnz[i] += 1;
            }
            if dk.value() <= 0.0 || !dk.value().is_finite() {
                return Err(MixedError::NotPositiveDefinite {
                    pivot: dk.value(),
                    column: k,
                });
            }
            self.d[k] = dk;
        }
        Ok(())
    }

    /// log det(A) = sum of log pivots.
    pub fn logdet(&self) -> T {
        let mut acc = T::zero();
        for &di in &self.d {
            acc += di.ln();
        }
        acc
    }

    /// Solve A x = b in place.
    pub fn solve(&self, sym: &LdlSymbolic, b: &mut [T]) {
        let n = sym.n;
        assert_eq!(b.len(), n);
        for j in 0..n {
            let bj = b[j];
            for p in sym.l_colptr[j]..sym.l_colptr[j + 1] {
                b[self.l_rowidx[p]] -= self.l_val[p] * bj;
            }
        }
        for j in 0..n {
            b[j] = b[j] / self.d[j];
        }
        for j in (0..n).rev() {
            let mut bj = b[j];
            for p in sym.l_colptr[j]..sym.l_colptr[j + 1] {
                bj -= self.l_val[p] * b[self.l_rowidx[p]];
            }
            b[j] = bj;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::Dual;
    use approx::assert_relative_eq;

    // lower triangle of [[4,1,0],[1,4,1],[0,1,4]], sorted by (col,row)
    fn tri() -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        (
            vec![0, 1, 1, 2, 2],
            vec![0, 0, 1, 1, 2],
            vec![4.0, 1.0, 4.0, 1.0, 4.0],
        )
    }

    #[test]
    fn factorize_solve_roundtrip() {
        let (rows, cols, vals) = tri();
        let sym = LdlSymbolic::new(3, &rows, &cols);
        let mut f = LdlFactor::new(&sym);
        f.factorize(&sym, &vals).unwrap();

        let mut x = [1.0_f64, 2.0, 3.0];
        f.solve(&sym, &mut x);
        // check A x = b
        let ax = [
            4.0 * x[0] + x[1],
            x[0] + 4.0 * x[1] + x[2],
            x[1] + 4.0 * x[2],
        ];
        for (a, b) in ax.iter().zip([1.0, 2.0, 3.0]) {
            assert_relative_eq!(*a, b, max_relative = 1e-12);
        }
    }

    #[test]
    fn logdet_matches_determinant() {
        let (rows, cols, vals) = tri();
        let sym = LdlSymbolic::new(3, &rows, &cols);
        let mut f = LdlFactor::new(&sym);
        f.factorize(&sym, &vals).unwrap();
        // det = 56 by cofactor expansion
        assert_relative_eq!(f.logdet(), 56.0_f64.ln(), max_relative = 1e-12);
    }

    #[test]
    fn refactorization_reuses_buffers() {
        let (rows, cols, vals) = tri();
        let sym = LdlSymbolic::new(3, &rows, &cols);
        let mut f = LdlFactor::new(&sym);
        f.factorize(&sym, &vals).unwrap();
        let scaled: Vec<f64> = vals.iter().map(|v| v * 2.0).collect();
        f.factorize(&sym, &scaled).unwrap();
        // det(2A) = 8 det(A)
        assert_relative_eq!(f.logdet(), (8.0 * 56.0_f64).ln(), max_relative = 1e-12);
    }

    #[test]
    fn indefinite_matrix_is_rejected() {
        // [[1,2],[2,1]] has a negative second pivot
        let rows = vec![0, 1, 1];
        let cols = vec![0, 0, 1];
        let vals = vec![1.0, 2.0, 1.0];
        let sym = LdlSymbolic::new(2, &rows, &cols);
        let mut f = LdlFactor::new(&sym);
        let err = f.factorize(&sym, &vals).unwrap_err();
        match err {
            MixedError::NotPositiveDefinite { column, .. } => assert_eq!(column, 1),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn dual_values_differentiate_logdet() {
        // d logdet / d a00 = (A^-1)_00; for diag(2, 3) that is 1/2
        let rows = vec![0, 1];
        let cols = vec![0, 1];
        let vals = vec![Dual::new(2.0, 1.0), Dual::new(3.0, 0.0)];
        let sym = LdlSymbolic::new(2, &rows, &cols);
        let mut f = LdlFactor::new(&sym);
        f.factorize(&sym, &vals).unwrap();
        let ld = f.logdet();
        assert_relative_eq!(ld.re, 6.0_f64.ln(), max_relative = 1e-12);
        assert_relative_eq!(ld.eps, 0.5, max_relative = 1e-12);
    }
}
