//! Sparse derivative extraction from tapes.
//!
//! An extractor is built once per tape and block (the pattern and its
//! coloring are the "work" that must survive across evaluations), then
//! evaluated any number of times, at any point, with any [`Scalar`] —
//! including recording scalars, which is how the Hessian tapes of the
//! engine are produced.
//!
//! Hessian entries come from colored forward-over-reverse sweeps: one
//! tangent direction per color, every column of that color seeded at
//! once, entries read off the tangent part of the input adjoints.

use crate::error::MixedError;
use crate::scalar::{Dual, Scalar};
use crate::sparsity::{
    greedy_coloring, hessian_structure, jacobian_structure, symmetric_closure,
};
use crate::tape::Tape;

/// Weighted sparse Hessian of one tape, restricted to a block of the
/// input space.
pub struct HessianExtractor {
    /// Block-local pattern, sorted ascending by (col, row).
    rows: Vec<usize>,
    cols: Vec<usize>,
    colors: Vec<u32>,
    n_colors: u32,
    row_range: std::ops::Range<usize>,
    col_range: std::ops::Range<usize>,
}

impl HessianExtractor {
    /// Lower-triangle extractor for the symmetric `range` x `range`
    /// block of the Hessian of `weights . outputs`.
    pub fn new_symmetric(tape: &Tape, range: std::ops::Range<usize>) -> Self {
        let structure = hessian_structure(tape);
        let entries = structure.lower_block(range.clone());
        let n = range.len();
        let (colors, n_colors) = greedy_coloring(n, n, &symmetric_closure(&entries));
        let (rows, cols) = entries.into_iter().unzip();
        HessianExtractor {
            rows,
            cols,
            colors,
            n_colors,
            row_range: range.clone(),
            col_range: range,
        }
    }

    /// Rectangular extractor for the `rows` x `cols` off-diagonal block.
    pub fn new_rect(
        tape: &Tape,
        row_range: std::ops::Range<usize>,
        col_range: std::ops::Range<usize>,
    ) -> Self {
        let structure = hessian_structure(tape);
        let entries = structure.rect_block(row_range.clone(), col_range.clone());
        let (colors, n_colors) =
            greedy_coloring(row_range.len(), col_range.len(), &entries);
        let (rows, cols) = entries.into_iter().unzip();
        HessianExtractor {
            rows,
            cols,
            colors,
            n_colors,
            row_range,
            col_range,
        }
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    pub fn n_colors(&self) -> u32 {
        self.n_colors
    }

    /// Evaluate the block entries at `x`, aligned 1:1 with
    /// [`rows`](Self::rows)/[`cols`](Self::cols). `weights` has one
    /// entry per tape output.
    pub fn eval<T: Scalar>(&self, tape: &Tape, x: &[T], weights: &[T]) -> Vec<T> {
        let n_in = tape.n_inputs();
        assert_eq!(x.len(), n_in, "wrong point length for hessian extraction");
        let dual_weights: Vec<Dual<T>> =
            weights.iter().map(|&w| Dual::constant(w)).collect();

        let mut vals = vec![T::zero(); self.rows.len()];
        for color in 0..self.n_colors {
            let seeded: Vec<Dual<T>> = (0..n_in)
                .map(|i| {
                    let in_block = self.col_range.contains(&i);
                    let eps = if in_block
                        && self.colors[i - self.col_range.start] == color
                    {
                        T::one()
                    } else {
                        T::zero()
                    };
                    Dual::new(x[i], eps)
                })
                .collect();
            let nodes = tape.forward_nodes(&seeded);
            let adj = tape.reverse(&nodes, &dual_weights);
            for (k, (&r, &c)) in self.rows.iter().zip(&self.cols).enumerate() {
                if self.colors[c] == color {
                    vals[k] = adj[self.row_range.start + r].eps;
                }
            }
        }
        vals
    }
}

/// Sparse Jacobian of one tape over all of its inputs, one reverse
/// sweep per structurally nonzero dependent row.
pub struct JacobianExtractor {
    rows: Vec<usize>,
    cols: Vec<usize>,
    /// Dependent rows that own at least one entry.
    live_rows: Vec<usize>,
}

impl JacobianExtractor {
    pub fn new(tape: &Tape) -> Self {
        let entries = jacobian_structure(tape);
        let mut live_rows: Vec<usize> = entries.iter().map(|&(r, _)| r).collect();
        live_rows.sort_unstable();
        live_rows.dedup();
        let (rows, cols) = entries.into_iter().unzip();
        JacobianExtractor {
            rows,
            cols,
            live_rows,
        }
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    pub fn eval<T: Scalar>(&self, tape: &Tape, x: &[T]) -> Vec<T> {
        let nodes = tape.forward_nodes(x);
        let mut vals = vec![T::zero(); self.rows.len()];
        let mut weights = vec![T::zero(); tape.n_outputs()];
        for &row in &self.live_rows {
            weights[row] = T::one();
            let grad = tape.reverse(&nodes, &weights);
            weights[row] = T::zero();
            for (k, (&r, &c)) in self.rows.iter().zip(&self.cols).enumerate() {
                if r == row {
                    vals[k] = grad[c];
                }
            }
        }
        vals
    }
}

/// Caller-facing pattern contract shared by every sparse operation: an
/// empty row/col pair on input receives the computed pattern; a
/// non-empty pair must match it exactly.
pub fn check_or_fill_pattern(
    rows_io: &mut Vec<usize>,
    cols_io: &mut Vec<usize>,
    rows: &[usize],
    cols: &[usize],
) -> Result<(), MixedError> {
    if rows_io.is_empty() && cols_io.is_empty() {
        rows_io.extend_from_slice(rows);
        cols_io.extend_from_slice(cols);
        return Ok(());
    }
    if rows_io.as_slice() == rows && cols_io.as_slice() == cols {
        Ok(())
    } else {
        Err(MixedError::PatternMismatch)
    }
}
