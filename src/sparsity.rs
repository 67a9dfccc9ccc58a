//! Structural sparsity of tape Jacobians and Hessians.
//!
//! Patterns are computed from the tape alone, before any numeric sweep:
//! a forward pass propagates per-node input-dependency bitsets, and every
//! nonlinear operation that is reachable from a dependent variable marks
//! the cross pairs of its argument dependencies as potential Hessian
//! entries. `Abs` is structurally linear (zero curvature where defined)
//! and `Sign` carries no derivative dependency at all, so recorded
//! gradients of |v| terms do not inflate the pattern.
//!
//! The detected pattern can only overestimate: a structural entry may
//! still evaluate to zero, but no true nonzero is ever missed.

use crate::tape::{Op, Tape, UNUSED};

const WORD: usize = 64;

fn words(n: usize) -> usize {
    n.div_ceil(WORD)
}

#[inline]
fn set_bit(bits: &mut [u64], i: usize) {
    bits[i / WORD] |= 1u64 << (i % WORD);
}

#[inline]
fn get_bit(bits: &[u64], i: usize) -> bool {
    bits[i / WORD] & (1u64 << (i % WORD)) != 0
}

fn union_into(dst: &mut [u64], src: &[u64]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d |= *s;
    }
}

fn bits_iter(bits: &[u64], n: usize) -> impl Iterator<Item = usize> + '_ {
    (0..n).filter(move |&i| get_bit(bits, i))
}

/// Full symmetric structural Hessian over the inputs of one tape,
/// for any weighting of its dependent variables.
pub struct HessStructure {
    /// Row-major n x n bit matrix, kept symmetric.
    rows: Vec<Vec<u64>>,
}

impl HessStructure {
    /// Lower-triangle entries of the square sub-block `range` x `range`,
    /// in block-local indices, sorted ascending by (col, row).
    pub fn lower_block(&self, range: std::ops::Range<usize>) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for col in range.clone() {
            for row in col..range.end {
                if get_bit(&self.rows[row], col) {
                    out.push((row - range.start, col - range.start));
                }
            }
        }
        out
    }

    /// All entries of the rectangular sub-block `rows` x `cols`, in
    /// block-local indices, sorted ascending by (col, row).
    pub fn rect_block(
        &self,
        rows: std::ops::Range<usize>,
        cols: std::ops::Range<usize>,
    ) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for col in cols.clone() {
            for row in rows.clone() {
                if get_bit(&self.rows[row], col) {
                    out.push((row - rows.start, col - cols.start));
                }
            }
        }
        out
    }
}

/// Detect the structural Hessian of a tape.
pub fn hessian_structure(tape: &Tape) -> HessStructure {
    let ops = tape.ops();
    let args = tape.args();
    let n_in = tape.n_inputs();
    let nw = words(n_in);

    // Nodes whose adjoint can be structurally nonzero. Sign blocks the
    // sweep the same way it does numerically.
    let mut active = vec![false; ops.len()];
    for &o in tape.output_nodes() {
        active[o as usize] = true;
    }
    for i in (0..ops.len()).rev() {
        if !active[i] || matches!(ops[i], Op::Input | Op::Const | Op::Sign) {
            continue;
        }
        let [a, b] = args[i];
        active[a as usize] = true;
        if b != UNUSED {
            active[b as usize] = true;
        }
    }

    // Forward dependency propagation plus cross-pair marking.
    let mut deps: Vec<Vec<u64>> = Vec::with_capacity(ops.len());
    let mut hess = HessStructure {
        rows: vec![vec![0u64; nw]; n_in],
    };

    let mut mark_cross = |da: &[u64], db: &[u64]| {
        for i in bits_iter(da, n_in) {
            union_into(&mut hess.rows[i], db);
        }
        for j in bits_iter(db, n_in) {
            union_into(&mut hess.rows[j], da);
        }
    };

    for (i, &op) in ops.iter().enumerate() {
        let mut d = vec![0u64; nw];
        match op {
            Op::Input => set_bit(&mut d, i),
            // Sign's derivative is zero: no dependency flows through it.
            Op::Const | Op::Sign => {}
            Op::Add | Op::Sub => {
                let [a, b] = args[i];
                union_into(&mut d, &deps[a as usize]);
                union_into(&mut d, &deps[b as usize]);
            }
            Op::Mul | Op::Div => {
                let [a, b] = args[i];
                union_into(&mut d, &deps[a as usize]);
                union_into(&mut d, &deps[b as usize]);
                if active[i] {
                    mark_cross(&deps[a as usize], &deps[b as usize]);
                    if op == Op::Div {
                        mark_cross(&deps[b as usize], &deps[b as usize]);
                    }
                }
            }
            Op::Neg | Op::Abs => {
                let [a, _] = args[i];
                union_into(&mut d, &deps[a as usize]);
            }
            Op::Ln | Op::Exp | Op::Sqrt => {
                let [a, _] = args[i];
                union_into(&mut d, &deps[a as usize]);
                if active[i] {
                    mark_cross(&deps[a as usize], &deps[a as usize]);
                }
            }
        }
        deps.push(d);
    }
    hess
}

/// Structural Jacobian of a tape: (dependent row, input col) entries,
/// sorted ascending by (col, row).
pub fn jacobian_structure(tape: &Tape) -> Vec<(usize, usize)> {
    let ops = tape.ops();
    let args = tape.args();
    let n_in = tape.n_inputs();
    let nw = words(n_in);

    let mut deps: Vec<Vec<u64>> = Vec::with_capacity(ops.len());
    for (i, &op) in ops.iter().enumerate() {
        let mut d = vec![0u64; nw];
        match op {
            Op::Input => set_bit(&mut d, i),
            Op::Const | Op::Sign => {}
            _ => {
                let [a, b] = args[i];
                union_into(&mut d, &deps[a as usize]);
                if b != UNUSED {
                    union_into(&mut d, &deps[b as usize]);
                }
            }
        }
        deps.push(d);
    }

    let mut out = Vec::new();
    for col in 0..n_in {
        for (row, &o) in tape.output_nodes().iter().enumerate() {
            if get_bit(&deps[o as usize], col) {
                out.push((row, col));
            }
        }
    }
    out
}

/// Greedy distance-2 coloring of the columns of a pattern.
///
/// Two columns receive distinct colors whenever they share a row, so one
/// tangent sweep per color recovers every entry uniquely. For a
/// symmetric block pass the symmetric closure of the lower triangle as
/// `entries` (see [`symmetric_closure`]).
pub fn greedy_coloring(
    n_rows: usize,
    n_cols: usize,
    entries: &[(usize, usize)],
) -> (Vec<u32>, u32) {
    let mut row_cols: Vec<Vec<usize>> = vec![Vec::new(); n_rows];
    for &(r, c) in entries {
        row_cols[r].push(c);
    }
    let mut col_rows: Vec<Vec<usize>> = vec![Vec::new(); n_cols];
    for &(r, c) in entries {
        col_rows[c].push(r);
    }

    let mut colors = vec![u32::MAX; n_cols];
    let mut forbidden = vec![u32::MAX; n_cols]; // stamped per column
    let mut n_colors = 0u32;
    for c in 0..n_cols {
        for &r in &col_rows[c] {
            for &c2 in &row_cols[r] {
                if colors[c2] != u32::MAX {
                    forbidden[colors[c2] as usize] = c as u32;
                }
            }
        }
        let mut color = 0u32;
        while (color as usize) < n_cols && forbidden[color as usize] == c as u32 {
            color += 1;
        }
        colors[c] = color;
        n_colors = n_colors.max(color + 1);
    }
    (colors, n_colors)
}

/// Mirror a lower-triangle pattern into its full symmetric closure.
pub fn symmetric_closure(entries: &[(usize, usize)]) -> Vec<(usize, usize)> {
    let mut full = Vec::with_capacity(entries.len() * 2);
    for &(r, c) in entries {
        full.push((r, c));
        if r != c {
            full.push((c, r));
        }
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::Scalar;
    use crate::tape::Recorder;

    #[test]
    fn separable_quadratic_has_diagonal_hessian() {
        // f = sum x_i^2 / 2
        let rec = Recorder::new();
        let x = rec.inputs(&[1.0, 2.0, 3.0]);
        let mut f = x[0] * x[0];
        for &xi in &x[1..] {
            f = f + xi * xi;
        }
        let tape = rec.finish(&[f]);
        let h = hessian_structure(&tape);
        let entries = h.lower_block(0..3);
        assert_eq!(entries, vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn product_couples_inputs() {
        // f = x0 * x1 + exp(x2)
        let rec = Recorder::new();
        let x = rec.inputs(&[1.0, 2.0, 0.5]);
        let f = x[0] * x[1] + x[2].exp();
        let tape = rec.finish(&[f]);
        let h = hessian_structure(&tape);
        // sorted by (col, row), row >= col
        assert_eq!(h.lower_block(0..3), vec![(1, 0), (2, 2)]);
        // restricting to the x1..x2 block drops the cross entry
        assert_eq!(h.lower_block(1..3), vec![(1, 1)]);
        // cross block rows {x1, x2} x cols {x0}
        assert_eq!(h.rect_block(1..3, 0..1), vec![(0, 0)]);
    }

    #[test]
    fn abs_is_structurally_linear() {
        // f = |x0| + x1 * x1: |x0| contributes no curvature
        let rec = Recorder::new();
        let x = rec.inputs(&[-1.0, 2.0]);
        let f = x[0].abs() + x[1] * x[1];
        let tape = rec.finish(&[f]);
        let h = hessian_structure(&tape);
        assert_eq!(h.lower_block(0..2), vec![(1, 1)]);
    }

    #[test]
    fn jacobian_pattern_tracks_each_output() {
        let rec = Recorder::new();
        let x = rec.inputs(&[1.0, 2.0]);
        let y0 = x[0] * x[1];
        let y1 = x[1] + crate::tape::Ad::constant(3.0);
        let tape = rec.finish(&[y0, y1]);
        let j = jacobian_structure(&tape);
        assert_eq!(j, vec![(0, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn coloring_separates_conflicting_columns() {
        // tridiagonal pattern on 4 columns
        let lower = vec![(0, 0), (1, 0), (1, 1), (2, 1), (2, 2), (3, 2), (3, 3)];
        let full = symmetric_closure(&lower);
        let (colors, n_colors) = greedy_coloring(4, 4, &full);
        assert!(n_colors <= 3);
        for &(r, c) in &full {
            for &(r2, c2) in &full {
                if r == r2 && c != c2 {
                    assert_ne!(colors[c], colors[c2], "columns {c} and {c2} share row {r}");
                }
            }
        }
    }
}
