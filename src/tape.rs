//! Bytecode tape for reverse-mode differentiation.
//!
//! A [`Recorder`] captures one computation over [`Ad`] scalars into an
//! immutable [`Tape`]: a flat list of opcodes, argument indices and
//! recorded point values. Replay ([`Tape::forward`]) and the adjoint
//! sweep ([`Tape::reverse`]) are generic over [`Scalar`], so the same
//! tape can be
//!
//! - evaluated at a new point with `f64`,
//! - differentiated in a direction with `Dual<f64>` (forward-over-reverse
//!   gives exact Hessian columns),
//! - replayed with `Ad` inside another recording, which is how the
//!   gradient and Hessian tapes of the engine are produced from the
//!   density tape.
//!
//! Recording state lives entirely in the `Recorder` a tracked `Ad` points
//! at; there is no global or thread-local active tape.

use std::cell::RefCell;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

use crate::scalar::Scalar;

/// Sentinel for an absent second argument.
pub(crate) const UNUSED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Input,
    Const,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Ln,
    Exp,
    Sqrt,
    Abs,
    /// sign(x) with sign(0) = 0; derivative is zero everywhere it exists.
    Sign,
}

impl Op {
    fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
            Op::Neg => -a,
            Op::Ln => a.ln(),
            Op::Exp => a.exp(),
            Op::Sqrt => a.sqrt(),
            Op::Abs => a.abs(),
            Op::Sign => Scalar::sign(a),
            Op::Input | Op::Const => unreachable!("leaf nodes are not evaluated"),
        }
    }
}

struct TapeData {
    ops: Vec<Op>,
    args: Vec<[u32; 2]>,
    values: Vec<f64>,
    n_inputs: usize,
}

/// Builder for one recording. Create it, declare the inputs, run the
/// computation over the returned [`Ad`] values, then call
/// [`Recorder::finish`].
pub struct Recorder {
    data: RefCell<TapeData>,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            data: RefCell::new(TapeData {
                ops: Vec::new(),
                args: Vec::new(),
                values: Vec::new(),
                n_inputs: 0,
            }),
        }
    }

    /// Declare the independent variables, at the point `values`. Must be
    /// called exactly once, before any arithmetic on the returned `Ad`s.
    pub fn inputs(&self, values: &[f64]) -> Vec<Ad<'_>> {
        let mut data = self.data.borrow_mut();
        assert!(
            data.ops.is_empty(),
            "inputs must be declared before any recorded operation"
        );
        data.n_inputs = values.len();
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                data.ops.push(Op::Input);
                data.args.push([UNUSED, UNUSED]);
                data.values.push(v);
                Ad {
                    value: v,
                    node: i as u32,
                    rec: Some(self),
                }
            })
            .collect()
    }

    fn push_const(&self, v: f64) -> u32 {
        let mut data = self.data.borrow_mut();
        let idx = data.ops.len() as u32;
        data.ops.push(Op::Const);
        data.args.push([UNUSED, UNUSED]);
        data.values.push(v);
        idx
    }

    fn push_op(&self, op: Op, a: u32, b: u32, value: f64) -> u32 {
        let mut data = self.data.borrow_mut();
        let idx = data.ops.len() as u32;
        data.ops.push(op);
        data.args.push([a, b]);
        data.values.push(value);
        idx
    }

    /// Seal the recording with the given dependent variables. The
    /// recorder is drained; `Ad` values created from it must not be used
    /// afterwards.
    pub fn finish(&self, outputs: &[Ad<'_>]) -> Tape {
        let mut data = self.data.borrow_mut();
        let out_nodes = outputs
            .iter()
            .map(|o| match o.node {
                UNUSED => {
                    // constant output: materialize a node for it
                    let idx = data.ops.len() as u32;
                    data.ops.push(Op::Const);
                    data.args.push([UNUSED, UNUSED]);
                    data.values.push(o.value);
                    idx
                }
                n => n,
            })
            .collect();
        Tape {
            ops: std::mem::take(&mut data.ops),
            args: std::mem::take(&mut data.args),
            values: std::mem::take(&mut data.values),
            n_inputs: data.n_inputs,
            outputs: out_nodes,
        }
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Recording scalar. Either a plain constant or a tracked node on the
/// recorder it borrows. `Copy`, so generic numeric code reads the same
/// as it does over `f64`.
#[derive(Clone, Copy)]
pub struct Ad<'r> {
    value: f64,
    node: u32,
    rec: Option<&'r Recorder>,
}

impl std::fmt::Debug for Ad<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.node == UNUSED {
            write!(f, "Ad({:?})", self.value)
        } else {
            write!(f, "Ad({:?} @ {})", self.value, self.node)
        }
    }
}

impl<'r> Ad<'r> {
    pub fn constant(value: f64) -> Self {
        Ad {
            value,
            node: UNUSED,
            rec: None,
        }
    }

    fn node_on(&self, rec: &'r Recorder) -> u32 {
        match self.node {
            UNUSED => rec.push_const(self.value),
            n => n,
        }
    }

    fn binary(self, rhs: Self, op: Op) -> Self {
        let value = op.eval(self.value, rhs.value);
        let rec = self.rec.or(rhs.rec);
        match rec {
            // constant folding
            None => Ad::constant(value),
            Some(rec) => {
                let a = self.node_on(rec);
                let b = rhs.node_on(rec);
                Ad {
                    value,
                    node: rec.push_op(op, a, b, value),
                    rec: Some(rec),
                }
            }
        }
    }

    fn unary(self, op: Op) -> Self {
        let value = op.eval(self.value, 0.0);
        match self.rec {
            None => Ad::constant(value),
            Some(rec) => Ad {
                value,
                node: rec.push_op(op, self.node, UNUSED, value),
                rec: Some(rec),
            },
        }
    }
}

impl<'r> Add for Ad<'r> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        self.binary(rhs, Op::Add)
    }
}

impl<'r> Sub for Ad<'r> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self.binary(rhs, Op::Sub)
    }
}

impl<'r> Mul for Ad<'r> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        self.binary(rhs, Op::Mul)
    }
}

impl<'r> Div for Ad<'r> {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        self.binary(rhs, Op::Div)
    }
}

impl<'r> Neg for Ad<'r> {
    type Output = Self;
    fn neg(self) -> Self {
        self.unary(Op::Neg)
    }
}

impl<'r> AddAssign for Ad<'r> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<'r> SubAssign for Ad<'r> {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<'r> MulAssign for Ad<'r> {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<'r> Scalar for Ad<'r> {
    fn from_f64(c: f64) -> Self {
        Ad::constant(c)
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn is_zero(&self) -> bool {
        self.node == UNUSED && self.value == 0.0
    }

    fn ln(self) -> Self {
        self.unary(Op::Ln)
    }

    fn exp(self) -> Self {
        self.unary(Op::Exp)
    }

    fn sqrt(self) -> Self {
        self.unary(Op::Sqrt)
    }

    fn abs(self) -> Self {
        self.unary(Op::Abs)
    }

    fn sign(self) -> Self {
        self.unary(Op::Sign)
    }
}

/// Sealed recording of one computation.
#[derive(Debug, Clone)]
pub struct Tape {
    ops: Vec<Op>,
    args: Vec<[u32; 2]>,
    /// Node values at the recording point. Constants keep their value,
    /// everything else is overwritten on replay.
    values: Vec<f64>,
    n_inputs: usize,
    outputs: Vec<u32>,
}

impl Tape {
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Number of nodes, a proxy for tape size in reports and logs.
    pub fn n_nodes(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub(crate) fn args(&self) -> &[[u32; 2]] {
        &self.args
    }

    pub(crate) fn output_nodes(&self) -> &[u32] {
        &self.outputs
    }

    /// Forward replay producing every node value. The node buffer is
    /// what [`Tape::reverse`] consumes.
    pub fn forward_nodes<T: Scalar>(&self, x: &[T]) -> Vec<T> {
        assert_eq!(x.len(), self.n_inputs, "wrong number of tape inputs");
        let mut nodes: Vec<T> = Vec::with_capacity(self.ops.len());
        for (i, &op) in self.ops.iter().enumerate() {
            let v = match op {
                Op::Input => x[i],
                Op::Const => T::from_f64(self.values[i]),
                Op::Add => nodes[self.args[i][0] as usize] + nodes[self.args[i][1] as usize],
                Op::Sub => nodes[self.args[i][0] as usize] - nodes[self.args[i][1] as usize],
                Op::Mul => nodes[self.args[i][0] as usize] * nodes[self.args[i][1] as usize],
                Op::Div => nodes[self.args[i][0] as usize] / nodes[self.args[i][1] as usize],
                Op::Neg => -nodes[self.args[i][0] as usize],
                Op::Ln => nodes[self.args[i][0] as usize].ln(),
                Op::Exp => nodes[self.args[i][0] as usize].exp(),
                Op::Sqrt => nodes[self.args[i][0] as usize].sqrt(),
                Op::Abs => nodes[self.args[i][0] as usize].abs(),
                Op::Sign => nodes[self.args[i][0] as usize].sign(),
            };
            nodes.push(v);
        }
        nodes
    }

    /// Forward replay returning the dependent values only.
    pub fn forward<T: Scalar>(&self, x: &[T]) -> Vec<T> {
        let nodes = self.forward_nodes(x);
        self.outputs.iter().map(|&o| nodes[o as usize]).collect()
    }

    /// Adjoint sweep over a node buffer from [`Tape::forward_nodes`].
    /// `weights` seeds the dependent adjoints; the return value is the
    /// weighted gradient with respect to the inputs.
    pub fn reverse<T: Scalar>(&self, nodes: &[T], weights: &[T]) -> Vec<T> {
        assert_eq!(weights.len(), self.outputs.len(), "wrong number of weights");
        let mut adj: Vec<T> = vec![T::zero(); self.ops.len()];
        for (&o, &w) in self.outputs.iter().zip(weights) {
            adj[o as usize] += w;
        }
        for i in (0..self.ops.len()).rev() {
            let op = self.ops[i];
            if matches!(op, Op::Input | Op::Const) {
                continue;
            }
            let bar = adj[i];
            if bar.is_zero() {
                continue;
            }
            let [ai, bi] = self.args[i];
            let a = ai as usize;
            match op {
                Op::Add => {
                    adj[a] += bar;
                    adj[bi as usize] += bar;
                }
                Op::Sub => {
                    adj[a] += bar;
                    adj[bi as usize] -= bar;
                }
                Op::Mul => {
                    adj[a] += bar * nodes[bi as usize];
                    adj[bi as usize] += bar * nodes[a];
                }
                Op::Div => {
                    let inv_b = T::one() / nodes[bi as usize];
                    adj[a] += bar * inv_b;
                    adj[bi as usize] -= bar * nodes[i] * inv_b;
                }
                Op::Neg => adj[a] -= bar,
                Op::Ln => adj[a] += bar / nodes[a],
                Op::Exp => adj[a] += bar * nodes[i],
                Op::Sqrt => {
                    let two_r = nodes[i] + nodes[i];
                    adj[a] += bar / two_r;
                }
                Op::Abs => adj[a] += bar * nodes[a].sign(),
                // derivative is identically zero
                Op::Sign => {}
                Op::Input | Op::Const => unreachable!(),
            }
        }
        adj.truncate(self.n_inputs);
        adj
    }

    /// Weighted gradient at `x`: one forward replay plus one adjoint
    /// sweep.
    pub fn gradient<T: Scalar>(&self, x: &[T], weights: &[T]) -> Vec<T> {
        let nodes = self.forward_nodes(x);
        self.reverse(&nodes, weights)
    }

    /// Dead-code elimination. Drops every node no dependent variable
    /// reaches; inputs are always kept, in place, so replay semantics
    /// are unchanged.
    pub fn optimize(&mut self) {
        let n = self.ops.len();
        let mut live = vec![false; n];
        for &o in &self.outputs {
            live[o as usize] = true;
        }
        for i in (0..n).rev() {
            if !live[i] || matches!(self.ops[i], Op::Input | Op::Const) {
                continue;
            }
            let [a, b] = self.args[i];
            live[a as usize] = true;
            if b != UNUSED {
                live[b as usize] = true;
            }
        }
        for i in 0..self.n_inputs {
            live[i] = true;
        }

        let mut remap = vec![UNUSED; n];
        let mut ops = Vec::with_capacity(n);
        let mut args = Vec::with_capacity(n);
        let mut values = Vec::with_capacity(n);
        for i in 0..n {
            if !live[i] {
                continue;
            }
            remap[i] = ops.len() as u32;
            ops.push(self.ops[i]);
            let [a, b] = self.args[i];
            let a = if a == UNUSED { UNUSED } else { remap[a as usize] };
            let b = if b == UNUSED { UNUSED } else { remap[b as usize] };
            args.push([a, b]);
            values.push(self.values[i]);
        }
        for o in &mut self.outputs {
            *o = remap[*o as usize];
        }
        self.ops = ops;
        self.args = args;
        self.values = values;
    }
}
