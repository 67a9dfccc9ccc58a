//! Removal of fixed effects whose lower and upper bounds coincide.
//!
//! Components with `lower == upper` carry no freedom; keeping them in
//! the outer optimization would put the iterate on the boundary of the
//! feasible box and break a strictly interior method. The compaction is
//! reversible: the solver sees the reduced vector, the model always sees
//! the full one.

use ndarray::Array1;

#[derive(Debug, Clone)]
pub struct BoundCompaction {
    n_full: usize,
    /// Full-space indices of the free components, ascending.
    free: Vec<usize>,
    /// Pinned value per full-space component, NaN where free.
    pinned: Vec<f64>,
}

impl BoundCompaction {
    pub fn new(lower: &[f64], upper: &[f64]) -> Self {
        assert_eq!(lower.len(), upper.len());
        let mut free = Vec::new();
        let mut pinned = vec![f64::NAN; lower.len()];
        for (i, (&lo, &up)) in lower.iter().zip(upper).enumerate() {
            if lo == up {
                pinned[i] = lo;
            } else {
                free.push(i);
            }
        }
        BoundCompaction {
            n_full: lower.len(),
            free,
            pinned,
        }
    }

    pub fn n_full(&self) -> usize {
        self.n_full
    }

    pub fn n_free(&self) -> usize {
        self.free.len()
    }

    pub fn free_indices(&self) -> &[usize] {
        &self.free
    }

    /// Full vector -> free components only.
    pub fn compress(&self, full: &[f64]) -> Array1<f64> {
        assert_eq!(full.len(), self.n_full);
        self.free.iter().map(|&i| full[i]).collect()
    }

    /// Free components -> full vector with pinned values restored.
    pub fn restore(&self, reduced: &[f64]) -> Array1<f64> {
        assert_eq!(reduced.len(), self.free.len());
        let mut full = Array1::from(self.pinned.clone());
        for (&i, &v) in self.free.iter().zip(reduced) {
            full[i] = v;
        }
        full
    }
}
