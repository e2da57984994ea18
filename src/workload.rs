//! The sustained computation the worker keeps alive.

/// One unit of work executed per loop iteration.
pub trait Workload: Send {
    fn run_iteration(&mut self);
}

impl<F> Workload for F
where
    F: FnMut() + Send,
{
    fn run_iteration(&mut self) {
        self()
    }
}

/// Dense N×N multiply-accumulate, `D = C + A·B`, on fixed operands.
pub struct MatrixWorkload {
    size: usize,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    d: Vec<f64>,
}

impl MatrixWorkload {
    pub fn new(size: usize) -> Self {
        let mut a = vec![0.0; size * size];
        let mut b = vec![0.0; size * size];
        for i in 0..size {
            for j in 0..size {
                a[i * size + j] = i as f64;
                b[i * size + j] = j as f64;
            }
        }
        Self {
            size,
            a,
            b,
            c: vec![0.0; size * size],
            d: vec![0.0; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Result matrix entry at `(row, col)`.
    pub fn result(&self, row: usize, col: usize) -> f64 {
        self.d[row * self.size + col]
    }
}

impl Workload for MatrixWorkload {
    fn run_iteration(&mut self) {
        let n = self.size;
        for i in 0..n {
            for j in 0..n {
                let mut acc = self.c[i * n + j];
                for k in 0..n {
                    acc += self.a[i * n + k] * self.b[k * n + j];
                }
                self.d[i * n + j] = acc;
            }
        }
        tracing::trace!(size = n, "matrix iteration done");
    }
}
