//! Tape-based reverse-mode automatic differentiation, first and second order.
//!
//! The graph is recorded once during the forward pass. [`Tape::backward`] fills the
//! adjoints of every node in a single reverse sweep. [`Tape::hessian`] replays the same
//! graph once per requested input: a forward sweep propagates the tangent seeded on that
//! input, then a reverse sweep propagates `(adjoint, adjoint tangent)` pairs, giving one
//! Hessian column per input.
//!
//! # Example
//! ```
//! use rf_ad::tape::Tape;
//!
//! let mut tape = Tape::new();
//! let x = tape.var(3.0);
//! let y = tape.var(5.0);
//! let xy = tape.mul(x, y);
//! let f = tape.mul(xy, x); // f = x^2 y
//! assert_eq!(tape.gradient(f, &[x, y]), vec![30.0, 9.0]);
//! let h = tape.hessian(f, &[x, y]);
//! assert_eq!(h, vec![vec![10.0, 6.0], vec![6.0, 0.0]]);
//! ```

/// Handle to a node on the tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(pub(crate) usize);

#[derive(Debug, Clone, Copy)]
enum Op {
    Input,
    Const,
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Neg(usize),
    Ln(usize),
    Exp(usize),
    Powf(usize, f64),
    Powi(usize, i32),
}

#[derive(Debug, Clone)]
struct Node {
    val: f64,
    op: Op,
}

/// Reverse-mode AD tape.
///
/// Record nodes with [`var`](Tape::var), [`constant`](Tape::constant) and the arithmetic
/// methods, then differentiate any recorded output.
#[derive(Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
    adjoints: Vec<f64>,
    // second-order scratch
    tangents: Vec<f64>,
    adjoint_tangents: Vec<f64>,
}

impl Tape {
    /// Create an empty tape.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tape pre-allocated for `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { nodes: Vec::with_capacity(capacity), ..Self::default() }
    }

    /// Number of nodes on the tape.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tape is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every recorded node, keeping the allocations.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.adjoints.clear();
        self.tangents.clear();
        self.adjoint_tangents.clear();
    }

    #[inline]
    fn push(&mut self, val: f64, op: Op) -> Var {
        let idx = self.nodes.len();
        self.nodes.push(Node { val, op });
        Var(idx)
    }

    /// Record an independent variable.
    #[inline]
    pub fn var(&mut self, val: f64) -> Var {
        self.push(val, Op::Input)
    }

    /// Record a constant.
    #[inline]
    pub fn constant(&mut self, val: f64) -> Var {
        self.push(val, Op::Const)
    }

    /// Primal value of a node.
    #[inline]
    pub fn val(&self, v: Var) -> f64 {
        self.nodes[v.0].val
    }

    /// `a + b`
    #[inline]
    pub fn add(&mut self, a: Var, b: Var) -> Var {
        self.push(self.val(a) + self.val(b), Op::Add(a.0, b.0))
    }

    /// `a - b`
    #[inline]
    pub fn sub(&mut self, a: Var, b: Var) -> Var {
        self.push(self.val(a) - self.val(b), Op::Sub(a.0, b.0))
    }

    /// `a * b`
    #[inline]
    pub fn mul(&mut self, a: Var, b: Var) -> Var {
        self.push(self.val(a) * self.val(b), Op::Mul(a.0, b.0))
    }

    /// `a / b`
    #[inline]
    pub fn div(&mut self, a: Var, b: Var) -> Var {
        self.push(self.val(a) / self.val(b), Op::Div(a.0, b.0))
    }

    /// `-a`
    #[inline]
    pub fn neg(&mut self, a: Var) -> Var {
        self.push(-self.val(a), Op::Neg(a.0))
    }

    /// `ln(a)`; a zero argument records `-inf` without failing.
    #[inline]
    pub fn ln(&mut self, a: Var) -> Var {
        self.push(self.val(a).ln(), Op::Ln(a.0))
    }

    /// `exp(a)`
    #[inline]
    pub fn exp(&mut self, a: Var) -> Var {
        self.push(self.val(a).exp(), Op::Exp(a.0))
    }

    /// `a^n` (float exponent)
    pub fn powf(&mut self, a: Var, n: f64) -> Var {
        self.push(self.val(a).powf(n), Op::Powf(a.0, n))
    }

    /// `a^n` (integer exponent)
    pub fn powi(&mut self, a: Var, n: i32) -> Var {
        self.push(self.val(a).powi(n), Op::Powi(a.0, n))
    }

    /// `a + s`
    #[inline]
    pub fn add_f64(&mut self, a: Var, s: f64) -> Var {
        let c = self.constant(s);
        self.add(a, c)
    }

    /// `s - a`
    #[inline]
    pub fn f64_sub(&mut self, s: f64, a: Var) -> Var {
        let c = self.constant(s);
        self.sub(c, a)
    }

    /// `a * s`
    #[inline]
    pub fn mul_f64(&mut self, a: Var, s: f64) -> Var {
        let c = self.constant(s);
        self.mul(a, c)
    }

    /// `a / s`
    #[inline]
    pub fn div_f64(&mut self, a: Var, s: f64) -> Var {
        let c = self.constant(s);
        self.div(a, c)
    }

    /// Left-to-right sum of `terms`; an empty slice records the constant 0.
    pub fn sum(&mut self, terms: &[Var]) -> Var {
        match terms.split_first() {
            None => self.constant(0.0),
            Some((&first, rest)) => rest.iter().fold(first, |acc, &t| self.add(acc, t)),
        }
    }

    /// Reverse sweep from `out`. Read the results with [`adjoint`](Tape::adjoint).
    pub fn backward(&mut self, out: Var) {
        let n = self.nodes.len();
        self.adjoints.clear();
        self.adjoints.resize(n, 0.0);
        self.adjoints[out.0] = 1.0;

        for i in (0..n).rev() {
            let g = self.adjoints[i];
            if g == 0.0 {
                continue;
            }
            match self.nodes[i].op {
                Op::Input | Op::Const => {}
                Op::Add(a, b) => {
                    self.adjoints[a] += g;
                    self.adjoints[b] += g;
                }
                Op::Sub(a, b) => {
                    self.adjoints[a] += g;
                    self.adjoints[b] -= g;
                }
                Op::Mul(a, b) => {
                    let (va, vb) = (self.nodes[a].val, self.nodes[b].val);
                    self.adjoints[a] += g * vb;
                    self.adjoints[b] += g * va;
                }
                Op::Div(a, b) => {
                    let (va, vb) = (self.nodes[a].val, self.nodes[b].val);
                    self.adjoints[a] += g / vb;
                    self.adjoints[b] -= g * va / (vb * vb);
                }
                Op::Neg(a) => self.adjoints[a] -= g,
                Op::Ln(a) => self.adjoints[a] += g / self.nodes[a].val,
                Op::Exp(a) => self.adjoints[a] += g * self.nodes[i].val,
                Op::Powf(a, p) => {
                    self.adjoints[a] += g * p * self.nodes[a].val.powf(p - 1.0);
                }
                Op::Powi(a, p) => {
                    self.adjoints[a] += g * f64::from(p) * self.nodes[a].val.powi(p - 1);
                }
            }
        }
    }

    /// `d out / d v` after [`backward`](Tape::backward) or [`hessian`](Tape::hessian).
    #[inline]
    pub fn adjoint(&self, v: Var) -> f64 {
        self.adjoints.get(v.0).copied().unwrap_or(0.0)
    }

    /// Gradient of `out` w.r.t. `inputs`, in the order given.
    pub fn gradient(&mut self, out: Var, inputs: &[Var]) -> Vec<f64> {
        self.backward(out);
        inputs.iter().map(|&x| self.adjoint(x)).collect()
    }

    /// Hessian of `out` w.r.t. `inputs`, in the order given.
    ///
    /// Each column costs one tangent sweep and one reverse sweep over the recorded graph.
    /// The adjoints are left holding the gradient of `out`. The result is symmetrized.
    pub fn hessian(&mut self, out: Var, inputs: &[Var]) -> Vec<Vec<f64>> {
        let k = inputs.len();
        let mut h = vec![vec![0.0; k]; k];
        if k == 0 {
            self.backward(out);
            return h;
        }
        for (j, &seed) in inputs.iter().enumerate() {
            self.tangent_sweep(seed);
            self.second_order_sweep(out);
            for (i, &x) in inputs.iter().enumerate() {
                h[i][j] = self.adjoint_tangents[x.0];
            }
        }
        for i in 0..k {
            for j in (i + 1)..k {
                let s = 0.5 * (h[i][j] + h[j][i]);
                h[i][j] = s;
                h[j][i] = s;
            }
        }
        h
    }

    fn tangent_sweep(&mut self, seed: Var) {
        let n = self.nodes.len();
        self.tangents.clear();
        self.tangents.resize(n, 0.0);
        for i in 0..n {
            let t = &self.tangents;
            let v = |j: usize| self.nodes[j].val;
            let ti = match self.nodes[i].op {
                Op::Input => {
                    if i == seed.0 {
                        1.0
                    } else {
                        0.0
                    }
                }
                Op::Const => 0.0,
                Op::Add(a, b) => t[a] + t[b],
                Op::Sub(a, b) => t[a] - t[b],
                Op::Mul(a, b) => t[a] * v(b) + v(a) * t[b],
                Op::Div(a, b) => (t[a] - self.nodes[i].val * t[b]) / v(b),
                Op::Neg(a) => -t[a],
                Op::Ln(a) => t[a] / v(a),
                Op::Exp(a) => self.nodes[i].val * t[a],
                Op::Powf(a, p) => p * v(a).powf(p - 1.0) * t[a],
                Op::Powi(a, p) => f64::from(p) * v(a).powi(p - 1) * t[a],
            };
            self.tangents[i] = ti;
        }
    }

    fn second_order_sweep(&mut self, out: Var) {
        let n = self.nodes.len();
        self.adjoints.clear();
        self.adjoints.resize(n, 0.0);
        self.adjoint_tangents.clear();
        self.adjoint_tangents.resize(n, 0.0);
        self.adjoints[out.0] = 1.0;

        for i in (0..n).rev() {
            let g = self.adjoints[i];
            let gd = self.adjoint_tangents[i];
            if g == 0.0 && gd == 0.0 {
                continue;
            }
            let t = |j: usize| self.tangents[j];
            let v = |j: usize| self.nodes[j].val;
            // (node, d adjoint, d adjoint tangent)
            let mut updates = [(usize::MAX, 0.0, 0.0); 2];
            match self.nodes[i].op {
                Op::Input | Op::Const => {}
                Op::Add(a, b) => {
                    updates = [(a, g, gd), (b, g, gd)];
                }
                Op::Sub(a, b) => {
                    updates = [(a, g, gd), (b, -g, -gd)];
                }
                Op::Mul(a, b) => {
                    let (va, vb, ta, tb) = (v(a), v(b), t(a), t(b));
                    updates = [(a, g * vb, gd * vb + g * tb), (b, g * va, gd * va + g * ta)];
                }
                Op::Div(a, b) => {
                    let (va, vb, ta, tb) = (v(a), v(b), t(a), t(b));
                    let vb2 = vb * vb;
                    updates = [
                        (a, g / vb, gd / vb - g * tb / vb2),
                        (
                            b,
                            -g * va / vb2,
                            -(gd * va / vb2 + g * ta / vb2 - 2.0 * g * va * tb / (vb2 * vb)),
                        ),
                    ];
                }
                Op::Neg(a) => {
                    updates[0] = (a, -g, -gd);
                }
                Op::Ln(a) => {
                    let (va, ta) = (v(a), t(a));
                    updates[0] = (a, g / va, gd / va - g * ta / (va * va));
                }
                Op::Exp(a) => {
                    let e = self.nodes[i].val;
                    updates[0] = (a, g * e, gd * e + g * e * t(a));
                }
                Op::Powf(a, p) => {
                    let va = v(a);
                    let d1 = p * va.powf(p - 1.0);
                    let d2 = p * (p - 1.0) * va.powf(p - 2.0);
                    updates[0] = (a, g * d1, gd * d1 + g * d2 * t(a));
                }
                Op::Powi(a, p) => {
                    let va = v(a);
                    let pf = f64::from(p);
                    let d1 = pf * va.powi(p - 1);
                    let d2 = pf * (pf - 1.0) * va.powi(p - 2);
                    updates[0] = (a, g * d1, gd * d1 + g * d2 * t(a));
                }
            }
            for (j, dg, dgd) in updates {
                if j != usize::MAX {
                    self.adjoints[j] += dg;
                    self.adjoint_tangents[j] += dgd;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_binary_ops_gradients() {
        let mut t = Tape::new();
        let x = t.var(6.0);
        let y = t.var(3.0);
        let s = t.add(x, y);
        let d = t.sub(x, y);
        let p = t.mul(x, y);
        let q = t.div(x, y);
        assert_eq!((t.val(s), t.val(d), t.val(p), t.val(q)), (9.0, 3.0, 18.0, 2.0));

        assert_eq!(t.gradient(s, &[x, y]), vec![1.0, 1.0]);
        assert_eq!(t.gradient(d, &[x, y]), vec![1.0, -1.0]);
        assert_eq!(t.gradient(p, &[x, y]), vec![3.0, 6.0]);
        let g = t.gradient(q, &[x, y]);
        assert_relative_eq!(g[0], 1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(g[1], -6.0 / 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unary_ops_gradients() {
        let mut t = Tape::new();
        let x = t.var(2.0);
        let n = t.neg(x);
        let l = t.ln(x);
        let e = t.exp(x);
        let pf = t.powf(x, 3.0);
        let pi = t.powi(x, 2);
        assert_eq!(t.gradient(n, &[x]), vec![-1.0]);
        assert_relative_eq!(t.gradient(l, &[x])[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(t.gradient(e, &[x])[0], 2.0_f64.exp(), epsilon = 1e-12);
        assert_relative_eq!(t.gradient(pf, &[x])[0], 12.0, epsilon = 1e-12);
        assert_relative_eq!(t.gradient(pi, &[x])[0], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_x_squared_reuses_operand() {
        let mut t = Tape::new();
        let x = t.var(3.0);
        let z = t.mul(x, x);
        assert_relative_eq!(t.gradient(z, &[x])[0], 6.0, epsilon = 1e-12);
        assert_relative_eq!(t.hessian(z, &[x])[0][0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sum_helper() {
        let mut t = Tape::new();
        let xs: Vec<Var> = (1..=4).map(|i| t.var(f64::from(i))).collect();
        let s = t.sum(&xs);
        assert_eq!(t.val(s), 10.0);
        assert_eq!(t.gradient(s, &xs), vec![1.0; 4]);
        let empty = t.sum(&[]);
        assert_eq!(t.val(empty), 0.0);
    }

    #[test]
    fn test_poisson_term_second_order() {
        // f(lam) = n ln(lam) - lam, f'' = -n / lam^2
        let n = 10.0;
        let mut t = Tape::new();
        let lam = t.var(12.0);
        let ln_lam = t.ln(lam);
        let n_ln = t.mul_f64(ln_lam, n);
        let f = t.sub(n_ln, lam);
        let h = t.hessian(f, &[lam]);
        assert_relative_eq!(h[0][0], -n / 144.0, epsilon = 1e-12);
        assert_relative_eq!(t.adjoint(lam), n / 12.0 - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_log_density_hessian() {
        // f(x, mu) = -0.5 ((x - mu) / s)^2 with s = 2: H = -1/s^2 [[1, -1], [-1, 1]]
        let mut t = Tape::new();
        let x = t.var(0.5);
        let mu = t.var(-1.0);
        let d = t.sub(x, mu);
        let z = t.div_f64(d, 2.0);
        let z2 = t.powi(z, 2);
        let f = t.mul_f64(z2, -0.5);
        let h = t.hessian(f, &[x, mu]);
        assert_relative_eq!(h[0][0], -0.25, epsilon = 1e-12);
        assert_relative_eq!(h[0][1], 0.25, epsilon = 1e-12);
        assert_relative_eq!(h[1][1], -0.25, epsilon = 1e-12);
    }

    fn mixed(t: &mut Tape, xv: f64, yv: f64, zv: f64) -> (Var, [Var; 3]) {
        // f(x, y, z) = exp(-x) (y^2 + ln z) + z / y + sqrt(z) x
        let x = t.var(xv);
        let y = t.var(yv);
        let z = t.var(zv);
        let nx = t.neg(x);
        let enx = t.exp(nx);
        let y2 = t.powi(y, 2);
        let lz = t.ln(z);
        let inner = t.add(y2, lz);
        let a = t.mul(enx, inner);
        let b = t.div(z, y);
        let sz = t.powf(z, 0.5);
        let c = t.mul(sz, x);
        let ab = t.add(a, b);
        (t.add(ab, c), [x, y, z])
    }

    fn mixed_value(p: &[f64]) -> f64 {
        (-p[0]).exp() * (p[1] * p[1] + p[2].ln()) + p[2] / p[1] + p[2].sqrt() * p[0]
    }

    #[test]
    fn test_hessian_matches_finite_differences() {
        let p = [1.5, 2.0, 3.0];
        let mut t = Tape::new();
        let (f, inputs) = mixed(&mut t, p[0], p[1], p[2]);
        assert_relative_eq!(t.val(f), mixed_value(&p), epsilon = 1e-12);
        let h = t.hessian(f, &inputs);

        let eps = 1e-4;
        for i in 0..3 {
            for j in 0..3 {
                let at = |di: f64, dj: f64| {
                    let mut q = p;
                    q[i] += di;
                    q[j] += dj;
                    mixed_value(&q)
                };
                let fd = (at(eps, eps) - at(eps, -eps) - at(-eps, eps) + at(-eps, -eps))
                    / (4.0 * eps * eps);
                assert_relative_eq!(h[i][j], fd, epsilon = 1e-5, max_relative = 1e-5);
            }
        }
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(h[i][j], h[j][i]);
            }
        }
    }

    #[test]
    fn test_hessian_leaves_gradient_in_adjoints() {
        let p = [0.3, 1.7, 2.2];
        let mut t = Tape::new();
        let (f, inputs) = mixed(&mut t, p[0], p[1], p[2]);
        let g_first = t.gradient(f, &inputs);
        let _ = t.hessian(f, &inputs);
        for (k, &x) in inputs.iter().enumerate() {
            assert_relative_eq!(t.adjoint(x), g_first[k], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_hessian_subset_of_inputs() {
        // Omitted inputs still enter the value; only the requested block is returned.
        let mut t = Tape::new();
        let x = t.var(2.0);
        let y = t.var(3.0);
        let xy = t.mul(x, y);
        let f = t.mul(xy, y); // x y^2
        let h = t.hessian(f, &[y]);
        assert_eq!(h, vec![vec![4.0]]);
        assert!(t.hessian(f, &[]).is_empty());
    }

    #[test]
    fn test_zero_log_argument_is_not_an_error() {
        let mut t = Tape::new();
        let r = t.var(0.0);
        let l = t.ln(r);
        assert_eq!(t.val(l), f64::NEG_INFINITY);
        t.backward(l);
        assert!(t.adjoint(r).is_infinite());
    }

    #[test]
    fn test_constants_carry_no_tangent() {
        let mut t = Tape::new();
        let c = t.constant(42.0);
        let x = t.var(3.0);
        let z = t.mul(c, x);
        assert_eq!(t.gradient(z, &[x]), vec![42.0]);
        assert_eq!(t.hessian(z, &[x]), vec![vec![0.0]]);
    }

    #[test]
    fn test_clear_and_rerecord() {
        let mut t = Tape::with_capacity(8);
        let x = t.var(2.0);
        let z = t.mul(x, x);
        assert_eq!(t.gradient(z, &[x]), vec![4.0]);

        t.clear();
        assert!(t.is_empty());
        let x = t.var(5.0);
        let z = t.powi(x, 3);
        assert_eq!(t.len(), 2);
        assert_relative_eq!(t.gradient(z, &[x])[0], 75.0, epsilon = 1e-12);
        assert_relative_eq!(t.hessian(z, &[x])[0][0], 30.0, epsilon = 1e-12);
    }
}
