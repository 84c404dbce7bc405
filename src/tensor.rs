//! Matrix valued nodes which form a computation graph
//!
//! Every tensor is a row-major 2-D matrix. Rows index samples of a batch and
//! columns index features, which is all a fully-connected classifier needs.
use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::HashSet,
    fmt::{self, Display},
    ops::Neg,
    rc::Rc,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backprop_fns::{
    BackpropFunc, update_gradients_one_operand, update_gradients_three_operands,
    update_gradients_two_operands,
};

type SharedTensor = Rc<RefCell<InnerTensor>>;

/// Errors for tensor construction and operations
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Incompatible shapes for {op}: {lhs} and {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },
    #[error("Shape {shape} holds {expected} values, got {got}")]
    DataLength {
        shape: Shape,
        expected: usize,
        got: usize,
    },
    #[error("All rows must have the same length, expected {expected} but got {got}")]
    RaggedRows { expected: usize, got: usize },
}

/// Dimensions of a matrix, serialized as `[rows, cols]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[usize; 2]", into = "[usize; 2]")]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of elements
    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<[usize; 2]> for Shape {
    fn from([rows, cols]: [usize; 2]) -> Self {
        Self::new(rows, cols)
    }
}

impl From<Shape> for [usize; 2] {
    fn from(shape: Shape) -> Self {
        [shape.rows, shape.cols]
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.rows, self.cols)
    }
}

/// Newtype representing a shared matrix in a computation graph
#[derive(Debug, Clone)]
pub struct Tensor(pub(crate) SharedTensor);

impl Tensor {
    /// Create a constant tensor. Constants never receive gradients.
    pub fn new(data: Vec<f32>, shape: Shape) -> Result<Self, TensorError> {
        check_len(&data, shape)?;
        Ok(Self::leaf(data, shape, false))
    }

    /// Create a trainable leaf tensor which accumulates gradients during `backward`
    pub fn parameter(data: Vec<f32>, shape: Shape) -> Result<Self, TensorError> {
        check_len(&data, shape)?;
        Ok(Self::leaf(data, shape, true))
    }

    /// Create a constant tensor by stacking rows
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self, TensorError> {
        let cols = rows.first().map_or(0, |r| r.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(TensorError::RaggedRows {
                    expected: cols,
                    got: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self::leaf(data, Shape::new(rows.len(), cols), false))
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::leaf(vec![0.0; shape.len()], shape, false)
    }

    /// Constant built from data whose length is already known to match `shape`
    pub(crate) fn constant(data: Vec<f32>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.len());
        Self::leaf(data, shape, false)
    }

    fn leaf(data: Vec<f32>, shape: Shape, requires_grad: bool) -> Self {
        Self(Rc::new(RefCell::new(InnerTensor::new(
            data,
            shape,
            requires_grad,
            None,
        ))))
    }

    /// Create a tensor derived from an operation on other tensors (i.e. not a leaf node)
    fn new_derived(
        data: Vec<f32>,
        shape: Shape,
        backprop_fn: BackpropFunc,
        children: &[&Tensor],
    ) -> Self {
        let requires_grad = children.iter().any(|c| c.requires_grad());
        let mut inner = InnerTensor::new(data, shape, requires_grad, Some(backprop_fn));
        inner.children = children.iter().map(|c| c.0.clone()).collect();
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn shape(&self) -> Shape {
        self.0.borrow().shape
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub fn data(&self) -> Vec<f32> {
        self.0.borrow().data.clone()
    }

    pub fn grad(&self) -> Vec<f32> {
        self.0.borrow().grad.clone()
    }

    /// The first element, meant for `1x1` results such as a loss
    pub fn item(&self) -> f32 {
        self.0.borrow().data.first().copied().unwrap_or(f32::NAN)
    }

    /// Copy of a single row
    pub fn row(&self, row: usize) -> Vec<f32> {
        let inner = self.0.borrow();
        let cols = inner.shape.cols;
        inner.data[row * cols..(row + 1) * cols].to_vec()
    }

    /// Index of the largest value in every row
    pub fn argmax_rows(&self) -> Vec<usize> {
        let inner = self.0.borrow();
        let Shape { rows, cols } = inner.shape;
        (0..rows)
            .map(|r| {
                inner.data[r * cols..(r + 1) * cols]
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                    .map_or(0, |(i, _)| i)
            })
            .collect()
    }

    // Strictly, &mut isn't needed since the tensor is behind a shared mutable type,
    // but it indicates that the tensor should be exclusively mutated
    pub fn set_data(&mut self, data: Vec<f32>) -> Result<(), TensorError> {
        let mut inner = self.0.borrow_mut();
        check_len(&data, inner.shape)?;
        inner.data = data;
        Ok(())
    }

    /// Mutate the data in place with read access to the accumulated gradient
    pub(crate) fn update(&mut self, f: impl FnOnce(&mut [f32], &[f32])) {
        let inner = &mut *self.0.borrow_mut();
        f(&mut inner.data, &inner.grad);
    }

    /// Unlike PyTorch which only zeros out the gradients of the leaf nodes, this zeros out
    /// all gradients in the computation graph which are children of this node
    pub fn zero_grad(&mut self) {
        let mut backprop_order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        self.backward_inner(&mut backprop_order, &mut visited);
        for tensor in backprop_order.into_iter().rev() {
            tensor.0.borrow_mut().grad.fill(0.0);
        }
    }

    /// Backpropagates from this node. The node's own gradient is seeded with ones,
    /// so for a non-scalar output this differentiates the sum of its elements.
    pub fn backward(&self) {
        self.0.borrow_mut().grad.fill(1.0);

        let mut backprop_order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();

        // visit in post order
        self.backward_inner(&mut backprop_order, &mut visited);

        // intermediate nodes restart from zero so a repeated backward only accumulates into leaves
        for tensor in backprop_order.iter() {
            let mut inner = tensor.0.borrow_mut();
            if inner.backprop_fn.is_some() && !Rc::ptr_eq(&tensor.0, &self.0) {
                inner.grad.fill(0.0);
            }
        }

        // apply backprop, reversed to start from root first
        for tensor in backprop_order.into_iter().rev() {
            if !tensor.requires_grad() {
                continue;
            }
            let (children, backprop_fn) = {
                let inner = tensor.0.borrow();
                let children = inner
                    .children
                    .iter()
                    .map(|c| Tensor(c.clone()))
                    .collect::<Vec<_>>();
                (children, inner.backprop_fn)
            };
            if let Some(f) = backprop_fn {
                debug_assert!(f.n_operands() == children.len());
            }
            match children.as_slice() {
                [] => {}
                [in1] => update_gradients_one_operand(in1, &tensor),
                [in1, in2] => update_gradients_two_operands(in1, in2, &tensor),
                [in1, in2, in3] => update_gradients_three_operands(in1, in2, in3, &tensor),
                // every BackpropFunc takes one to three operands
                _ => unreachable!("unsupported number of operands: {}", children.len()),
            }
        }
    }

    fn backward_inner(&self, backprop_order: &mut Vec<Tensor>, visited: &mut HashSet<u64>) {
        for c in self.0.borrow().children.iter() {
            if visited.contains(&c.borrow().id) {
                continue;
            }
            visited.insert(c.borrow().id);
            let tensor = Tensor(c.clone());
            tensor.backward_inner(backprop_order, visited);
        }
        backprop_order.push(self.clone());
    }
}

// Various operations on tensors
impl Tensor {
    /// Affine map `self · weightᵀ + bias` with `self: [batch, in]`, `weight: [out, in]`
    /// and `bias: [1, out]`
    pub fn linear(&self, weight: &Tensor, bias: &Tensor) -> Result<Tensor, TensorError> {
        let x_shape = self.shape();
        let w_shape = weight.shape();
        let b_shape = bias.shape();
        if x_shape.cols != w_shape.cols {
            return Err(TensorError::ShapeMismatch {
                op: "linear",
                lhs: x_shape,
                rhs: w_shape,
            });
        }
        if b_shape != Shape::new(1, w_shape.rows) {
            return Err(TensorError::ShapeMismatch {
                op: "linear bias",
                lhs: w_shape,
                rhs: b_shape,
            });
        }

        let (batch, n_in, n_out) = (x_shape.rows, x_shape.cols, w_shape.rows);
        let data = {
            let x = self.0.borrow();
            let w = weight.0.borrow();
            let b = bias.0.borrow();
            let mut out = Vec::with_capacity(batch * n_out);
            for r in 0..batch {
                let x_row = &x.data[r * n_in..(r + 1) * n_in];
                for o in 0..n_out {
                    let w_row = &w.data[o * n_in..(o + 1) * n_in];
                    out.push(dot(x_row, w_row) + b.data[o]);
                }
            }
            out
        };

        Ok(Tensor::new_derived(
            data,
            Shape::new(batch, n_out),
            BackpropFunc::Linear,
            &[self, weight, bias],
        ))
    }

    /// Element-wise product of two tensors of the same shape
    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let shape = self.shape();
        if shape != other.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "mul",
                lhs: shape,
                rhs: other.shape(),
            });
        }
        let data = {
            let a = self.0.borrow();
            let b = other.0.borrow();
            a.data.iter().zip(b.data.iter()).map(|(a, b)| a * b).collect()
        };
        Ok(Tensor::new_derived(
            data,
            shape,
            BackpropFunc::Mul,
            &[self, other],
        ))
    }

    pub fn relu(&self) -> Tensor {
        self.map(BackpropFunc::ReLU, |v| v.max(0.0))
    }

    pub fn exp(&self) -> Tensor {
        self.map(BackpropFunc::Exp, f32::exp)
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(BackpropFunc::Scale(factor), |v| v * factor)
    }

    /// Row-wise `log(softmax(x))`, computed as `x - max - log(sum(exp(x - max)))` so that
    /// large logits do not overflow
    pub fn log_softmax(&self) -> Tensor {
        let shape = self.shape();
        let data = {
            let inner = self.0.borrow();
            let mut out = Vec::with_capacity(shape.len());
            for r in 0..shape.rows {
                let row = &inner.data[r * shape.cols..(r + 1) * shape.cols];
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                out.extend(row.iter().map(|v| v - max - log_sum));
            }
            out
        };
        Tensor::new_derived(data, shape, BackpropFunc::LogSoftmax, &[self])
    }

    /// Sum of all elements as a `1x1` tensor
    pub fn sum(&self) -> Tensor {
        let total = self.0.borrow().data.iter().sum::<f32>();
        Tensor::new_derived(vec![total], Shape::new(1, 1), BackpropFunc::Sum, &[self])
    }

    fn map(&self, backprop_fn: BackpropFunc, f: impl Fn(f32) -> f32) -> Tensor {
        let shape = self.shape();
        let data = self.0.borrow().data.iter().map(|v| f(*v)).collect();
        Tensor::new_derived(data, shape, backprop_fn, &[self])
    }
}

// pretty print a tensor and its children recursively in a JSON-like format
impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_tensor(tensor: &Tensor, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let inner = tensor.0.borrow();
            let indent_str = " ".repeat(indent);
            let indent_inner = " ".repeat(indent + 2);
            writeln!(f, "{}{{", indent_str)?;
            writeln!(f, "{}\"shape\": \"{}\",", indent_inner, inner.shape)?;
            writeln!(
                f,
                "{}\"requires_grad\": {},",
                indent_inner, inner.requires_grad
            )?;
            writeln!(f, "{}\"id\": {},", indent_inner, inner.id)?;
            writeln!(
                f,
                "{}\"backprop_fn\": {:?},",
                indent_inner, inner.backprop_fn
            )?;
            writeln!(f, "{}\"children\": [", indent_inner)?;
            for (i, child) in inner.children.iter().enumerate() {
                let child_tensor = Tensor(child.clone());
                fmt_tensor(&child_tensor, indent + 4, f)?;
                if i < inner.children.len() - 1 {
                    writeln!(f, ",")?;
                } else {
                    writeln!(f)?;
                }
            }
            writeln!(f, "{}]", indent_inner)?;
            write!(f, "{}}}", indent_str)
        }
        fmt_tensor(self, 0, f)
    }
}

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        self.scale(-1.0)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        let a = self.0.borrow();
        let b = other.0.borrow();
        a.shape == b.shape && a.data == b.data
    }
}

#[derive(Debug)]
pub(crate) struct InnerTensor {
    // the network uses 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: Vec<f32>,
    /// gradient of the output with respect to each element, same length as `data`
    pub(crate) grad: Vec<f32>,
    pub(crate) shape: Shape,
    /// Leaves set this explicitly, derived nodes inherit it from their inputs
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedTensor>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this tensor from its children
    /// `None` when the tensor is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerTensor {
    fn new(
        data: Vec<f32>,
        shape: Shape,
        requires_grad: bool,
        backprop_fn: Option<BackpropFunc>,
    ) -> Self {
        let grad = vec![0.0; data.len()];
        Self {
            data,
            grad,
            shape,
            requires_grad,
            children: vec![],
            id: generate_random_id(),
            backprop_fn,
        }
    }
}

fn check_len(data: &[f32], shape: Shape) -> Result<(), TensorError> {
    if data.len() != shape.len() {
        return Err(TensorError::DataLength {
            shape,
            expected: shape.len(),
            got: data.len(),
        });
    }
    Ok(())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(a, b)| a * b).sum()
}

fn generate_random_id() -> u64 {
    let mut rng = rand::rng();
    rng.random() // generates a random u64
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            $crate::assert_eq_float!($a, $b, 1e-6)
        };
        ($a:expr, $b:expr, $eps:expr) => {{
            let (a, b) = ($a, $b);
            assert!((a - b).abs() < $eps, "{} != {} (tolerance {})", a, b, $eps);
        }};
    }

    fn param(data: &[f32], rows: usize, cols: usize) -> Tensor {
        Tensor::parameter(data.to_vec(), Shape::new(rows, cols)).unwrap()
    }

    #[test]
    fn test_data_length_checked() {
        let err = Tensor::new(vec![1.0, 2.0, 3.0], Shape::new(2, 2)).unwrap_err();
        assert_eq!(
            err,
            TensorError::DataLength {
                shape: Shape::new(2, 2),
                expected: 4,
                got: 3
            }
        );
        let err = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert_eq!(err, TensorError::RaggedRows { expected: 2, got: 1 });
    }

    #[test]
    fn test_linear() {
        // x: [2, 3], w: [2, 3], b: [1, 2]
        let x = Tensor::from_rows(&[[1.0, 2.0, 3.0], [0.0, -1.0, 1.0]]).unwrap();
        let w = param(&[1.0, 0.0, 1.0, 2.0, 1.0, 0.0], 2, 3);
        let b = param(&[0.5, -0.5], 1, 2);
        let y = x.linear(&w, &b).unwrap();
        assert_eq!(y.shape(), Shape::new(2, 2));
        assert_eq!(y.data(), vec![4.5, 3.5, 1.5, -1.5]);

        y.backward();
        // dy/dw[o, i] = sum over rows of x[r, i]
        assert_eq!(w.grad(), vec![1.0, 1.0, 4.0, 1.0, 1.0, 4.0]);
        // dy/db[o] = number of rows
        assert_eq!(b.grad(), vec![2.0, 2.0]);
        // constants do not accumulate gradients
        assert_eq!(x.grad(), vec![0.0; 6]);
    }

    #[test]
    fn test_linear_input_grad() {
        let x = param(&[1.0, 2.0], 1, 2);
        let w = param(&[3.0, 4.0, 5.0, 6.0], 2, 2);
        let b = Tensor::zeros(Shape::new(1, 2));
        let y = x.linear(&w, &b).unwrap();
        y.backward();
        // dy/dx[i] = sum over outputs of w[o, i]
        assert_eq!(x.grad(), vec![8.0, 10.0]);
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let x = Tensor::zeros(Shape::new(4, 3));
        let w = Tensor::zeros(Shape::new(2, 5));
        let b = Tensor::zeros(Shape::new(1, 2));
        assert!(matches!(
            x.linear(&w, &b),
            Err(TensorError::ShapeMismatch { op: "linear", .. })
        ));
        let w = Tensor::zeros(Shape::new(2, 3));
        let b = Tensor::zeros(Shape::new(1, 3));
        assert!(matches!(
            x.linear(&w, &b),
            Err(TensorError::ShapeMismatch {
                op: "linear bias",
                ..
            })
        ));
    }

    #[test]
    fn test_mul() {
        let a = param(&[2.0, -1.0], 1, 2);
        let b = param(&[3.0, 4.0], 1, 2);
        let c = a.mul(&b).unwrap();
        assert_eq!(c.data(), vec![6.0, -4.0]);

        c.backward();

        // dc/da = b
        // dc/db = a
        assert_eq!(a.grad(), vec![3.0, 4.0]);
        assert_eq!(b.grad(), vec![2.0, -1.0]);
    }

    #[test]
    fn test_mul_with_itself() {
        let a = param(&[3.0], 1, 1);
        let c = a.mul(&a).unwrap();
        c.backward();
        // d(a^2)/da = 2a
        assert_eq!(a.grad(), vec![6.0]);
    }

    #[test]
    fn test_relu() {
        let a = param(&[-1.0, 0.0, 2.0], 1, 3);
        let z = a.relu();
        assert_eq!(z.data(), vec![0.0, 0.0, 2.0]);

        z.backward();
        assert_eq!(a.grad(), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_scale_and_neg() {
        let a = param(&[2.0, 4.0], 2, 1);
        let b = (-&a).scale(0.5);
        assert_eq!(b.data(), vec![-1.0, -2.0]);

        b.backward();
        assert_eq!(a.grad(), vec![-0.5, -0.5]);
    }

    #[test]
    fn test_sum() {
        let a = param(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let s = a.sum();
        assert_eq!(s.shape(), Shape::new(1, 1));
        assert_eq!(s.item(), 10.0);

        s.backward();
        assert_eq!(a.grad(), vec![1.0; 4]);
    }

    #[test]
    fn test_log_softmax_exp() {
        let inputs = param(&[1.0, 2.0], 1, 2);
        let log_probs = inputs.log_softmax();
        let probs = log_probs.exp();
        let p = probs.data();
        assert_eq_float!(p[0], 0.2689414);
        assert_eq_float!(p[1], 0.7310585);

        // Let s1 = exp(x1) / (exp(x1) + exp(x2)), then d log(s1) / dx1 = 1 - s1 and
        // d log(s1) / dx2 = -s2
        let one_hot = Tensor::new(vec![1.0, 0.0], Shape::new(1, 2)).unwrap();
        let picked = log_probs.mul(&one_hot).unwrap().sum();
        picked.backward();
        let grad = inputs.grad();
        assert_eq_float!(grad[0], 1.0 - p[0]);
        assert_eq_float!(grad[1], -p[1]);
    }

    #[test]
    fn test_log_softmax_large_logits() {
        let inputs = Tensor::from_rows(&[[1000.0, 0.0], [-1000.0, -1000.0]]).unwrap();
        let log_probs = inputs.log_softmax().data();
        assert!(log_probs.iter().all(|v| v.is_finite()));
        assert_eq_float!(log_probs[0], 0.0);
        assert_eq_float!(log_probs[2], -(2.0f32.ln()));
    }

    #[test]
    fn test_zero_grad() {
        let a = param(&[1.0, 2.0], 1, 2);
        let mut s = a.relu().sum();
        s.backward();
        s.backward();
        // leaves accumulate until zeroed
        assert_eq!(a.grad(), vec![2.0, 2.0]);

        s.zero_grad();
        assert_eq!(a.grad(), vec![0.0, 0.0]);
        assert_eq!(s.grad(), vec![0.0]);
    }

    #[test]
    fn test_argmax_and_rows() {
        let t = Tensor::from_rows(&[[0.1, 0.7, 0.2], [3.0, -1.0, 2.0]]).unwrap();
        assert_eq!(t.argmax_rows(), vec![1, 0]);
        assert_eq!(t.row(1), vec![3.0, -1.0, 2.0]);
    }

    #[test]
    fn test_set_data() {
        let mut t = Tensor::zeros(Shape::new(1, 2));
        t.set_data(vec![1.0, 2.0]).unwrap();
        assert_eq!(t.data(), vec![1.0, 2.0]);
        assert!(t.set_data(vec![1.0]).is_err());
    }

    #[test]
    fn test_display_lists_graph() {
        let a = param(&[1.0], 1, 1);
        let out = a.relu().sum();
        let printed = out.to_string();
        assert!(printed.contains("Sum"));
        assert!(printed.contains("ReLU"));
        assert!(printed.contains("\"shape\": \"[1, 1]\""));
    }

    #[test]
    fn test_shape_serializes_as_pair() {
        let json = serde_json::to_string(&Shape::new(10, 64)).unwrap();
        assert_eq!(json, "[10,64]");
        let back: Shape = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Shape::new(10, 64));
    }
}
