//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph. Inputs which do not require gradients are skipped.

use crate::tensor::{Shape, Tensor};

/// Represents the function in the computation graph
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackpropFunc {
    Linear,
    Mul,
    ReLU,
    Exp,
    LogSoftmax,
    Sum,
    Scale(f32),
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Linear => 3,
            BackpropFunc::Mul => 2,
            BackpropFunc::ReLU => 1,
            BackpropFunc::Exp => 1,
            BackpropFunc::LogSoftmax => 1,
            BackpropFunc::Sum => 1,
            BackpropFunc::Scale(_) => 1,
        }
    }
}

fn accumulate(input: &Tensor, grad: &[f32]) {
    let mut inner = input.0.borrow_mut();
    if !inner.requires_grad {
        return;
    }
    debug_assert_eq!(inner.grad.len(), grad.len());
    inner
        .grad
        .iter_mut()
        .zip(grad.iter())
        .for_each(|(g, d)| *g += d);
}

fn out_grad(out: &Tensor) -> Vec<f32> {
    out.0.borrow().grad.clone()
}

/// Represents backprop for `x · wᵀ + b = out`
pub fn linear(x: &Tensor, w: &Tensor, b: &Tensor, out: &Tensor) {
    let grad = out_grad(out);
    let Shape {
        rows: batch,
        cols: n_in,
    } = x.shape();
    let n_out = w.shape().rows;

    if x.requires_grad() {
        // dx = grad · w
        let dx = {
            let w = w.0.borrow();
            let mut dx = vec![0.0; batch * n_in];
            for r in 0..batch {
                let dx_row = &mut dx[r * n_in..(r + 1) * n_in];
                for o in 0..n_out {
                    let g = grad[r * n_out + o];
                    if g == 0.0 {
                        continue;
                    }
                    let w_row = &w.data[o * n_in..(o + 1) * n_in];
                    dx_row.iter_mut().zip(w_row).for_each(|(d, w)| *d += g * w);
                }
            }
            dx
        };
        accumulate(x, &dx);
    }

    if w.requires_grad() {
        // dw = gradᵀ · x
        let dw = {
            let x = x.0.borrow();
            let mut dw = vec![0.0; n_out * n_in];
            for r in 0..batch {
                let x_row = &x.data[r * n_in..(r + 1) * n_in];
                for o in 0..n_out {
                    let g = grad[r * n_out + o];
                    if g == 0.0 {
                        continue;
                    }
                    dw[o * n_in..(o + 1) * n_in]
                        .iter_mut()
                        .zip(x_row)
                        .for_each(|(d, x)| *d += g * x);
                }
            }
            dw
        };
        accumulate(w, &dw);
    }

    if b.requires_grad() {
        // bias is broadcast over the batch, so its gradient is the column sum
        let mut db = vec![0.0; n_out];
        for row in grad.chunks(n_out.max(1)) {
            db.iter_mut().zip(row).for_each(|(d, g)| *d += g);
        }
        accumulate(b, &db);
    }
}

/// Represents backprop for the element-wise operation `in1 * in2 = out`
pub fn mul(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let grad = out_grad(out);
    let (d1, d2) = {
        let a = in1.0.borrow();
        let b = in2.0.borrow();
        let d1 = grad.iter().zip(b.data.iter()).map(|(g, b)| g * b).collect::<Vec<_>>();
        let d2 = grad.iter().zip(a.data.iter()).map(|(g, a)| g * a).collect::<Vec<_>>();
        (d1, d2)
    };
    accumulate(in1, &d1);
    accumulate(in2, &d2);
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(in1: &Tensor, out: &Tensor) {
    let grad = out_grad(out);
    let d = {
        let x = in1.0.borrow();
        x.data
            .iter()
            .zip(grad.iter())
            .map(|(x, g)| if *x > 0.0 { *g } else { 0.0 })
            .collect::<Vec<_>>()
    };
    accumulate(in1, &d);
}

/// Represents backprop for the operation `exp(in) = out`
pub fn exp(in1: &Tensor, out: &Tensor) {
    let d = {
        let out = out.0.borrow();
        out.grad
            .iter()
            .zip(out.data.iter())
            .map(|(g, y)| g * y)
            .collect::<Vec<_>>()
    };
    accumulate(in1, &d);
}

/// Represents backprop for the row-wise operation `log_softmax(in) = out`
///
/// d out_j / d in_i = δ_ij - softmax_i, so per row `d in = grad - softmax * sum(grad)`
pub fn log_softmax(in1: &Tensor, out: &Tensor) {
    let d = {
        let out = out.0.borrow();
        let cols = out.shape.cols.max(1);
        let mut d = Vec::with_capacity(out.data.len());
        for (g_row, y_row) in out.grad.chunks(cols).zip(out.data.chunks(cols)) {
            let g_sum = g_row.iter().sum::<f32>();
            d.extend(
                g_row
                    .iter()
                    .zip(y_row.iter())
                    .map(|(g, y)| g - y.exp() * g_sum),
            );
        }
        d
    };
    accumulate(in1, &d);
}

/// Represents backprop for `sum(in) = out`
pub fn sum(in1: &Tensor, out: &Tensor) {
    let g = out.0.borrow().grad[0];
    let d = vec![g; in1.shape().len()];
    accumulate(in1, &d);
}

/// Represents backprop for `factor * in = out`
pub fn scale(in1: &Tensor, out: &Tensor, factor: f32) {
    let d = out_grad(out)
        .into_iter()
        .map(|g| g * factor)
        .collect::<Vec<_>>();
    accumulate(in1, &d);
}

/// Applies a backprop function for operators with three operands
pub fn update_gradients_three_operands(in1: &Tensor, in2: &Tensor, in3: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Linear) => linear(in1, in2, in3, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with two operands
pub fn update_gradients_two_operands(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Mul) => mul(in1, in2, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with one operand
pub fn update_gradients_one_operand(in1: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::ReLU) => relu(in1, out),
        Some(BackpropFunc::Exp) => exp(in1, out),
        Some(BackpropFunc::LogSoftmax) => log_softmax(in1, out),
        Some(BackpropFunc::Sum) => sum(in1, out),
        Some(BackpropFunc::Scale(factor)) => scale(in1, out, factor),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}
