//! CNN primitives on `nalgebra` matrices, with the backward passes training needs.
//!
//! A feature map is stored as a `channels × (height·width)` matrix, spatial
//! positions in row-major order. Convolution is lowered to im2col followed by a
//! single GEMM:
//!
//! ```text
//! out[c_out, p] = bias[c_out] + Σ_k weight[c_out, k] · cols[k, p]
//! ```
//!
//! where `k = (c_in, ki, kj)` flattened in that order. This matches the layout of
//! a PyTorch `Conv2d` weight `[out, in, kh, kw]` viewed as `[out, in·kh·kw]`.

use nalgebra::{DMatrix, DVector};

/// Multi-channel 2D activations.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    height: usize,
    width: usize,
    data: DMatrix<f32>,
}

impl FeatureMap {
    /// Single-channel map from row-major values.
    ///
    /// Returns `None` when `values.len() != height * width`.
    pub fn from_gray(height: usize, width: usize, values: &[f32]) -> Option<Self> {
        if values.len() != height * width {
            return None;
        }
        Some(Self {
            height,
            width,
            data: DMatrix::from_row_slice(1, height * width, values),
        })
    }

    pub fn channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, channel: usize, row: usize, col: usize) -> f32 {
        self.data[(channel, row * self.width + col)]
    }

    /// Inverse of [`FeatureMap::flatten`].
    pub fn from_flat(channels: usize, height: usize, width: usize, values: &DVector<f32>) -> Option<Self> {
        let hw = height * width;
        if values.len() != channels * hw {
            return None;
        }
        Some(Self {
            height,
            width,
            data: DMatrix::from_fn(channels, hw, |c, p| values[c * hw + p]),
        })
    }

    /// Flatten as `[channel, row, col]`, the order of `Tensor::view(-1)` on NCHW.
    pub fn flatten(&self) -> DVector<f32> {
        let (c, hw) = self.data.shape();
        DVector::from_fn(c * hw, |i, _| self.data[(i / hw, i % hw)])
    }
}

/// Static shape of a convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub padding: (usize, usize),
}

impl ConvGeometry {
    /// Output spatial size for a `height × width` input (stride 1).
    ///
    /// `None` if the kernel does not fit inside the padded input.
    pub fn output_size(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let h = (height + 2 * ph).checked_sub(kh)? + 1;
        let w = (width + 2 * pw).checked_sub(kw)? + 1;
        Some((h, w))
    }

    /// Columns of the lowered weight matrix.
    pub fn patch_len(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }
}

/// Lower `input` into the `(c_in·kh·kw) × (out_h·out_w)` patch matrix.
fn im2col(input: &FeatureMap, geom: &ConvGeometry, out_h: usize, out_w: usize) -> DMatrix<f32> {
    let (kh, kw) = geom.kernel;
    let (ph, pw) = geom.padding;
    let (h, w) = (input.height as isize, input.width as isize);

    DMatrix::from_fn(geom.patch_len(), out_h * out_w, |k, p| {
        let c = k / (kh * kw);
        let ki = (k / kw) % kh;
        let kj = k % kw;
        let r = (p / out_w + ki) as isize - ph as isize;
        let col = (p % out_w + kj) as isize - pw as isize;
        if r < 0 || col < 0 || r >= h || col >= w {
            0.0
        } else {
            input.data[(c, r as usize * input.width + col as usize)]
        }
    })
}

/// Scatter-add a patch matrix back onto a `height × width` map; adjoint of [`im2col`].
fn col2im(
    cols: &DMatrix<f32>,
    geom: &ConvGeometry,
    height: usize,
    width: usize,
    out_w: usize,
) -> FeatureMap {
    let (kh, kw) = geom.kernel;
    let (ph, pw) = geom.padding;
    let mut data = DMatrix::zeros(geom.in_channels, height * width);

    for p in 0..cols.ncols() {
        let (orow, ocol) = (p / out_w, p % out_w);
        for k in 0..cols.nrows() {
            let c = k / (kh * kw);
            let r = (orow + (k / kw) % kh) as isize - ph as isize;
            let col = (ocol + k % kw) as isize - pw as isize;
            if r < 0 || col < 0 || r >= height as isize || col >= width as isize {
                continue;
            }
            data[(c, r as usize * width + col as usize)] += cols[(k, p)];
        }
    }
    FeatureMap { height, width, data }
}

/// Stride-1 zero-padded convolution.
///
/// `weight` is `out_channels × patch_len`, `bias` has `out_channels` entries.
/// Returns `None` on any shape disagreement.
pub fn conv2d(
    input: &FeatureMap,
    geom: &ConvGeometry,
    weight: &DMatrix<f32>,
    bias: &DVector<f32>,
) -> Option<FeatureMap> {
    if input.channels() != geom.in_channels
        || weight.shape() != (geom.out_channels, geom.patch_len())
        || bias.len() != geom.out_channels
    {
        return None;
    }
    let (out_h, out_w) = geom.output_size(input.height, input.width)?;
    let cols = im2col(input, geom, out_h, out_w);
    let mut data = weight * cols;
    for j in 0..data.ncols() {
        for i in 0..data.nrows() {
            data[(i, j)] += bias[i];
        }
    }
    Some(FeatureMap {
        height: out_h,
        width: out_w,
        data,
    })
}

/// Gradients of one convolution layer.
#[derive(Debug, Clone)]
pub struct ConvGrads {
    pub weight: DMatrix<f32>,
    pub bias: DVector<f32>,
    pub input: FeatureMap,
}

/// Backward pass of [`conv2d`], given the gradient of the loss with respect to
/// its output. `None` on any shape disagreement.
pub fn conv2d_backward(
    input: &FeatureMap,
    geom: &ConvGeometry,
    weight: &DMatrix<f32>,
    grad_out: &FeatureMap,
) -> Option<ConvGrads> {
    if input.channels() != geom.in_channels
        || weight.shape() != (geom.out_channels, geom.patch_len())
        || grad_out.channels() != geom.out_channels
    {
        return None;
    }
    let (out_h, out_w) = geom.output_size(input.height, input.width)?;
    if (grad_out.height, grad_out.width) != (out_h, out_w) {
        return None;
    }

    let cols = im2col(input, geom, out_h, out_w);
    let weight_grad = &grad_out.data * cols.transpose();
    let bias_grad = DVector::from_iterator(
        geom.out_channels,
        grad_out.data.row_iter().map(|row| row.sum()),
    );
    let col_grad = weight.transpose() * &grad_out.data;

    Some(ConvGrads {
        weight: weight_grad,
        bias: bias_grad,
        input: col2im(&col_grad, geom, input.height, input.width, out_w),
    })
}

pub fn relu(map: &mut FeatureMap) {
    map.data.apply(|v| *v = v.max(0.0));
}

/// Zero `grad` wherever the ReLU `output` was not positive.
pub fn relu_backward(output: &FeatureMap, grad: &mut FeatureMap) {
    let mask = output.data.as_slice();
    for (g, &y) in grad.data.as_mut_slice().iter_mut().zip(mask) {
        if y <= 0.0 {
            *g = 0.0;
        }
    }
}

/// Max pooling over non-overlapping `factor × 1` row blocks; trailing rows drop.
pub fn max_pool_rows(input: &FeatureMap, factor: usize) -> FeatureMap {
    let factor = factor.max(1);
    let out_h = input.height / factor;
    let w = input.width;
    let data = DMatrix::from_fn(input.channels(), out_h * w, |c, p| {
        let (r, col) = (p / w, p % w);
        (0..factor)
            .map(|k| input.data[(c, (r * factor + k) * w + col)])
            .fold(f32::NEG_INFINITY, f32::max)
    });
    FeatureMap {
        height: out_h,
        width: w,
        data,
    }
}

/// Route `grad_out` back to the first maximum of each pooling block.
pub fn max_pool_rows_backward(input: &FeatureMap, factor: usize, grad_out: &FeatureMap) -> FeatureMap {
    let factor = factor.max(1);
    let w = input.width;
    let mut data = DMatrix::zeros(input.channels(), input.height * w);

    for c in 0..grad_out.channels().min(input.channels()) {
        for p in 0..grad_out.height * grad_out.width {
            let (r, col) = (p / w, p % w);
            let mut best = r * factor * w + col;
            for k in 1..factor {
                let idx = (r * factor + k) * w + col;
                if input.data[(c, idx)] > input.data[(c, best)] {
                    best = idx;
                }
            }
            data[(c, best)] += grad_out.data[(c, p)];
        }
    }
    FeatureMap {
        height: input.height,
        width: w,
        data,
    }
}

/// Fully connected layer: `weight · x + bias`.
pub fn linear(x: &DVector<f32>, weight: &DMatrix<f32>, bias: &DVector<f32>) -> Option<DVector<f32>> {
    if weight.ncols() != x.len() || weight.nrows() != bias.len() {
        return None;
    }
    Some(weight * x + bias)
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
