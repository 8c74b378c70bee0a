//! Native CPU implementation of the CNN5d / CNN20d networks.
//!
//! Layer stack per architecture (stride 1 everywhere, `(5, 3)` kernels):
//!
//! ```text
//! CNN5d : conv(1→64, pad 2×1) relu pool2 | conv(64→128, pad 2×1) relu pool2 | fc(→2) softmax
//! CNN20d: conv(1→64, pad 1×1) relu pool2 | conv(64→128) relu pool2 | conv(128→256) relu pool2 | fc(→2) softmax
//! ```
//!
//! `pool2` is max pooling over 2×1 blocks (height only). The dense layer width is
//! derived from the geometry rather than hard-coded. Pixels enter the network as
//! raw `0..=255` floats.
//!
//! Training uses per-sample backpropagation of the two-class cross-entropy; a
//! batch gradient is the mean of its samples' gradients, computed in parallel.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::domain::{Architecture, Device, Image};
use crate::error::AppError;
use crate::math::{
    ConvGeometry, FeatureMap, conv2d, conv2d_backward, linear, max_pool_rows, max_pool_rows_backward, relu,
    relu_backward, softmax,
};
use crate::models::checkpoint::{Checkpoint, TensorData};
use crate::models::classifier::{ClassScores, Classifier, ModelMode, NUM_CLASSES};

const KERNEL: (usize, usize) = (5, 3);
const POOL: usize = 2;

/// Convolution stack for an architecture.
pub fn conv_plan(arch: Architecture) -> Vec<ConvGeometry> {
    let (channels, padding): (&[usize], (usize, usize)) = match arch {
        Architecture::Cnn5d => (&[1, 64, 128], (2, 1)),
        Architecture::Cnn20d => (&[1, 64, 128, 256], (1, 1)),
    };
    channels
        .windows(2)
        .map(|pair| ConvGeometry {
            in_channels: pair[0],
            out_channels: pair[1],
            kernel: KERNEL,
            padding,
        })
        .collect()
}

/// Flattened feature count entering the dense layer.
pub fn dense_inputs(arch: Architecture) -> usize {
    let (_, mut h, mut w) = arch.input_shape();
    let mut channels = 1;
    for geom in conv_plan(arch) {
        if let Some((oh, ow)) = geom.output_size(h, w) {
            h = oh / POOL;
            w = ow;
        }
        channels = geom.out_channels;
    }
    channels * h * w
}

#[derive(Debug, Clone)]
struct ConvLayer {
    geom: ConvGeometry,
    weight: DMatrix<f32>,
    bias: DVector<f32>,
}

impl ConvLayer {
    fn weight_shape(&self) -> Vec<usize> {
        let g = &self.geom;
        vec![g.out_channels, g.in_channels, g.kernel.0, g.kernel.1]
    }
}

#[derive(Debug, Clone)]
struct DenseLayer {
    weight: DMatrix<f32>,
    bias: DVector<f32>,
}

#[derive(Debug, Clone)]
pub struct ConvNet {
    architecture: Architecture,
    device: Device,
    mode: ModelMode,
    convs: Vec<ConvLayer>,
    fc: DenseLayer,
    /// Bounded workers for scoring and gradients; `None` uses the global pool.
    pool: Option<Arc<ThreadPool>>,
}

/// Parameter-shaped gradient buffers, in checkpoint order.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    convs: Vec<(DMatrix<f32>, DVector<f32>)>,
    fc: (DMatrix<f32>, DVector<f32>),
}

impl Gradients {
    pub fn zeros(net: &ConvNet) -> Self {
        Self {
            convs: net
                .convs
                .iter()
                .map(|l| (DMatrix::zeros(l.weight.nrows(), l.weight.ncols()), DVector::zeros(l.bias.len())))
                .collect(),
            fc: (
                DMatrix::zeros(net.fc.weight.nrows(), net.fc.weight.ncols()),
                DVector::zeros(net.fc.bias.len()),
            ),
        }
    }

    pub fn accumulate(&mut self, other: &Gradients) {
        for ((w, b), (ow, ob)) in self.convs.iter_mut().zip(&other.convs) {
            *w += ow;
            *b += ob;
        }
        self.fc.0 += &other.fc.0;
        self.fc.1 += &other.fc.1;
    }

    pub fn scale(&mut self, factor: f32) {
        for (w, b) in &mut self.convs {
            *w *= factor;
            *b *= factor;
        }
        self.fc.0 *= factor;
        self.fc.1 *= factor;
    }

    /// Flat views matching [`ConvNet::parameters_mut`].
    pub fn slices(&self) -> Vec<&[f32]> {
        let mut out = Vec::with_capacity(2 * self.convs.len() + 2);
        for (w, b) in &self.convs {
            out.push(w.as_slice());
            out.push(b.as_slice());
        }
        out.push(self.fc.0.as_slice());
        out.push(self.fc.1.as_slice());
        out
    }
}

/// Summed gradients and loss over a group of labeled images.
#[derive(Debug, Clone)]
pub struct BatchGradients {
    pub grads: Gradients,
    /// Sum of per-sample cross-entropy.
    pub loss: f64,
    /// Samples whose up probability is within 0.5 of the label.
    pub correct: usize,
    pub samples: usize,
}

impl BatchGradients {
    fn empty(net: &ConvNet) -> Self {
        Self {
            grads: Gradients::zeros(net),
            loss: 0.0,
            correct: 0,
            samples: 0,
        }
    }

    fn merge(mut self, other: BatchGradients) -> Self {
        self.grads.accumulate(&other.grads);
        self.loss += other.loss;
        self.correct += other.correct;
        self.samples += other.samples;
        self
    }

    /// Turn sums into means; no-op for an empty batch.
    pub fn mean(mut self) -> Self {
        if self.samples > 0 {
            self.grads.scale(1.0 / self.samples as f32);
        }
        self
    }
}

/// Activations kept from a forward pass for backpropagation.
struct Trace {
    /// Input of each convolution.
    inputs: Vec<FeatureMap>,
    /// Post-ReLU output of each convolution, before pooling.
    activations: Vec<FeatureMap>,
    pooled_shape: (usize, usize, usize),
    flat: DVector<f32>,
    logits: DVector<f32>,
}

impl ConvNet {
    /// Fresh network with He-normal weights and zero biases.
    pub fn initialized(architecture: Architecture, device: Device, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut he = |rows: usize, cols: usize| {
            let std = (2.0 / cols as f32).sqrt();
            DMatrix::from_fn(rows, cols, |_, _| {
                let z: f32 = rng.sample(StandardNormal);
                z * std
            })
        };

        let convs = conv_plan(architecture)
            .into_iter()
            .map(|geom| ConvLayer {
                weight: he(geom.out_channels, geom.patch_len()),
                bias: DVector::zeros(geom.out_channels),
                geom,
            })
            .collect();
        let fc = DenseLayer {
            weight: he(NUM_CLASSES, dense_inputs(architecture)),
            bias: DVector::zeros(NUM_CLASSES),
        };

        Self {
            architecture,
            device,
            mode: ModelMode::default(),
            convs,
            fc,
            pool: None,
        }
    }

    /// Build a network of `architecture` from checkpoint tensors.
    ///
    /// The declared architecture is checked first, then every tensor's presence
    /// and shape, so a mismatch fails before any scoring.
    pub fn from_checkpoint(
        checkpoint: &Checkpoint,
        architecture: Architecture,
        device: Device,
    ) -> Result<Self, AppError> {
        checkpoint.ensure_architecture(architecture)?;

        let mut convs = Vec::new();
        for (i, geom) in conv_plan(architecture).into_iter().enumerate() {
            let name = format!("conv{}", i + 1);
            let shape = [geom.out_channels, geom.in_channels, geom.kernel.0, geom.kernel.1];
            let w = checkpoint.tensor(&format!("{name}.weight"), &shape)?;
            let b = checkpoint.tensor(&format!("{name}.bias"), &[geom.out_channels])?;
            convs.push(ConvLayer {
                weight: DMatrix::from_row_slice(geom.out_channels, geom.patch_len(), &w.values),
                bias: DVector::from_column_slice(&b.values),
                geom,
            });
        }

        let inputs = dense_inputs(architecture);
        let w = checkpoint.tensor("fc1.weight", &[NUM_CLASSES, inputs])?;
        let b = checkpoint.tensor("fc1.bias", &[NUM_CLASSES])?;
        let fc = DenseLayer {
            weight: DMatrix::from_row_slice(NUM_CLASSES, inputs, &w.values),
            bias: DVector::from_column_slice(&b.values),
        };

        debug!(%architecture, tensors = checkpoint.tensors.len(), "checkpoint loaded");
        Ok(Self {
            architecture,
            device,
            mode: ModelMode::default(),
            convs,
            fc,
            pool: None,
        })
    }

    /// Run scoring and gradient work on `threads` dedicated workers.
    pub fn with_threads(mut self, threads: usize) -> Result<Self, AppError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("model-{i}"))
            .build()
            .map_err(|e| AppError::io(format!("Failed to start model worker pool: {e}")))?;
        self.pool = Some(Arc::new(pool));
        Ok(self)
    }

    /// Worker count used by [`Classifier::score`] and [`ConvNet::batch_gradients`].
    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, |p| p.current_num_threads())
    }

    fn run<T: Send>(&self, work: impl FnOnce() -> T + Send) -> T {
        match &self.pool {
            Some(pool) => pool.install(work),
            None => work(),
        }
    }

    /// Mutable flat views of every parameter tensor, in checkpoint order.
    pub fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        let mut out = Vec::with_capacity(2 * self.convs.len() + 2);
        for layer in &mut self.convs {
            let ConvLayer { weight, bias, .. } = layer;
            out.push(weight.as_mut_slice());
            out.push(bias.as_mut_slice());
        }
        let DenseLayer { weight, bias } = &mut self.fc;
        out.push(weight.as_mut_slice());
        out.push(bias.as_mut_slice());
        out
    }

    /// Export parameters in checkpoint form (row-major, PyTorch names).
    pub fn checkpoint(&self) -> Checkpoint {
        let mut tensors = std::collections::BTreeMap::new();
        for (i, layer) in self.convs.iter().enumerate() {
            let name = format!("conv{}", i + 1);
            tensors.insert(
                format!("{name}.weight"),
                TensorData::new(layer.weight_shape(), row_major(&layer.weight)),
            );
            tensors.insert(
                format!("{name}.bias"),
                TensorData::new(vec![layer.bias.len()], layer.bias.as_slice().to_vec()),
            );
        }
        tensors.insert(
            "fc1.weight".to_string(),
            TensorData::new(
                vec![self.fc.weight.nrows(), self.fc.weight.ncols()],
                row_major(&self.fc.weight),
            ),
        );
        tensors.insert(
            "fc1.bias".to_string(),
            TensorData::new(vec![self.fc.bias.len()], self.fc.bias.as_slice().to_vec()),
        );
        Checkpoint {
            architecture: self.architecture.name().to_string(),
            tensors,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn input_map(&self, image: &Image) -> Result<FeatureMap, AppError> {
        let (_, h, w) = self.architecture.input_shape();
        if image.shape() != (h, w) {
            return Err(AppError::model(format!(
                "Image shape {}x{} does not match {} input {h}x{w}.",
                image.height(),
                image.width(),
                self.architecture
            )));
        }
        let values: Vec<f32> = image.pixels().iter().map(|&p| f32::from(p)).collect();
        FeatureMap::from_gray(h, w, &values)
            .ok_or_else(|| AppError::model("Image buffer does not match its shape."))
    }

    fn forward(&self, image: &Image) -> Result<ClassScores, AppError> {
        let mut x = self.input_map(image)?;
        for (i, layer) in self.convs.iter().enumerate() {
            let mut y = conv2d(&x, &layer.geom, &layer.weight, &layer.bias)
                .ok_or_else(|| AppError::model(format!("conv{} shape mismatch.", i + 1)))?;
            relu(&mut y);
            x = max_pool_rows(&y, POOL);
        }

        let logits = linear(&x.flatten(), &self.fc.weight, &self.fc.bias)
            .ok_or_else(|| AppError::model("fc1 shape mismatch."))?;
        ClassScores::from_row(&softmax(logits.as_slice()))
    }

    fn trace(&self, image: &Image) -> Result<Trace, AppError> {
        let mut x = self.input_map(image)?;
        let mut inputs = Vec::with_capacity(self.convs.len());
        let mut activations = Vec::with_capacity(self.convs.len());
        for (i, layer) in self.convs.iter().enumerate() {
            let mut y = conv2d(&x, &layer.geom, &layer.weight, &layer.bias)
                .ok_or_else(|| AppError::model(format!("conv{} shape mismatch.", i + 1)))?;
            relu(&mut y);
            let pooled = max_pool_rows(&y, POOL);
            inputs.push(x);
            activations.push(y);
            x = pooled;
        }
        let flat = x.flatten();
        let logits = linear(&flat, &self.fc.weight, &self.fc.bias)
            .ok_or_else(|| AppError::model("fc1 shape mismatch."))?;
        Ok(Trace {
            inputs,
            activations,
            pooled_shape: (x.channels(), x.height(), x.width()),
            flat,
            logits,
        })
    }

    /// Cross-entropy gradients for one labeled image (`label` 1 = up).
    fn sample_gradients(&self, image: &Image, label: u8) -> Result<BatchGradients, AppError> {
        let trace = self.trace(image)?;
        let target = usize::from(label.min(1));

        let probs = softmax(trace.logits.as_slice());
        let logits: Vec<f64> = trace.logits.iter().map(|&v| f64::from(v)).collect();
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let log_sum = max + logits.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
        let loss = log_sum - logits[target];
        let up = ClassScores::from_row(&probs)?.up;

        let mut grad_logits = DVector::from_column_slice(&probs);
        grad_logits[target] -= 1.0;
        let fc_weight = &grad_logits * trace.flat.transpose();
        let grad_flat = self.fc.weight.transpose() * &grad_logits;

        let (c, h, w) = trace.pooled_shape;
        let mut grad = FeatureMap::from_flat(c, h, w, &grad_flat)
            .ok_or_else(|| AppError::model("fc1 gradient shape mismatch."))?;
        let mut convs = Vec::with_capacity(self.convs.len());
        for (i, layer) in self.convs.iter().enumerate().rev() {
            let act = &trace.activations[i];
            let mut g = max_pool_rows_backward(act, POOL, &grad);
            relu_backward(act, &mut g);
            let step = conv2d_backward(&trace.inputs[i], &layer.geom, &layer.weight, &g)
                .ok_or_else(|| AppError::model(format!("conv{} gradient shape mismatch.", i + 1)))?;
            convs.push((step.weight, step.bias));
            grad = step.input;
        }
        convs.reverse();

        Ok(BatchGradients {
            grads: Gradients {
                convs,
                fc: (fc_weight, grad_logits),
            },
            loss,
            correct: usize::from((up - f64::from(label.min(1))).abs() < 0.5),
            samples: 1,
        })
    }

    /// Summed gradients over `batch`, one sample per worker task.
    ///
    /// Only allowed in [`ModelMode::Train`].
    pub fn batch_gradients(&self, batch: &[(&Image, u8)]) -> Result<BatchGradients, AppError> {
        if self.mode != ModelMode::Train {
            return Err(AppError::model(
                "Model must be in training mode to compute gradients.",
            ));
        }
        self.run(|| {
            batch
                .par_iter()
                .map(|(image, label)| self.sample_gradients(image, *label))
                .try_reduce(|| BatchGradients::empty(self), |a, b| Ok(a.merge(b)))
        })
    }
}

fn row_major(m: &DMatrix<f32>) -> Vec<f32> {
    m.transpose().as_slice().to_vec()
}

impl Classifier for ConvNet {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn score(&self, images: &[&Image]) -> Result<Vec<ClassScores>, AppError> {
        if self.mode != ModelMode::Eval {
            return Err(AppError::model(
                "Model must be in evaluation mode before scoring.",
            ));
        }
        self.run(|| images.par_iter().map(|img| self.forward(img)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn dense_width_follows_geometry() {
        assert_eq!(dense_inputs(Architecture::Cnn5d), 128 * 8 * 15);
        assert_eq!(dense_inputs(Architecture::Cnn20d), 256 * 6 * 60);
    }

    #[test]
    fn scores_are_probabilities_in_eval_mode() {
        let mut net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 3);
        let mut a = Image::blank(32, 15);
        let mut b = Image::blank(32, 15);
        for col in 0..15 {
            a.set(col % 32, col, 255);
            b.set(31 - col, col, 255);
        }

        assert!(net.score(&[&a]).is_err());
        net.set_mode(ModelMode::Eval);
        let scores = net.score(&[&a, &b, &a]).unwrap();
        assert_eq!(scores.len(), 3);
        for s in &scores {
            assert!((s.up + s.down - 1.0).abs() < 1e-5);
            assert!(s.up_factor().is_ok());
        }
        assert_eq!(scores[0], scores[2]);
    }

    #[test]
    fn wrong_image_shape_is_model_error() {
        let mut net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 3);
        net.set_mode(ModelMode::Eval);
        let img = Image::blank(64, 60);
        let err = net.score(&[&img]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelInvocation);
    }

    #[test]
    fn checkpoint_round_trip_preserves_scores() {
        let mut net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 9);
        let ckpt = net.checkpoint();
        assert_eq!(ckpt.tensors["conv1.weight"].shape, vec![64, 1, 5, 3]);
        assert_eq!(ckpt.tensors["fc1.weight"].shape, vec![2, 15360]);

        let mut restored = ConvNet::from_checkpoint(&ckpt, Architecture::Cnn5d, Device::Cpu).unwrap();
        let mut img = Image::blank(32, 15);
        for col in 0..15 {
            img.set(10 + col % 7, col, 255);
        }
        net.set_mode(ModelMode::Eval);
        restored.set_mode(ModelMode::Eval);
        assert_eq!(net.score(&[&img]).unwrap(), restored.score(&[&img]).unwrap());
    }

    #[test]
    fn twenty_day_checkpoint_fails_for_five_day_model() {
        let ckpt = ConvNet::initialized(Architecture::Cnn20d, Device::Cpu, 1).checkpoint();
        let err = ConvNet::from_checkpoint(&ckpt, Architecture::Cnn5d, Device::Cpu).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    fn ramp_image(offset: usize) -> Image {
        let mut img = Image::blank(32, 15);
        for col in 0..15 {
            img.set((offset + 2 * col) % 32, col, 255);
            img.set((offset + 2 * col + 1) % 32, col, 255);
        }
        img
    }

    #[test]
    fn bounded_pool_scores_like_global_pool() {
        let mut global = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 4);
        let mut bounded = global.clone().with_threads(1).unwrap();
        assert_eq!(bounded.threads(), 1);
        global.set_mode(ModelMode::Eval);
        bounded.set_mode(ModelMode::Eval);
        let images = [ramp_image(0), ramp_image(5), ramp_image(9)];
        let refs: Vec<&Image> = images.iter().collect();
        assert_eq!(global.score(&refs).unwrap(), bounded.score(&refs).unwrap());
    }

    #[test]
    fn gradients_need_train_mode() {
        let mut net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 4);
        net.set_mode(ModelMode::Eval);
        let img = ramp_image(0);
        let err = net.batch_gradients(&[(&img, 1)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelInvocation);
    }

    #[test]
    fn batch_gradient_is_sum_of_sample_gradients() {
        let net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 6).with_threads(2).unwrap();
        let (a, b) = (ramp_image(0), ramp_image(7));
        let both = net.batch_gradients(&[(&a, 1), (&b, 0)]).unwrap();
        let mut sum = net.batch_gradients(&[(&a, 1)]).unwrap().grads;
        sum.accumulate(&net.batch_gradients(&[(&b, 0)]).unwrap().grads);

        assert_eq!(both.samples, 2);
        for (x, y) in both.grads.slices().iter().zip(sum.slices()) {
            assert_eq!(x.len(), y.len());
            for (p, q) in x.iter().zip(y.iter()) {
                assert!((p - q).abs() <= 1e-3 * (1.0 + q.abs()));
            }
        }
        // The fc bias gradient of one sample is `probs - onehot`, so it sums to zero.
        let single = net.batch_gradients(&[(&a, 1)]).unwrap();
        let fc_bias = single.grads.slices()[5];
        assert!((fc_bias[0] + fc_bias[1]).abs() < 1e-5);
        assert!(fc_bias[1] <= 0.0);
    }

    #[test]
    fn gradient_step_lowers_sample_loss() {
        let mut net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 11);
        let img = ramp_image(3);
        let scores = {
            let mut eval = net.clone();
            eval.set_mode(ModelMode::Eval);
            eval.score(&[&img]).unwrap()[0]
        };
        // Train toward the class the fresh network finds less likely.
        let label = u8::from(scores.up < 0.5);

        let before = net.batch_gradients(&[(&img, label)]).unwrap();
        let grads = before.grads.clone();
        let largest = grads
            .slices()
            .iter()
            .flat_map(|g| g.iter())
            .fold(0.0f32, |m, g| m.max(g.abs()));
        assert!(largest > 0.0);
        // Steepest descent with every parameter moving by at most 1e-4.
        let rate = 1e-4 / largest;
        for (param, grad) in net.parameters_mut().into_iter().zip(grads.slices()) {
            for (p, g) in param.iter_mut().zip(grad.iter()) {
                *p -= rate * g;
            }
        }
        let after = net.batch_gradients(&[(&img, label)]).unwrap();
        assert!(after.loss < before.loss, "{} !< {}", after.loss, before.loss);
    }

    #[test]
    fn relabelled_checkpoint_fails_on_tensor_shape() {
        let mut ckpt = ConvNet::initialized(Architecture::Cnn20d, Device::Cpu, 1).checkpoint();
        ckpt.architecture = "CNN5d".to_string();
        let err = ConvNet::from_checkpoint(&ckpt, Architecture::Cnn5d, Device::Cpu).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelInvocation);
    }
}
