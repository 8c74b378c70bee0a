//! Adam with L2 weight decay, matching `torch.optim.Adam` defaults.

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    steps: i32,
    first: Vec<Vec<f32>>,
    second: Vec<Vec<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            steps: 0,
            first: Vec::new(),
            second: Vec::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.steps
    }

    /// Apply one update. `params` and `grads` are matched by position and must
    /// keep the same layout between calls.
    pub fn step(&mut self, params: Vec<&mut [f32]>, grads: &[&[f32]]) -> Result<(), AppError> {
        if params.len() != grads.len() {
            return Err(AppError::model(format!(
                "Optimizer got {} parameter tensors and {} gradients.",
                params.len(),
                grads.len()
            )));
        }
        if self.first.is_empty() {
            self.first = params.iter().map(|p| vec![0.0; p.len()]).collect();
            self.second = self.first.clone();
        }
        if self.first.len() != params.len() {
            return Err(AppError::model("Optimizer parameter layout changed between steps."));
        }

        self.steps += 1;
        let bias1 = 1.0 - self.beta1.powi(self.steps);
        let bias2 = 1.0 - self.beta2.powi(self.steps);
        let step_size = self.learning_rate / bias1;

        for (i, (param, grad)) in params.into_iter().zip(grads).enumerate() {
            let (m, v) = (&mut self.first[i], &mut self.second[i]);
            if param.len() != grad.len() || param.len() != m.len() {
                return Err(AppError::model(format!(
                    "Gradient {i} has {} values for a parameter of {}.",
                    grad.len(),
                    param.len()
                )));
            }
            for k in 0..param.len() {
                let g = grad[k] + self.weight_decay * param[k];
                m[k] = self.beta1 * m[k] + (1.0 - self.beta1) * g;
                v[k] = self.beta2 * v[k] + (1.0 - self.beta2) * g * g;
                let denom = (v[k] / bias2).sqrt() + self.epsilon;
                param[k] -= step_size * m[k] / denom;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(0.01, 0.0);
        let mut w = vec![1.0f32, -2.0, 0.5];
        adam.step(vec![&mut w[..]], &[&[3.0, -0.5, 0.0][..]]).unwrap();
        assert!((w[0] - 0.99).abs() < 1e-6);
        assert!((w[1] + 1.99).abs() < 1e-6);
        assert_eq!(w[2], 0.5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimises_a_quadratic() {
        let mut adam = Adam::new(0.1, 0.0);
        let mut w = vec![0.0f32];
        for _ in 0..500 {
            let g = 2.0 * (w[0] - 3.0);
            adam.step(vec![&mut w[..]], &[&[g][..]]).unwrap();
        }
        assert!((w[0] - 3.0).abs() < 0.05);
    }

    #[test]
    fn weight_decay_shrinks_without_gradient() {
        let mut adam = Adam::new(0.01, 0.1);
        let mut w = vec![2.0f32];
        adam.step(vec![&mut w[..]], &[&[0.0][..]]).unwrap();
        assert!(w[0] < 2.0);
    }

    #[test]
    fn mismatched_layout_is_model_error() {
        let mut adam = Adam::new(0.01, 0.0);
        let mut w = vec![0.0f32; 2];
        let err = adam.step(vec![&mut w[..]], &[&[1.0][..]]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelInvocation);
    }
}
