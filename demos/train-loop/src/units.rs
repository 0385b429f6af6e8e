// Numeric units for the demo: a linear scorer, its evaluator and plain SGD
//
//   loader ─→ forward ─→ evaluator ─→ decision ─→ gd ─→ repeater
//
// forward:    output[r]     = W · input[r] + b
// evaluator:  err_output[r] = (softmax(output[r]) - onehot(label[r])) / size
//             minibatch_n_err, minibatch_metrics and the confusion matrix
//             accumulate over the rows of the current minibatch;
//             minibatch_mse[r] holds row r's squared error
// gd:         W -= lr * err_outputᵀ · input,  b -= lr * Σ err_output

use cadence::metrics::fold_error;
use cadence::{Binding, Buffer, InitContext, Minibatch, Result, RunContext, Unit};

fn present(binding: &Binding) -> Result<&Buffer> {
    binding
        .buffer()
        .ok_or_else(|| cadence::Error::msg("unit ran before initialize"))
}

// Forward

pub struct Forward {
    minibatch: Minibatch,
    input: Binding,
    weights: Binding,
    bias: Binding,
    output: Binding,
}

impl Forward {
    pub fn new(minibatch: Minibatch) -> Self {
        Self {
            minibatch,
            input: Binding::Absent,
            weights: Binding::Absent,
            bias: Binding::Absent,
            output: Binding::Absent,
        }
    }
}

impl Unit for Forward {
    fn name(&self) -> &str {
        "forward"
    }

    fn initialize(&mut self, ctx: &InitContext<'_>) -> Result<()> {
        let input = ctx.require("input")?;
        let weights = ctx.require("weights")?;
        let bias = ctx.require("bias")?;
        let output = ctx.require("output")?;

        let shape = weights.shape();
        let &[k, d] = shape.as_slice() else {
            return Err(cadence::Error::ShapeMismatch {
                name: weights.name(),
                expected: vec![0, 0],
                got: weights.shape(),
            });
        };
        let rows = input.shape()[0];
        if input.len() != rows * d || bias.len() != k || output.shape() != [rows, k] {
            return Err(cadence::Error::ShapeMismatch {
                name: output.name(),
                expected: vec![rows, k],
                got: output.shape(),
            });
        }
        self.input = Binding::Present(input);
        self.weights = Binding::Present(weights);
        self.bias = Binding::Present(bias);
        self.output = Binding::Present(output);
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        let size = self.minibatch.size();
        let w = present(&self.weights)?.read()?;
        let b = present(&self.bias)?.read()?;
        let x = present(&self.input)?.read()?;
        let mut out = present(&self.output)?.write()?;
        let k = b.len();
        let d = w.len() / k;

        out.fill(0.0);
        for r in 0..size {
            let row = &x[r * d..(r + 1) * d];
            for c in 0..k {
                let wc = &w[c * d..(c + 1) * d];
                out[r * k + c] = b[c] + wc.iter().zip(row).map(|(a, v)| a * v).sum::<f64>();
            }
        }
        Ok(())
    }
}

// Evaluator

pub struct Evaluator {
    minibatch: Minibatch,
    output: Binding,
    labels: Binding,
    err_output: Binding,
    n_err: Binding,
    metrics: Binding,
    confusion: Binding,
    mse: Binding,
}

impl Evaluator {
    pub fn new(minibatch: Minibatch) -> Self {
        Self {
            minibatch,
            output: Binding::Absent,
            labels: Binding::Absent,
            err_output: Binding::Absent,
            n_err: Binding::Absent,
            metrics: Binding::Absent,
            confusion: Binding::Absent,
            mse: Binding::Absent,
        }
    }
}

impl Unit for Evaluator {
    fn name(&self) -> &str {
        "evaluator"
    }

    fn initialize(&mut self, ctx: &InitContext<'_>) -> Result<()> {
        let output = ctx.require("output")?;
        let err_output = ctx.require("err_output")?;
        if err_output.shape() != output.shape() {
            return Err(cadence::Error::ShapeMismatch {
                name: err_output.name(),
                expected: output.shape(),
                got: err_output.shape(),
            });
        }
        self.output = Binding::Present(output);
        self.err_output = Binding::Present(err_output);
        self.labels = Binding::Present(ctx.require("labels")?);
        self.n_err = Binding::Present(ctx.require("minibatch_n_err")?);
        self.metrics = ctx.optional("minibatch_metrics");
        self.confusion = ctx.optional("minibatch_confusion_matrix");
        self.mse = ctx.optional("minibatch_mse");
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        let size = self.minibatch.size();
        let out = present(&self.output)?.read()?;
        let labels = present(&self.labels)?.read()?;
        let mut err = present(&self.err_output)?.write()?;
        let k = out.len() / labels.len();

        let mut metrics = self.metrics.buffer().map(Buffer::write).transpose()?;
        let mut confusion = self.confusion.buffer().map(Buffer::write).transpose()?;
        let mut mse = self.mse.buffer().map(Buffer::write).transpose()?;
        let mut wrong = 0u64;

        err.fill(0.0);
        for r in 0..size {
            let logits = &out[r * k..(r + 1) * k];
            let label = labels[r];
            if label.fract() != 0.0 || !(0.0..k as f64).contains(&label) {
                return Err(cadence::Error::msg(format!(
                    "label {label} of row {r} is outside 0..{k}"
                )));
            }
            let target = label as usize;
            let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let exp: Vec<f64> = logits.iter().map(|v| (v - max).exp()).collect();
            let sum: f64 = exp.iter().sum();

            let mut pred = 0;
            let mut sample_err = 0.0;
            for c in 0..k {
                let p = exp[c] / sum;
                if logits[c] > logits[pred] {
                    pred = c;
                }
                let delta = p - if c == target { 1.0 } else { 0.0 };
                sample_err += delta * delta;
                err[r * k + c] = delta / size as f64;
            }
            if pred != target {
                wrong += 1;
            }
            if let Some(m) = metrics.as_deref_mut() {
                fold_error(m, sample_err);
            }
            if let Some(cm) = confusion.as_deref_mut() {
                cm[target * k + pred] += 1.0;
            }
            if let Some(slot) = mse.as_deref_mut().and_then(|m| m.get_mut(r)) {
                *slot = sample_err;
            }
        }
        present(&self.n_err)?.write()?[0] += wrong as f64;
        Ok(())
    }
}

// Gradient descent

pub struct GradientDescent {
    minibatch: Minibatch,
    learning_rate: f64,
    input: Binding,
    err_output: Binding,
    weights: Binding,
    bias: Binding,
}

impl GradientDescent {
    pub fn new(minibatch: Minibatch, learning_rate: f64) -> Self {
        Self {
            minibatch,
            learning_rate,
            input: Binding::Absent,
            err_output: Binding::Absent,
            weights: Binding::Absent,
            bias: Binding::Absent,
        }
    }
}

impl Unit for GradientDescent {
    fn name(&self) -> &str {
        "gd"
    }

    fn initialize(&mut self, ctx: &InitContext<'_>) -> Result<()> {
        self.input = Binding::Present(ctx.require("input")?);
        self.err_output = Binding::Present(ctx.require("err_output")?);
        self.weights = Binding::Present(ctx.require("weights")?);
        self.bias = Binding::Present(ctx.require("bias")?);
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        let size = self.minibatch.size();
        let x = present(&self.input)?.read()?;
        let err = present(&self.err_output)?.read()?;
        let mut w = present(&self.weights)?.write()?;
        let mut b = present(&self.bias)?.write()?;
        let k = b.len();
        let d = w.len() / k;
        let lr = self.learning_rate;

        for r in 0..size {
            let row = &x[r * d..(r + 1) * d];
            for c in 0..k {
                let g = err[r * k + c];
                b[c] -= lr * g;
                for (wv, xv) in w[c * d..(c + 1) * d].iter_mut().zip(row) {
                    *wv -= lr * g * xv;
                }
            }
        }
        Ok(())
    }
}
