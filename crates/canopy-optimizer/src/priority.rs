//! Priority heuristic: how sensitive a Gaussian-process fit of a model's
//! loss surface is to its starting length-scale.
//!
//! Each round shuffles the observed rows, fits a GP with an RBF kernel to a
//! subset of them (starting from a random length-scale), and records
//! `1 / log(l*)` for the fitted length-scale `l*`. The priority is the spread
//! of those samples. A surface that fits the same way from every start has
//! little left to teach; one whose fit swings with the start is worth more
//! samples.

use std::ops::Range;

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// Number of refits per priority computation.
pub const RESAMPLE_ROUNDS: usize = 50;

/// Below this many rows only a fraction of them is used per round.
const SMALL_SAMPLE: usize = 10;
const SUBSET_FRACTION: f64 = 0.8;

/// Range the initial length-scale is drawn from.
const INITIAL_LENGTH_SCALE: Range<f64> = 0.1..2.0;

/// Observation noise added to the kernel diagonal.
const NOISE: f64 = 1e-5;

/// Bounds on the fitted length-scale.
const LENGTH_SCALE_BOUNDS: (f64, f64) = (1e-5, 1e5);

const MAX_ITERATIONS: usize = 100;
const MAX_HALVINGS: usize = 40;
const GRADIENT_TOLERANCE: f64 = 1e-6;
const ARMIJO: f64 = 1e-4;

/// Spread of the length-scale statistic over [`RESAMPLE_ROUNDS`] refits.
///
/// Each row holds the feature values followed by the loss. Fewer than two
/// rows, rows of differing or zero length, or no round producing a finite
/// statistic, yields `0.0`.
pub fn length_scale_sensitivity<R: Rng + ?Sized>(rows: &[Vec<f64>], rng: &mut R) -> f64 {
    if rows.len() < 2 {
        debug!("Only {} usable rows, skipping priority fit", rows.len());
        return 0.0;
    }
    let width = rows[0].len();
    if width == 0 || rows.iter().any(|r| r.len() != width) {
        debug!("Rows have inconsistent widths, skipping priority fit");
        return 0.0;
    }

    let mut rows = rows.to_vec();
    let n = rows.len();
    let take = if n < SMALL_SAMPLE {
        ((n as f64 * SUBSET_FRACTION).ceil() as usize).clamp(2, n)
    } else {
        n
    };

    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut fitted = 0usize;

    for _ in 0..RESAMPLE_ROUNDS {
        rows.shuffle(rng);
        let initial = rng.gen_range(INITIAL_LENGTH_SCALE);
        let Some(theta) = fit_log_length_scale(&rows[..take], initial) else {
            continue;
        };
        let sample = 1.0 / theta;
        if sample.is_finite() {
            min = min.min(sample);
            max = max.max(sample);
            fitted += 1;
        }
    }

    if fitted == 0 {
        debug!("No GP fit succeeded over {} rows", n);
        return 0.0;
    }
    (max - min).abs()
}

/// Training data for one fit with the pairwise squared distances cached.
struct GpProblem {
    sq_dists: DMatrix<f64>,
    targets: DVector<f64>,
}

impl GpProblem {
    fn new(rows: &[Vec<f64>]) -> Self {
        let n = rows.len();
        let width = rows.first().map_or(0, |r| r.len().saturating_sub(1));
        let sq_dists = DMatrix::from_fn(n, n, |i, j| {
            rows[i][..width]
                .iter()
                .zip(&rows[j][..width])
                .map(|(a, b)| (a - b).powi(2))
                .sum()
        });
        let targets = DVector::from_iterator(n, rows.iter().map(|r| r[width]));
        Self { sq_dists, targets }
    }

    /// Log marginal likelihood and its derivative with respect to
    /// `theta = ln(length_scale)`.
    fn evaluate(&self, theta: f64) -> Option<(f64, f64)> {
        let n = self.targets.len();
        let inv_l2 = (-2.0 * theta).exp();

        let base = self.sq_dists.map(|d2| (-0.5 * d2 * inv_l2).exp());
        let mut kernel = base.clone();
        for i in 0..n {
            kernel[(i, i)] += NOISE;
        }

        let cholesky = Cholesky::<f64, Dyn>::new(kernel)?;
        let alpha = cholesky.solve(&self.targets);
        let log_det: f64 = (0..n).map(|i| cholesky.l_dirty()[(i, i)].ln()).sum();
        let lml = -0.5 * self.targets.dot(&alpha)
            - log_det
            - 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();

        let inverse = cholesky.inverse();
        let mut gradient = 0.0;
        for i in 0..n {
            for j in 0..n {
                let d_kernel = base[(i, j)] * self.sq_dists[(i, j)] * inv_l2;
                gradient += (alpha[i] * alpha[j] - inverse[(i, j)]) * d_kernel;
            }
        }

        if lml.is_finite() && gradient.is_finite() {
            Some((lml, 0.5 * gradient))
        } else {
            None
        }
    }
}

/// Maximize the log marginal likelihood over the log length-scale,
/// starting from `initial`. Returns the fitted `ln(length_scale)`.
fn fit_log_length_scale(rows: &[Vec<f64>], initial: f64) -> Option<f64> {
    let problem = GpProblem::new(rows);
    let (lo, hi) = (LENGTH_SCALE_BOUNDS.0.ln(), LENGTH_SCALE_BOUNDS.1.ln());

    let mut theta = initial.ln().clamp(lo, hi);
    let (mut lml, mut gradient) = problem.evaluate(theta)?;

    for _ in 0..MAX_ITERATIONS {
        if gradient.abs() < GRADIENT_TOLERANCE {
            break;
        }

        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let candidate = (theta + step * gradient).clamp(lo, hi);
            if (candidate - theta).abs() < f64::EPSILON {
                break;
            }
            if let Some((value, grad)) = problem.evaluate(candidate) {
                if value >= lml + ARMIJO * gradient * (candidate - theta) {
                    accepted = Some((candidate, value, grad));
                    break;
                }
            }
            step *= 0.5;
        }

        match accepted {
            Some((candidate, value, grad)) => {
                theta = candidate;
                lml = value;
                gradient = grad;
            }
            None => break,
        }
    }

    Some(theta)
}
