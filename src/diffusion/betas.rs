//! Beta schedules.
//!
//! All schedules are computed in f64; tensors are only built when a value
//! is broadcast against a sample.

use crate::config::NoiseSchedule;

/// Largest beta allowed by the cosine schedule.
pub const MAX_BETA: f64 = 0.999;

/// Betas for a named schedule over `num_steps` training timesteps.
///
/// The linear schedule is scaled so that any step count spans the same
/// noise range as the 1000-step original.
pub fn named_beta_schedule(schedule: NoiseSchedule, num_steps: usize) -> Vec<f64> {
    match schedule {
        NoiseSchedule::Linear => {
            let scale = 1000.0 / num_steps as f64;
            linspace(scale * 0.0001, scale * 0.02, num_steps)
        }
        NoiseSchedule::Cosine => betas_for_alpha_bar(
            num_steps,
            |t| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2),
            MAX_BETA,
        ),
    }
}

/// Discretize a continuous `ᾱ(t)` on `t ∈ [0, 1]` into betas.
///
/// `β_i = min(1 - ᾱ((i + 1) / N) / ᾱ(i / N), max_beta)`
pub fn betas_for_alpha_bar(
    num_steps: usize,
    alpha_bar: impl Fn(f64) -> f64,
    max_beta: f64,
) -> Vec<f64> {
    (0..num_steps)
        .map(|i| {
            let t1 = i as f64 / num_steps as f64;
            let t2 = (i + 1) as f64 / num_steps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Running product `ᾱ_t = Π_{s ≤ t} (1 - β_s)`.
pub(crate) fn alphas_cumprod(betas: &[f64]) -> Vec<f64> {
    betas
        .iter()
        .scan(1.0, |acc, b| {
            *acc *= 1.0 - b;
            Some(*acc)
        })
        .collect()
}
