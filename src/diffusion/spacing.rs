//! Timestep respacing.
//!
//! Picks a subset of the original timesteps so a model trained with `N`
//! steps can be sampled with fewer. The respacing string is either `"ddimK"`
//! (uniform stride yielding exactly `K` steps) or a comma separated list of
//! step counts, one per equal-sized section of the original schedule:
//!
//! ```text
//! space_timesteps(300, "10,15,20")
//!   steps   0..100 → 10 evenly strided
//!   steps 100..200 → 15 evenly strided
//!   steps 200..300 → 20 evenly strided
//! ```

use std::collections::BTreeSet;

use crate::{Error, Result};

/// Timesteps to keep from a schedule of `num_timesteps` steps.
pub fn space_timesteps(num_timesteps: usize, spec: &str) -> Result<BTreeSet<usize>> {
    let spec = spec.trim();
    if let Some(count) = spec.strip_prefix("ddim") {
        let desired: usize = count
            .parse()
            .map_err(|e| Error::Config(format!("timestep_respacing {spec:?}: {e}")))?;
        return (1..num_timesteps)
            .find(|&stride| num_timesteps.div_ceil(stride) == desired)
            .map(|stride| (0..num_timesteps).step_by(stride).collect())
            .ok_or_else(|| {
                Error::Config(format!(
                    "cannot create exactly {desired} steps with an integer stride"
                ))
            });
    }

    let section_counts = spec
        .split(',')
        .map(|c| {
            c.trim()
                .parse::<usize>()
                .map_err(|e| Error::Config(format!("timestep_respacing entry {c:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let size_per = num_timesteps / section_counts.len();
    let extra = num_timesteps % section_counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();
    for (i, &section_count) in section_counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(Error::Config(format!(
                "cannot divide section of {size} steps into {section_count}"
            )));
        }
        let frac_stride = if section_count <= 1 {
            1.0
        } else {
            (size - 1) as f64 / (section_count - 1) as f64
        };
        let mut cur_idx = 0.0_f64;
        for _ in 0..section_count {
            all_steps.insert(start_idx + cur_idx.round_ties_even() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }
    Ok(all_steps)
}

/// Resolve the configured respacing into the kept timesteps.
///
/// `None` or an empty string keeps every step.
pub fn resolve(num_timesteps: usize, respacing: Option<&str>) -> Result<BTreeSet<usize>> {
    match respacing.map(str::trim) {
        None | Some("") => Ok((0..num_timesteps).collect()),
        Some(spec) => space_timesteps(num_timesteps, spec),
    }
}
