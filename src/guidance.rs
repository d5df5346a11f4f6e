//! Guidance gradient and the scoped gradient-tracking mode it runs under.
//!
//! Inference runs untracked. The guidance step needs exactly one gradient,
//! `∂/∂x_t Σ (x_t - x_0_t)²`, so tracking is switched on for that scope
//! only:
//!
//! ```text
//! ctx (disabled) ──enable()──▶ GradGuard ──track(x_t), track(x_0_t)──▶ loss.backward()
//!        ▲                         │
//!        └──── restored on drop ───┘   (normal return, `?` or panic)
//! ```

use std::cell::Cell;

use candle_core::{Tensor, Var};

use crate::{Error, Result};

/// Per-owner gradient mode. Disabled by default.
#[derive(Debug, Default)]
pub struct GradContext {
    enabled: Cell<bool>,
}

impl GradContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Enable tracking until the returned guard is dropped; the mode that
    /// was active before is restored then.
    #[must_use = "tracking is disabled again as soon as the guard is dropped"]
    pub fn enable(&self) -> GradGuard<'_> {
        let prev = self.enabled.replace(true);
        GradGuard { ctx: self, prev }
    }

    /// Run `f` with tracking enabled.
    pub fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.enable();
        f()
    }

    /// Detach `t` from any graph. While enabled, the result is a fresh
    /// tracked leaf with its own storage; otherwise a plain detached tensor.
    pub fn track(&self, t: &Tensor) -> Result<Tensor> {
        let detached = t.detach();
        if self.is_enabled() {
            Ok(Var::from_tensor(&detached)?.into_inner())
        } else {
            Ok(detached)
        }
    }
}

/// Restores the previous [`GradContext`] mode on drop.
#[derive(Debug)]
pub struct GradGuard<'a> {
    ctx: &'a GradContext,
    prev: bool,
}

impl Drop for GradGuard<'_> {
    fn drop(&mut self) {
        self.ctx.enabled.set(self.prev);
    }
}

/// Gradient of `Σ (x_t - x_0_t)²` with respect to `x_t`, i.e.
/// `2 (x_t - x_0_t)`, computed by backpropagation in a temporary tracking
/// scope.
pub fn guidance_gradient(ctx: &GradContext, x_t: &Tensor, x_0_t: &Tensor) -> Result<Tensor> {
    ctx.scoped(|| squared_error_gradient(ctx, x_t, x_0_t))
}

/// Same as [`guidance_gradient`] but in whatever mode `ctx` is currently in.
///
/// Fails with [`Error::MissingGradient`] when `x_t` could not be tracked.
pub fn squared_error_gradient(ctx: &GradContext, x_t: &Tensor, x_0_t: &Tensor) -> Result<Tensor> {
    let a = ctx.track(x_t)?;
    let b = ctx.track(x_0_t)?;
    let loss = (&a - &b)?.sqr()?.sum_all()?;
    let grads = loss.backward()?;
    grads
        .get(&a)
        .map(Tensor::detach)
        .ok_or(Error::MissingGradient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn identical_inputs_give_zero_gradient() {
        let ctx = GradContext::new();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 4, 4), &Device::Cpu).unwrap();
        let grad = guidance_gradient(&ctx, &x, &x).unwrap();
        assert_eq!(grad.dims(), &[2, 3, 4, 4]);
        let zeros = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(max_abs_diff(&grad, &zeros), 0.0);
    }

    #[test]
    fn gradient_is_twice_the_difference() {
        let ctx = GradContext::new();
        let a = Tensor::randn(0f32, 1.0, (1, 3, 5, 5), &Device::Cpu).unwrap();
        let b = Tensor::randn(0f32, 1.0, (1, 3, 5, 5), &Device::Cpu).unwrap();
        let grad = guidance_gradient(&ctx, &a, &b).unwrap();
        let expected = ((&a - &b).unwrap() * 2.0).unwrap();
        assert!(max_abs_diff(&grad, &expected) < 1e-6);
    }

    #[test]
    fn inputs_are_not_tracked_afterwards() {
        let ctx = GradContext::new();
        let a = Tensor::ones((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let b = a.zeros_like().unwrap();
        guidance_gradient(&ctx, &a, &b).unwrap();
        assert!(!a.is_variable());
        assert!(!ctx.is_enabled());
    }

    #[test]
    fn disabled_context_has_no_gradient() {
        let ctx = GradContext::new();
        let a = Tensor::ones((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let b = a.zeros_like().unwrap();
        let err = squared_error_gradient(&ctx, &a, &b).unwrap_err();
        assert!(matches!(err, Error::MissingGradient));
    }

    #[test]
    fn guard_restores_previous_mode() {
        let ctx = GradContext::new();
        assert!(!ctx.is_enabled());
        {
            let _outer = ctx.enable();
            assert!(ctx.is_enabled());
            {
                let _inner = ctx.enable();
                assert!(ctx.is_enabled());
            }
            // Nested guard restores "enabled", not the default.
            assert!(ctx.is_enabled());
        }
        assert!(!ctx.is_enabled());
    }

    #[test]
    fn mode_restored_after_error() {
        let ctx = GradContext::new();
        let result: Result<()> = ctx.scoped(|| {
            assert!(ctx.is_enabled());
            Err(Error::MissingGradient)
        });
        assert!(result.is_err());
        assert!(!ctx.is_enabled());
    }

    #[test]
    fn mode_restored_after_panic() {
        let ctx = GradContext::new();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: () = ctx.scoped(|| panic!("inside the tracking scope"));
        }));
        assert!(outcome.is_err());
        assert!(!ctx.is_enabled());
    }
}
