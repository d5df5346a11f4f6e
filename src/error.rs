//! Error types for diffpure-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Timestep outside the diffusion schedule.
    #[error("timestep {timestep} out of range for a {num_timesteps}-step schedule")]
    Timestep {
        timestep: usize,
        num_timesteps: usize,
    },

    /// Backpropagation produced no gradient for the guided input.
    ///
    /// Means the input was never tracked (gradient context disabled or the
    /// graph was detached); this is an internal invariant violation.
    #[error("no gradient produced for the guided input")]
    MissingGradient,

    /// Image encode/decode error.
    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
