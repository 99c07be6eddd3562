use crate::common::*;

/// A batch of (source, target) observation pairs.
#[derive(Debug, TensorLike)]
pub struct PairBatch {
    /// `[B, 3, H, W]` source images in `[-1, 1]`.
    pub image_a: Tensor,
    /// `[B, F]` source weather.
    pub weather_a: Tensor,
    /// `[B, 3, H, W]` target images in `[-1, 1]`.
    pub image_b: Tensor,
    /// `[B, F]` target weather.
    pub weather_b: Tensor,
}

impl PairBatch {
    pub fn batch_size(&self) -> i64 {
        self.image_a.size()[0]
    }

    /// The `[B, 2F]` conditioning vector of both times.
    pub fn weather(&self) -> Tensor {
        Tensor::cat(&[&self.weather_a, &self.weather_b], 1)
    }
}

#[derive(Debug)]
pub enum DataMessage {
    Batch(PairBatch),
    /// Every pair was delivered once since the previous epoch end.
    EpochEnd { num_batches: usize },
}

#[derive(Debug)]
pub enum LogMessage {
    Scalars {
        step: i64,
        scalars: Vec<(&'static str, f64)>,
    },
}
