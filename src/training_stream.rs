use crate::{
    common::*,
    dataset::PairDataset,
    message::{DataMessage, PairBatch},
};

#[derive(Debug, Clone)]
pub struct TrainingStreamInit {
    pub batch_size: usize,
    /// Shuffles differently on every run when absent.
    pub seed: Option<u64>,
}

impl TrainingStreamInit {
    pub fn build(self, dataset: PairDataset) -> Result<TrainingStream> {
        let Self { batch_size, seed } = self;
        ensure!(batch_size > 0, "batch_size must be positive");

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(TrainingStream {
            dataset,
            batch_size,
            rng,
        })
    }
}

/// Endless epochs of shuffled pair batches.
#[derive(Debug)]
pub struct TrainingStream {
    dataset: PairDataset,
    batch_size: usize,
    rng: StdRng,
}

impl TrainingStream {
    /// Batches of one reshuffled pass over every pair. The last batch may be
    /// smaller than the batch size.
    pub fn epoch(&mut self) -> impl Iterator<Item = Result<PairBatch>> + '_ {
        let mut indices: Vec<i64> = (0..self.dataset.num_pairs()).collect();
        indices.shuffle(&mut self.rng);

        let dataset = &self.dataset;
        let chunks: Vec<Vec<i64>> = indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        chunks.into_iter().map(move |chunk| dataset.batch(&chunk))
    }

    /// Feeds batches into `tx` until the receiver goes away. Must run on a
    /// blocking thread.
    pub fn run(mut self, tx: mpsc::Sender<DataMessage>) -> Result<()> {
        loop {
            let mut num_batches = 0;

            for batch in self.epoch() {
                if tx.blocking_send(DataMessage::Batch(batch?)).is_err() {
                    return Ok(());
                }
                num_batches += 1;
            }

            if tx
                .blocking_send(DataMessage::EpochEnd { num_batches })
                .is_err()
            {
                return Ok(());
            }
        }
    }
}
