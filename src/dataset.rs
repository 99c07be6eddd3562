use crate::{common::*, message::PairBatch};

#[derive(Debug, Clone)]
pub struct PairDatasetInit<P1, P2, P3>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
    P3: AsRef<Path>,
{
    /// `[N, H, W, 3]` images in `[-1, 1]`.
    pub images_file: P1,
    /// `[N, F]` standardized weather features.
    pub weather_file: P2,
    /// `[P, 2]` row indices of (source, target) pairs.
    pub pairs_file: P3,
}

impl<P1, P2, P3> PairDatasetInit<P1, P2, P3>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
    P3: AsRef<Path>,
{
    pub fn load(self) -> Result<PairDataset> {
        let Self {
            images_file,
            weather_file,
            pairs_file,
        } = self;

        let read = |path: &Path| {
            Tensor::read_npy(path).with_context(|| format!("unable to read {}", path.display()))
        };
        let images = read(images_file.as_ref())?;
        let weather = read(weather_file.as_ref())?;
        let pairs = read(pairs_file.as_ref())?;

        PairDataset::new(images, weather, pairs)
    }
}

/// Observations kept in host memory, addressed by row.
#[derive(Debug)]
pub struct PairDataset {
    images: Tensor,
    weather: Tensor,
    pairs: Tensor,
}

impl PairDataset {
    /// Takes channel-last `[N, H, W, 3]` images.
    pub fn new(images: Tensor, weather: Tensor, pairs: Tensor) -> Result<Self> {
        let (num_rows, height, width, channels) = images.size4().with_context(|| {
            format!(
                "expect images of shape [N, H, W, 3], but get {:?}",
                images.size()
            )
        })?;
        ensure!(channels == 3, "expect RGB images, but get {} channels", channels);

        let (weather_rows, num_features) = weather.size2().with_context(|| {
            format!(
                "expect weather of shape [N, F], but get {:?}",
                weather.size()
            )
        })?;
        ensure!(
            weather_rows == num_rows,
            "{} images but {} weather rows",
            num_rows,
            weather_rows
        );
        ensure!(num_features > 0, "empty weather features");

        let (num_pairs, pair_len) = pairs.size2()?;
        ensure!(pair_len == 2, "expect pairs of shape [P, 2], but get {:?}", pairs.size());
        ensure!(num_pairs > 0, "empty pair list is not allowed");

        let pairs = pairs.to_kind(Kind::Int64);
        let min_row = i64::from(pairs.min());
        let max_row = i64::from(pairs.max());
        ensure!(
            min_row >= 0 && max_row < num_rows,
            "pair rows must be within 0..{}, but found {}..={}",
            num_rows,
            min_row,
            max_row
        );

        let images = images
            .to_kind(Kind::Float)
            .permute(&[0, 3, 1, 2])
            .contiguous();
        let weather = weather.to_kind(Kind::Float);

        info!(
            "loaded {} observations of {}x{} with {} weather features, {} pairs",
            num_rows, height, width, num_features, num_pairs
        );

        Ok(Self {
            images,
            weather,
            pairs,
        })
    }

    pub fn num_rows(&self) -> i64 {
        self.images.size()[0]
    }

    pub fn num_pairs(&self) -> i64 {
        self.pairs.size()[0]
    }

    /// `(height, width)` of the images.
    pub fn image_size(&self) -> (i64, i64) {
        let size = self.images.size();
        (size[2], size[3])
    }

    pub fn num_weather_features(&self) -> i64 {
        self.weather.size()[1]
    }

    /// `[3, H, W]` image at `row`.
    pub fn image(&self, row: i64) -> Tensor {
        self.images.get(row)
    }

    /// `[F]` weather at `row`.
    pub fn weather(&self, row: i64) -> Tensor {
        self.weather.get(row)
    }

    /// Gathers the given pair indices into a batch on the CPU.
    pub fn batch(&self, pair_indices: &[i64]) -> Result<PairBatch> {
        ensure!(!pair_indices.is_empty(), "empty batch is not allowed");

        let pairs = self.pairs.index_select(0, &Tensor::of_slice(pair_indices));
        let rows_a = pairs.select(1, 0);
        let rows_b = pairs.select(1, 1);

        Ok(PairBatch {
            image_a: self.images.index_select(0, &rows_a),
            weather_a: self.weather.index_select(0, &rows_a),
            image_b: self.images.index_select(0, &rows_b),
            weather_b: self.weather.index_select(0, &rows_b),
        })
    }
}
