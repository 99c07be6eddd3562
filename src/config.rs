use crate::{common::*, model::AttentionConfig, model::UNET_DEPTH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: Dataset,
    pub model: Model,
    pub train: Training,
    pub logging: Logging,
    #[serde(default)]
    pub nowcast: Nowcast,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let Self {
            model,
            train,
            logging,
            ..
        } = self;

        ensure!(model.noise_dim > 0, "model.noise_dim must be positive");
        ensure!(model.noise_channels > 0, "model.noise_channels must be positive");
        ensure!(train.prefetch > 0, "train.prefetch must be positive");
        ensure!(logging.print_steps > 0, "logging.print_steps must be positive");
        ensure!(logging.image_steps > 0, "logging.image_steps must be positive");
        ensure!(logging.max_to_keep > 0, "logging.max_to_keep must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub images_file: PathBuf,
    pub weather_file: PathBuf,
    pub pairs_file: PathBuf,
    /// CSV index of the observations, needed by the nowcast commands.
    pub index_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    #[serde(default = "default_noise_dim")]
    pub noise_dim: usize,
    #[serde(default = "default_noise_channels")]
    pub noise_channels: usize,
    pub generator: Network,
    pub discriminator: Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub pre_channels: NonZeroUsize,
    pub down_channels: [NonZeroUsize; UNET_DEPTH],
    pub up_channels: [NonZeroUsize; UNET_DEPTH],
    pub post_channels: NonZeroUsize,
    pub attention: Option<AttentionConfig>,
}

impl Network {
    pub fn down_channels(&self) -> [usize; UNET_DEPTH] {
        self.down_channels.map(NonZeroUsize::get)
    }

    pub fn up_channels(&self) -> [usize; UNET_DEPTH] {
        self.up_channels.map(NonZeroUsize::get)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Training {
    pub batch_size: NonZeroUsize,
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    pub seed: Option<u64>,
    #[serde(default = "default_noise_stddev")]
    pub noise_stddev: R64,
    pub max_epochs: Option<NonZeroUsize>,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_generator_optimizer")]
    pub generator_optimizer: Optimizer,
    #[serde(default = "default_discriminator_optimizer")]
    pub discriminator_optimizer: Optimizer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Optimizer {
    pub lr: R64,
    #[serde(default = "default_beta1")]
    pub beta1: R64,
    #[serde(default = "default_beta2")]
    pub beta2: R64,
    #[serde(default = "default_adam_eps")]
    pub eps: R64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub log_dir: PathBuf,
    /// Names the run directory. A start timestamp is used when absent.
    pub run_name: Option<String>,
    #[serde(default = "default_print_steps")]
    pub print_steps: usize,
    #[serde(default = "default_image_steps")]
    pub image_steps: usize,
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
    #[serde(default = "default_keep_every_n_hours")]
    pub keep_every_n_hours: Option<R64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Nowcast {
    /// Lead times in minutes.
    pub lead_times: Vec<i64>,
    /// Hours of day whose minute-0 observations are used as sources.
    pub hours: Vec<u32>,
    /// One row of generations per standard deviation.
    pub noise_stddevs: Vec<R64>,
    pub realism_samples: usize,
    /// Exclusive upper bound of sampled lead times in minutes.
    pub realism_max_lead: i64,
    /// Inclusive range of hours used as realism sources.
    pub realism_hours: [u32; 2],
    pub min_year: i32,
}

impl Default for Nowcast {
    fn default() -> Self {
        Self {
            lead_times: vec![0, 60, 120, 180, 240, 300, 360],
            hours: vec![6, 10, 14],
            noise_stddevs: [0.0, 0.1, 0.2, 0.5, 1.0].into_iter().map(r64).collect(),
            realism_samples: 75,
            realism_max_lead: 360,
            realism_hours: [6, 14],
            min_year: 2020,
        }
    }
}

fn default_noise_dim() -> usize {
    100
}

fn default_noise_channels() -> usize {
    128
}

fn default_noise_stddev() -> R64 {
    r64(1.0)
}

fn default_prefetch() -> usize {
    2
}

fn default_beta1() -> R64 {
    r64(0.0)
}

fn default_beta2() -> R64 {
    r64(0.9)
}

fn default_adam_eps() -> R64 {
    r64(1e-7)
}

fn default_generator_optimizer() -> Optimizer {
    Optimizer {
        lr: r64(5e-5),
        beta1: default_beta1(),
        beta2: default_beta2(),
        eps: default_adam_eps(),
    }
}

fn default_discriminator_optimizer() -> Optimizer {
    Optimizer {
        lr: r64(1e-4),
        ..default_generator_optimizer()
    }
}

fn default_print_steps() -> usize {
    10
}

fn default_image_steps() -> usize {
    100
}

fn default_max_to_keep() -> usize {
    2
}

fn default_keep_every_n_hours() -> Option<R64> {
    Some(r64(4.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_test() -> Result<()> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.json5");
        let config = Config::load(&path)?;
        ensure!(config.model.generator.down_channels().len() == UNET_DEPTH);
        ensure!(config.train.generator_optimizer.lr > 0.0);
        Ok(())
    }

    #[test]
    fn config_defaults_test() -> Result<()> {
        let text = r#"{
            dataset: {
                images_file: "images.npy",
                weather_file: "weather.npy",
                pairs_file: "pairs.npy",
            },
            model: {
                generator: {
                    pre_channels: 8,
                    down_channels: [8, 8, 8, 8, 8],
                    up_channels: [8, 8, 8, 8, 8],
                    post_channels: 8,
                    attention: { kind: "axial", num_heads: 2, reduced_channels: 4 },
                },
                discriminator: {
                    pre_channels: 8,
                    down_channels: [8, 8, 8, 8, 8],
                    up_channels: [8, 8, 8, 8, 8],
                    post_channels: 8,
                    attention: null,
                },
            },
            train: { batch_size: 2, device: "cpu" },
            logging: { log_dir: "logs" },
        }"#;
        let config: Config = json5::from_str(text)?;
        config.validate()?;

        ensure!(config.model.noise_dim == 100);
        ensure!(config.model.noise_channels == 128);
        ensure!(config.train.noise_stddev == 1.0);
        ensure!(config.train.max_epochs.is_none());
        ensure!(config.train.generator_optimizer.lr == 5e-5);
        ensure!(config.train.discriminator_optimizer.lr == 1e-4);
        ensure!(config.train.discriminator_optimizer.beta2 == 0.9);
        ensure!(config.logging.print_steps == 10);
        ensure!(config.logging.max_to_keep == 2);
        ensure!(config.logging.keep_every_n_hours == Some(r64(4.0)));
        ensure!(config.nowcast.realism_max_lead == 360);
        ensure!(config.model.discriminator.attention.is_none());

        Ok(())
    }

    #[test]
    fn partial_nowcast_test() -> Result<()> {
        let nowcast: Nowcast = json5::from_str("{ hours: [8], min_year: 2021 }")?;
        ensure!(nowcast.hours == vec![8]);
        ensure!(nowcast.min_year == 2021);
        ensure!(nowcast.lead_times == Nowcast::default().lead_times);
        ensure!(nowcast.realism_samples == 75);
        ensure!(nowcast.realism_hours == [6, 14]);
        Ok(())
    }
}
