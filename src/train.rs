use crate::{
    checkpoint::CheckpointManagerInit,
    common::*,
    config,
    message::{DataMessage, LogMessage, PairBatch},
    model::{
        cutmix_masks, sample_noise, DiscriminatorInit, DiscriminatorLoss, DiscriminatorOutput,
        GeneratorInit, GeneratorLoss, NowcastDiscriminator, NowcastGenerator, SpectralNorm,
        UNET_DEPTH,
    },
    optim::{Adam, AdamInit},
    render,
};

const GENERATOR_PREFIX: &str = "generator/";
const DISCRIMINATOR_PREFIX: &str = "discriminator/";
const GENERATOR_SN_PREFIX: &str = "generator_sn/";
const DISCRIMINATOR_SN_PREFIX: &str = "discriminator_sn/";
const GENERATOR_OPT_PREFIX: &str = "generator_opt/";
const DISCRIMINATOR_OPT_PREFIX: &str = "discriminator_opt/";
const EPOCH_KEY: &str = "state/epoch";
const STEP_KEY: &str = "state/step";

pub fn generator_init(
    model: &config::Model,
    (height, width): (i64, i64),
    weather_features: i64,
) -> GeneratorInit<UNET_DEPTH> {
    let network = &model.generator;

    GeneratorInit {
        height: height as usize,
        width: width as usize,
        weather_features: weather_features as usize,
        noise_dim: model.noise_dim,
        noise_channels: model.noise_channels,
        pre_channels: network.pre_channels.get(),
        down_channels: network.down_channels(),
        up_channels: network.up_channels(),
        post_channels: network.post_channels.get(),
        attention: network.attention.clone(),
    }
}

pub fn discriminator_init(
    model: &config::Model,
    (height, width): (i64, i64),
    weather_features: i64,
) -> DiscriminatorInit<UNET_DEPTH> {
    let network = &model.discriminator;

    DiscriminatorInit {
        height: height as usize,
        width: width as usize,
        weather_features: weather_features as usize,
        pre_channels: network.pre_channels.get(),
        down_channels: network.down_channels(),
        up_channels: network.up_channels(),
        post_channels: network.post_channels.get(),
        attention: network.attention.clone(),
    }
}

#[derive(Debug, Clone)]
pub struct GanInit<'a> {
    pub model: &'a config::Model,
    /// `(height, width)` of the images.
    pub image_size: (i64, i64),
    pub weather_features: i64,
    pub device: Device,
}

impl<'a> GanInit<'a> {
    pub fn build(self) -> Result<Gan> {
        let Self {
            model,
            image_size,
            weather_features,
            device,
        } = self;

        let generator_vs = nn::VarStore::new(device);
        let generator =
            generator_init(model, image_size, weather_features).build(generator_vs.root())?;
        let generator_sn = SpectralNorm::new(&generator)?;

        let discriminator_vs = nn::VarStore::new(device);
        let discriminator = discriminator_init(model, image_size, weather_features)
            .build(discriminator_vs.root())?;
        let discriminator_sn = SpectralNorm::new(&discriminator)?;

        Ok(Gan {
            generator_vs,
            discriminator_vs,
            generator,
            discriminator,
            generator_sn,
            discriminator_sn,
        })
    }
}

/// Both networks with their parameter stores and singular vector state.
#[derive(Debug)]
pub struct Gan {
    pub generator_vs: nn::VarStore,
    pub discriminator_vs: nn::VarStore,
    pub generator: NowcastGenerator,
    pub discriminator: NowcastDiscriminator,
    pub generator_sn: SpectralNorm,
    pub discriminator_sn: SpectralNorm,
}

impl Gan {
    pub fn device(&self) -> Device {
        self.generator_vs.device()
    }

    /// Trainable parameter counts of the generator and the discriminator.
    pub fn num_parameters(&self) -> (i64, i64) {
        let count = |vs: &nn::VarStore| -> i64 {
            vs.trainable_variables()
                .iter()
                .map(|var| var.size().iter().product::<i64>())
                .sum()
        };
        (count(&self.generator_vs), count(&self.discriminator_vs))
    }
}

/// Counters and optimizer state carried through training and checkpoints.
#[derive(Debug)]
pub struct TrainingState {
    pub epoch: i64,
    pub step: i64,
    pub generator_opt: Adam,
    pub discriminator_opt: Adam,
}

impl TrainingState {
    pub fn new(gan: &Gan, train: &config::Training) -> Result<Self> {
        let adam_init = |opt: &config::Optimizer| AdamInit {
            lr: opt.lr.raw(),
            beta1: opt.beta1.raw(),
            beta2: opt.beta2.raw(),
            eps: opt.eps.raw(),
        };

        Ok(Self {
            epoch: 1,
            step: 1,
            generator_opt: adam_init(&train.generator_optimizer).build(&gan.generator_vs)?,
            discriminator_opt: adam_init(&train.discriminator_optimizer)
                .build(&gan.discriminator_vs)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepLosses {
    pub gen_fake_loss: f64,
    pub gen_similarity_loss: f64,
    pub gen_loss: f64,
    pub disc_real_loss: f64,
    pub disc_fake_loss: f64,
    pub disc_mixed_loss: f64,
    pub disc_loss: f64,
}

impl StepLosses {
    pub fn scalars(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("gen_fake_loss", self.gen_fake_loss),
            ("gen_similarity_loss", self.gen_similarity_loss),
            ("gen_loss", self.gen_loss),
            ("disc_real_loss", self.disc_real_loss),
            ("disc_fake_loss", self.disc_fake_loss),
            ("disc_mixed_loss", self.disc_mixed_loss),
            ("disc_loss", self.disc_loss),
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.scalars().iter().all(|(_, value)| value.is_finite())
    }
}

/// Runs one adversarial update of both networks on a batch that already
/// lives on the training device. Fails without touching the weights when
/// any loss is not finite.
pub fn train_step<R>(
    gan: &mut Gan,
    state: &mut TrainingState,
    batch: &PairBatch,
    noise_stddev: f64,
    rng: &mut R,
) -> Result<StepLosses>
where
    R: Rng + ?Sized,
{
    let Gan {
        ref generator,
        ref discriminator,
        ref mut generator_sn,
        ref mut discriminator_sn,
        ..
    } = *gan;
    let PairBatch {
        ref image_a,
        ref image_b,
        ..
    } = *batch;
    let device = image_a.device();
    let weather = batch.weather();
    let (bsize, _c, height, width) = image_b.size4()?;
    let noise_dim = generator.noise_dim();

    let noise1 = sample_noise(bsize, noise_dim, noise_stddev, device);
    let noise2 = sample_noise(bsize, noise_dim, noise_stddev, device);
    let generated1 = generator.forward_t(image_a, &weather, &noise1, true)?;
    let generated2 = generator.forward_t(image_a, &weather, &noise2, true)?;

    let mask = cutmix_masks([bsize, 1, height, width], rng)?.to_device(device);
    let inverse_mask = mask.ones_like() - &mask;
    let mixed = &mask * image_b + &inverse_mask * &generated1;

    let real = discriminator.forward_t(image_a, &weather, image_b, true)?;
    let fake = discriminator.forward_t(image_a, &weather, &generated1, true)?;
    let DiscriminatorOutput {
        pixel: mixed_pixel, ..
    } = discriminator.forward_t(image_a, &weather, &mixed, true)?;

    let gen_loss = GeneratorLoss::new(&fake, &generated1, &generated2);
    let disc_loss = DiscriminatorLoss::new(&real, &fake, &mixed_pixel, &mask)?;
    let losses = StepLosses {
        gen_fake_loss: f64::from(&gen_loss.fake_loss),
        gen_similarity_loss: f64::from(&gen_loss.similarity_loss),
        gen_loss: f64::from(&gen_loss.total_loss),
        disc_real_loss: f64::from(&disc_loss.real_loss),
        disc_fake_loss: f64::from(&disc_loss.fake_loss),
        disc_mixed_loss: f64::from(&disc_loss.mixed_loss),
        disc_loss: f64::from(&disc_loss.total_loss),
    };
    if !losses.is_finite() {
        bail!("non-finite loss at step {}: {:?}", state.step, losses);
    }

    // both losses share the generated images, so the first pass keeps the graph
    let gen_grads = Tensor::run_backward(
        &[&gen_loss.total_loss],
        &state.generator_opt.variables(),
        true,
        false,
    );
    let disc_grads = Tensor::run_backward(
        &[&disc_loss.total_loss],
        &state.discriminator_opt.variables(),
        false,
        false,
    );

    state.generator_opt.apply_gradients(&gen_grads)?;
    state.discriminator_opt.apply_gradients(&disc_grads)?;
    generator_sn.constrain()?;
    discriminator_sn.constrain()?;
    state.step += 1;

    Ok(losses)
}

/// Renders the comparison montage of the first sample of `batch` and returns
/// the mean absolute error of the first generation over the whole batch.
pub fn visualize(
    gan: &Gan,
    batch: &PairBatch,
    noise_stddev: f64,
    path: impl AsRef<Path>,
) -> Result<f64> {
    let Gan {
        ref generator,
        ref discriminator,
        ..
    } = *gan;
    let PairBatch {
        ref image_a,
        ref image_b,
        ..
    } = *batch;

    tch::no_grad(|| {
        let device = image_a.device();
        let weather = batch.weather();
        let bsize = batch.batch_size();
        let noise_dim = generator.noise_dim();

        let generated1 = generator.forward_t(
            image_a,
            &weather,
            &sample_noise(bsize, noise_dim, noise_stddev, device),
            false,
        )?;
        let generated2 = generator.forward_t(
            image_a,
            &weather,
            &sample_noise(bsize, noise_dim, noise_stddev, device),
            false,
        )?;
        let gen_l1 = f64::from((image_b - &generated1).abs().mean(Kind::Float));

        let pixel_of = |image: &Tensor| -> Result<Tensor> {
            let DiscriminatorOutput { pixel, .. } =
                discriminator.forward_t(image_a, &weather, image, false)?;
            Ok(render::logits_to_image(&pixel.get(0)))
        };
        let real_pixel = pixel_of(image_b)?;
        let fake_pixel1 = pixel_of(&generated1)?;
        let fake_pixel2 = pixel_of(&generated2)?;

        let source = image_a.get(0);
        let top = render::hconcat(&[
            source.shallow_clone(),
            image_b.get(0),
            generated1.get(0),
            generated2.get(0),
        ])?;
        let bottom = render::hconcat(&[source.zeros_like(), real_pixel, fake_pixel1, fake_pixel2])?;
        render::write_png(&render::vconcat(&[top, bottom])?, path)?;

        Ok(gen_l1)
    })
}

/// Every tensor needed to resume training, keyed by namespaced names.
pub fn checkpoint_tensors(gan: &Gan, state: &TrainingState) -> Vec<(String, Tensor)> {
    let prefixed = |prefix: &'static str, tensors: Vec<(String, Tensor)>| {
        tensors
            .into_iter()
            .map(move |(name, tensor)| (format!("{}{}", prefix, name), tensor))
    };
    let store = |vs: &nn::VarStore| -> Vec<(String, Tensor)> {
        vs.variables()
            .into_iter()
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .collect()
    };

    prefixed(GENERATOR_PREFIX, store(&gan.generator_vs))
        .chain(prefixed(DISCRIMINATOR_PREFIX, store(&gan.discriminator_vs)))
        .chain(prefixed(GENERATOR_SN_PREFIX, gan.generator_sn.state()))
        .chain(prefixed(DISCRIMINATOR_SN_PREFIX, gan.discriminator_sn.state()))
        .chain(prefixed(GENERATOR_OPT_PREFIX, state.generator_opt.state()))
        .chain(prefixed(
            DISCRIMINATOR_OPT_PREFIX,
            state.discriminator_opt.state(),
        ))
        .chain([
            (EPOCH_KEY.to_string(), Tensor::of_slice(&[state.epoch])),
            (STEP_KEY.to_string(), Tensor::of_slice(&[state.step])),
        ])
        .collect()
}

/// Restores the state written by [checkpoint_tensors].
pub fn restore(
    gan: &mut Gan,
    state: &mut TrainingState,
    tensors: &IndexMap<String, Tensor>,
) -> Result<()> {
    load_store(&mut gan.generator_vs, tensors, GENERATOR_PREFIX)?;
    load_store(&mut gan.discriminator_vs, tensors, DISCRIMINATOR_PREFIX)?;
    gan.generator_sn
        .load_state(&strip_prefix(tensors, GENERATOR_SN_PREFIX))?;
    gan.discriminator_sn
        .load_state(&strip_prefix(tensors, DISCRIMINATOR_SN_PREFIX))?;
    state
        .generator_opt
        .load_state(&strip_prefix(tensors, GENERATOR_OPT_PREFIX))?;
    state
        .discriminator_opt
        .load_state(&strip_prefix(tensors, DISCRIMINATOR_OPT_PREFIX))?;

    let counter = |key: &str| -> Result<i64> {
        let tensor = tensors
            .get(key)
            .ok_or_else(|| format_err!("checkpoint misses '{}'", key))?;
        Ok(i64::from(tensor))
    };
    state.epoch = counter(EPOCH_KEY)?;
    state.step = counter(STEP_KEY)?;

    Ok(())
}

/// Copies the tensors under `prefix` into every variable of `vs`.
pub fn load_store(
    vs: &mut nn::VarStore,
    tensors: &IndexMap<String, Tensor>,
    prefix: &str,
) -> Result<()> {
    let device = vs.device();

    tch::no_grad(|| {
        vs.variables().into_iter().try_for_each(|(name, mut var)| {
            let key = format!("{}{}", prefix, name);
            let src = tensors
                .get(&key)
                .ok_or_else(|| format_err!("checkpoint misses '{}'", key))?;
            ensure!(
                src.size() == var.size(),
                "shape mismatch for '{}': expect {:?}, but get {:?}",
                key,
                var.size(),
                src.size()
            );
            var.copy_(&src.to_device(device));
            Ok(())
        })
    })
}

fn strip_prefix(tensors: &IndexMap<String, Tensor>, prefix: &str) -> IndexMap<String, Tensor> {
    tensors
        .iter()
        .filter_map(|(name, tensor)| {
            let name = name.strip_prefix(prefix)?;
            Some((name.to_string(), tensor.shallow_clone()))
        })
        .collect()
}

pub fn training_worker(
    config: Arc<config::Config>,
    run_dir: PathBuf,
    image_size: (i64, i64),
    weather_features: i64,
    mut train_rx: mpsc::Receiver<DataMessage>,
    log_tx: mpsc::Sender<LogMessage>,
) -> Result<()> {
    let config::Training {
        device,
        seed,
        noise_stddev,
        max_epochs,
        ..
    } = config.train;
    let config::Logging {
        print_steps,
        image_steps,
        max_to_keep,
        keep_every_n_hours,
        ..
    } = config.logging;
    let noise_stddev = noise_stddev.raw();
    let print_steps = print_steps as i64;
    let image_steps = image_steps as i64;
    let max_epochs = max_epochs.map(|epochs| epochs.get() as i64);

    let mut gan = GanInit {
        model: &config.model,
        image_size,
        weather_features,
        device,
    }
    .build()?;
    let (generator_params, discriminator_params) = gan.num_parameters();
    info!("generator has {} trainable parameters", generator_params);
    info!(
        "discriminator has {} trainable parameters",
        discriminator_params
    );

    let mut state = TrainingState::new(&gan, &config.train)?;
    let mut checkpoints = CheckpointManagerInit {
        dir: run_dir.join("checkpoints"),
        max_to_keep,
        keep_every_n_hours: keep_every_n_hours.map(|hours| hours.raw()),
    }
    .open()?;

    match checkpoints.latest().cloned() {
        Some(entry) => {
            let tensors = checkpoints.load(entry.id, device)?;
            restore(&mut gan, &mut state, &tensors)?;
            info!(
                "Restored from {} at epoch {} step {}",
                checkpoints.path_of(&entry).display(),
                state.epoch,
                state.step
            );
        }
        None => info!("Initializing from scratch."),
    }

    let exhausted = |epoch: i64| max_epochs.map(|max| epoch > max).unwrap_or(false);
    if exhausted(state.epoch) {
        info!("all {} epochs are already trained", state.epoch - 1);
        return Ok(());
    }

    // the stream shuffles with `seed`, so the noise and masks use another one
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };
    let mut epoch_start = Instant::now();

    while let Some(msg) = train_rx.blocking_recv() {
        match msg {
            DataMessage::Batch(batch) => {
                let batch = batch.to_device(device);
                let step = state.step;

                let losses = train_step(&mut gan, &mut state, &batch, noise_stddev, &mut rng)?;

                if step % print_steps == 0 {
                    info!("{} - {}", state.epoch, step);
                }

                let mut scalars = losses.scalars();

                if step % image_steps == 0 {
                    let path = run_dir
                        .join("viz")
                        .join(format!("{}-{}.png", state.epoch, step));
                    let gen_l1 = visualize(&gan, &batch, noise_stddev, &path)?;
                    scalars.push(("gen_l1", gen_l1));
                }

                if log_tx
                    .blocking_send(LogMessage::Scalars { step, scalars })
                    .is_err()
                {
                    warn!("logging worker stopped");
                    break;
                }
            }
            DataMessage::EpochEnd { num_batches } => {
                info!(
                    "epoch {} finished with {} batches in {:.2}s",
                    state.epoch,
                    num_batches,
                    epoch_start.elapsed().as_secs_f64()
                );

                state.epoch += 1;
                let entry = checkpoints.save(&checkpoint_tensors(&gan, &state))?;
                info!("saved checkpoint {}", checkpoints.path_of(&entry).display());

                if exhausted(state.epoch) {
                    info!("reached {} epochs", state.epoch - 1);
                    break;
                }
                epoch_start = Instant::now();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttentionConfig, AttentionKind};
    use approx::assert_abs_diff_eq;

    fn nz(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    fn tiny_network(kind: AttentionKind) -> config::Network {
        config::Network {
            pre_channels: nz(4),
            down_channels: [nz(4), nz(4), nz(6), nz(6), nz(8)],
            up_channels: [nz(6), nz(6), nz(4), nz(4), nz(4)],
            post_channels: nz(4),
            attention: Some(AttentionConfig {
                kind,
                num_heads: nz(2),
                reduced_channels: nz(2),
                constrained: false,
            }),
        }
    }

    fn tiny_model() -> config::Model {
        config::Model {
            noise_dim: 8,
            noise_channels: 2,
            generator: tiny_network(AttentionKind::Axial),
            discriminator: tiny_network(AttentionKind::Full),
        }
    }

    fn tiny_training() -> config::Training {
        let opt = |lr: f64| config::Optimizer {
            lr: r64(lr),
            beta1: r64(0.0),
            beta2: r64(0.9),
            eps: r64(1e-7),
        };

        config::Training {
            batch_size: nz(2),
            device: Device::Cpu,
            seed: Some(0),
            noise_stddev: r64(1.0),
            max_epochs: None,
            prefetch: 1,
            generator_optimizer: opt(5e-5),
            discriminator_optimizer: opt(1e-4),
        }
    }

    fn tiny_gan(model: &config::Model) -> Result<Gan> {
        GanInit {
            model,
            image_size: (32, 64),
            weather_features: 3,
            device: Device::Cpu,
        }
        .build()
    }

    fn synthetic_batch(bsize: i64) -> PairBatch {
        let image = || Tensor::rand(&[bsize, 3, 32, 64], FLOAT_CPU) * 2.0 - 1.0;
        PairBatch {
            image_a: image(),
            weather_a: Tensor::randn(&[bsize, 3], FLOAT_CPU),
            image_b: image(),
            weather_b: Tensor::randn(&[bsize, 3], FLOAT_CPU),
        }
    }

    fn tiny_config(log_dir: &Path, max_epochs: usize) -> config::Config {
        config::Config {
            dataset: config::Dataset {
                images_file: "images.npy".into(),
                weather_file: "weather.npy".into(),
                pairs_file: "pairs.npy".into(),
                index_file: None,
            },
            model: tiny_model(),
            train: config::Training {
                max_epochs: NonZeroUsize::new(max_epochs),
                ..tiny_training()
            },
            logging: config::Logging {
                log_dir: log_dir.to_owned(),
                run_name: None,
                print_steps: 1,
                image_steps: 2,
                max_to_keep: 2,
                keep_every_n_hours: None,
            },
            nowcast: Default::default(),
        }
    }

    /// Feeds `messages` to a training worker and returns the logged steps.
    fn run_worker(
        config: &config::Config,
        run_dir: &Path,
        messages: Vec<DataMessage>,
    ) -> Result<Vec<i64>> {
        let (train_tx, train_rx) = mpsc::channel(messages.len().max(1));
        let (log_tx, mut log_rx) = mpsc::channel(16);
        for msg in messages {
            train_tx
                .try_send(msg)
                .map_err(|_| format_err!("the data channel is full"))?;
        }
        drop(train_tx);

        training_worker(
            Arc::new(config.clone()),
            run_dir.to_owned(),
            (32, 64),
            3,
            train_rx,
            log_tx,
        )?;

        let mut steps = vec![];
        while let Ok(LogMessage::Scalars { step, .. }) = log_rx.try_recv() {
            steps.push(step);
        }
        Ok(steps)
    }

    /// The id and `(epoch, step)` counters of the latest checkpoint.
    fn latest_counters(run_dir: &Path) -> Result<Option<(u64, i64, i64)>> {
        let manager = CheckpointManagerInit {
            dir: run_dir.join("checkpoints"),
            max_to_keep: 2,
            keep_every_n_hours: None,
        }
        .open()?;
        let entry = match manager.latest() {
            Some(entry) => entry.clone(),
            None => return Ok(None),
        };
        let tensors = manager.load(entry.id, Device::Cpu)?;
        let counter = |key: &str| -> Result<i64> {
            let tensor = tensors
                .get(key)
                .ok_or_else(|| format_err!("checkpoint misses '{}'", key))?;
            Ok(i64::from(tensor))
        };
        Ok(Some((entry.id, counter(EPOCH_KEY)?, counter(STEP_KEY)?)))
    }

    fn snapshot(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
        vs.trainable_variables()
            .iter()
            .enumerate()
            .map(|(index, var)| (index.to_string(), var.detach().copy()))
            .collect()
    }

    fn max_change(vs: &nn::VarStore, before: &[(String, Tensor)]) -> f64 {
        izip!(vs.trainable_variables(), before)
            .map(|(var, (_, prev))| f64::from((&var - prev).abs().max()))
            .fold(0.0, f64::max)
    }

    fn ensure_unit_vectors(sn: &SpectralNorm) -> Result<()> {
        for (name, u) in sn.state() {
            let norm = f64::from(u.norm());
            ensure!(
                (norm - 1.0).abs() < 1e-4,
                "'{}' has norm {} after the update",
                name,
                norm
            );
        }
        Ok(())
    }

    #[test]
    fn train_step_test() -> Result<()> {
        let model = tiny_model();
        let mut gan = tiny_gan(&model)?;
        let mut state = TrainingState::new(&gan, &tiny_training())?;
        let mut rng = StdRng::seed_from_u64(1);

        let generator_before = snapshot(&gan.generator_vs);
        let discriminator_before = snapshot(&gan.discriminator_vs);

        let losses = train_step(&mut gan, &mut state, &synthetic_batch(2), 1.0, &mut rng)?;
        ensure!(losses.is_finite());
        ensure!(losses.scalars().len() == 7);
        ensure!(state.step == 2);
        ensure!(state.generator_opt.num_updates() == 1);
        ensure!(state.discriminator_opt.num_updates() == 1);

        ensure!(max_change(&gan.generator_vs, &generator_before) > 1e-7);
        ensure!(max_change(&gan.discriminator_vs, &discriminator_before) > 1e-7);

        ensure_unit_vectors(&gan.generator_sn)?;
        ensure_unit_vectors(&gan.discriminator_sn)?;

        Ok(())
    }

    #[test]
    fn checkpoint_round_trip_test() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "sky-nowcast-train-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos()
        ));
        let model = tiny_model();
        let training = tiny_training();
        let mut rng = StdRng::seed_from_u64(2);

        let mut gan = tiny_gan(&model)?;
        let mut state = TrainingState::new(&gan, &training)?;
        train_step(&mut gan, &mut state, &synthetic_batch(2), 1.0, &mut rng)?;
        state.epoch += 1;

        let mut manager = CheckpointManagerInit {
            dir: dir.clone(),
            max_to_keep: 2,
            keep_every_n_hours: None,
        }
        .open()?;
        let entry = manager.save(&checkpoint_tensors(&gan, &state))?;

        let mut restored_gan = tiny_gan(&model)?;
        let mut restored_state = TrainingState::new(&restored_gan, &training)?;
        let tensors = manager.load(entry.id, Device::Cpu)?;
        restore(&mut restored_gan, &mut restored_state, &tensors)?;

        ensure!(restored_state.epoch == 2);
        ensure!(restored_state.step == 2);
        ensure!(restored_state.generator_opt.num_updates() == 1);

        let batch = synthetic_batch(1);
        let weather = batch.weather();
        let noise = sample_noise(1, 8, 0.0, Device::Cpu);
        let expect = gan
            .generator
            .forward_t(&batch.image_a, &weather, &noise, false)?;
        let actual = restored_gan
            .generator
            .forward_t(&batch.image_a, &weather, &noise, false)?;
        ensure!(expect.equal(&actual));

        for name in gan.generator_sn.names() {
            let lhs = gan
                .generator_sn
                .u(name)
                .ok_or_else(|| format_err!("missing singular vector '{}'", name))?;
            let rhs = restored_gan
                .generator_sn
                .u(name)
                .ok_or_else(|| format_err!("missing singular vector '{}'", name))?;
            assert_abs_diff_eq!(f64::from((lhs - rhs).abs().max()), 0.0);
        }

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn visualize_test() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "sky-nowcast-viz-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos()
        ));
        let gan = tiny_gan(&tiny_model())?;
        let path = dir.join("viz").join("1-1.png");

        let gen_l1 = visualize(&gan, &synthetic_batch(2), 1.0, &path)?;
        ensure!(gen_l1.is_finite() && gen_l1 >= 0.0);

        let montage = tch::vision::image::load(&path)?;
        ensure!(montage.size() == vec![3, 64, 256]);

        // the panel under the source is blank mid-gray
        let blank = montage.narrow(1, 32, 32).narrow(2, 0, 64);
        ensure!(f64::from(blank.min()) == 127.0 && f64::from(blank.max()) == 127.0);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn non_finite_loss_test() -> Result<()> {
        let model = tiny_model();
        let mut gan = tiny_gan(&model)?;
        let mut state = TrainingState::new(&gan, &tiny_training())?;
        let mut rng = StdRng::seed_from_u64(4);
        let generator_before = snapshot(&gan.generator_vs);

        let mut batch = synthetic_batch(2);
        batch.image_a = batch.image_a.full_like(f64::NAN);
        ensure!(train_step(&mut gan, &mut state, &batch, 1.0, &mut rng).is_err());
        ensure!(state.step == 1);
        ensure!(state.generator_opt.num_updates() == 0);
        ensure!(max_change(&gan.generator_vs, &generator_before) == 0.0);

        // the worker stops before the epoch end saves anything
        let dir = std::env::temp_dir().join(format!(
            "sky-nowcast-nan-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos()
        ));
        let config = tiny_config(&dir, 1);
        let run_dir = dir.join("run");
        let mut nan_batch = synthetic_batch(2);
        nan_batch.image_b = nan_batch.image_b.full_like(f64::NAN);
        let messages = vec![
            DataMessage::Batch(nan_batch),
            DataMessage::EpochEnd { num_batches: 1 },
        ];
        ensure!(run_worker(&config, &run_dir, messages).is_err());
        ensure!(latest_counters(&run_dir)?.is_none());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn training_worker_resume_test() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "sky-nowcast-worker-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos()
        ));
        let run_dir = dir.join("run");

        // the first epoch ends after two batches and the worker stops there
        let config = tiny_config(&dir, 1);
        let steps = run_worker(
            &config,
            &run_dir,
            vec![
                DataMessage::Batch(synthetic_batch(2)),
                DataMessage::Batch(synthetic_batch(2)),
                DataMessage::EpochEnd { num_batches: 2 },
                DataMessage::Batch(synthetic_batch(2)),
            ],
        )?;
        ensure!(steps == vec![1, 2], "unexpected steps {:?}", steps);
        ensure!(latest_counters(&run_dir)? == Some((1, 2, 3)));
        ensure!(run_dir.join("viz").join("1-2.png").is_file());

        // every configured epoch is done, so nothing is consumed
        let steps = run_worker(
            &config,
            &run_dir,
            vec![DataMessage::Batch(synthetic_batch(2))],
        )?;
        ensure!(steps.is_empty(), "unexpected steps {:?}", steps);
        ensure!(latest_counters(&run_dir)? == Some((1, 2, 3)));

        // a longer run continues the saved counters
        let config = tiny_config(&dir, 2);
        let steps = run_worker(
            &config,
            &run_dir,
            vec![
                DataMessage::Batch(synthetic_batch(2)),
                DataMessage::EpochEnd { num_batches: 1 },
            ],
        )?;
        ensure!(steps == vec![3], "unexpected steps {:?}", steps);
        ensure!(latest_counters(&run_dir)? == Some((2, 3, 4)));

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn num_parameters_test() -> Result<()> {
        let gan = tiny_gan(&tiny_model())?;
        let (generator_params, discriminator_params) = gan.num_parameters();
        ensure!(generator_params > 0 && discriminator_params > 0);
        Ok(())
    }
}
