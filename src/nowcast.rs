use crate::{
    checkpoint::{CheckpointEntry, CheckpointManagerInit},
    common::*,
    config,
    dataset::PairDataset,
    index::{IndexRecord, ObservationIndex},
    model::{sample_noise, NowcastGenerator},
    render,
    train::{generator_init, load_store},
};

/// Lead times of realism pairs are multiples of this many minutes.
const REALISM_LEAD_STEP: i64 = 10;

#[derive(Debug, Clone)]
pub struct NowcasterInit<'a> {
    pub model: &'a config::Model,
    pub image_size: (i64, i64),
    pub weather_features: i64,
    pub device: Device,
}

impl<'a> NowcasterInit<'a> {
    /// Builds a generator with fresh weights.
    pub fn build(self) -> Result<Nowcaster> {
        let Self {
            model,
            image_size,
            weather_features,
            device,
        } = self;

        let vs = nn::VarStore::new(device);
        let generator = generator_init(model, image_size, weather_features).build(vs.root())?;

        Ok(Nowcaster { vs, generator })
    }

    /// Builds the generator and loads its weights from checkpoint `id` of
    /// `checkpoint_dir`, or the latest one when `id` is absent.
    pub fn load(
        self,
        checkpoint_dir: impl AsRef<Path>,
        id: Option<u64>,
    ) -> Result<(Nowcaster, CheckpointEntry)> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        ensure!(
            checkpoint_dir.is_dir(),
            "no checkpoint directory at {}",
            checkpoint_dir.display()
        );
        let device = self.device;
        let mut nowcaster = self.build()?;

        let manager = CheckpointManagerInit {
            dir: checkpoint_dir.to_owned(),
            max_to_keep: 1,
            keep_every_n_hours: None,
        }
        .open()?;
        let entry = match id {
            Some(id) => manager
                .entries()
                .find(|entry| entry.id == id)
                .cloned()
                .ok_or_else(|| format_err!("checkpoint {} does not exist", id))?,
            None => manager.latest().cloned().ok_or_else(|| {
                format_err!("no checkpoint found in {}", checkpoint_dir.display())
            })?,
        };

        let tensors = manager.load(entry.id, device)?;
        load_store(&mut nowcaster.vs, &tensors, "generator/")?;
        info!("loaded generator from {}", manager.path_of(&entry).display());

        Ok((nowcaster, entry))
    }
}

/// Inference wrapper around a trained generator.
#[derive(Debug)]
pub struct Nowcaster {
    vs: nn::VarStore,
    generator: NowcastGenerator,
}

impl Nowcaster {
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn noise_dim(&self) -> i64 {
        self.generator.noise_dim()
    }

    /// Predicts `[B, 3, H, W]` images from `[B, 3, H, W]` source images, the
    /// `[B, 2F]` weather of both times and `[B, noise_dim]` noise.
    pub fn generate(&self, image: &Tensor, weather: &Tensor, noise: &Tensor) -> Result<Tensor> {
        let device = self.device();
        tch::no_grad(|| {
            self.generator.forward_t(
                &image.to_device(device),
                &weather.to_device(device),
                &noise.to_device(device),
                false,
            )
        })
    }

    /// Predicts the `[3, H, W]` image at `target` from the image at `source`.
    pub fn generate_pair(
        &self,
        dataset: &PairDataset,
        source: &IndexRecord,
        target: &IndexRecord,
        noise_stddev: f64,
    ) -> Result<Tensor> {
        let num_rows = dataset.num_rows();
        ensure!(
            (0..num_rows).contains(&source.row) && (0..num_rows).contains(&target.row),
            "rows {} and {} must be within 0..{}",
            source.row,
            target.row,
            num_rows
        );

        let image = dataset.image(source.row).unsqueeze(0);
        let weather = Tensor::cat(
            &[dataset.weather(source.row), dataset.weather(target.row)],
            0,
        )
        .unsqueeze(0);
        let noise = sample_noise(1, self.noise_dim(), noise_stddev, self.device());

        Ok(self.generate(&image, &weather, &noise)?.get(0))
    }
}

fn is_nowcast_observation(record: &IndexRecord, config: &config::Nowcast) -> bool {
    record.reference.year() >= config.min_year
}

/// Whether the record is a minute-0 observation at one of the nowcast hours.
fn is_nowcast_source(record: &IndexRecord, config: &config::Nowcast) -> bool {
    let reference = record.reference;
    is_nowcast_observation(record, config)
        && reference.minute() == 0
        && config.hours.contains(&reference.hour())
}

fn is_realism_observation(record: &IndexRecord, config: &config::Nowcast) -> bool {
    let [first_hour, last_hour] = config.realism_hours;
    is_nowcast_observation(record, config)
        && (first_hour..=last_hour).contains(&record.reference.hour())
}

/// Writes one montage per source observation. Each column is a lead time;
/// the first row holds the observed targets and every further row the
/// generations at one noise level. Returns the number of written montages.
pub fn nowcast_montages(
    nowcaster: &Nowcaster,
    dataset: &PairDataset,
    index: &ObservationIndex,
    config: &config::Nowcast,
    output_dir: impl AsRef<Path>,
) -> Result<usize> {
    let output_dir = output_dir.as_ref();
    ensure!(!config.lead_times.is_empty(), "no lead times configured");
    ensure!(!config.noise_stddevs.is_empty(), "no noise levels configured");
    fs::create_dir_all(output_dir)?;

    let index = index
        .clone()
        .filter(|record| is_nowcast_observation(record, config))?;
    let mut num_written = 0;

    for source in index
        .records()
        .iter()
        .filter(|record| is_nowcast_source(record, config))
    {
        let mut columns = vec![];

        for &lead_time in &config.lead_times {
            let target = match index.at_lead_time(source, lead_time)? {
                Some(target) => target,
                None => {
                    debug!("{} has no target {} minutes ahead", source.name(), lead_time);
                    break;
                }
            };

            let generated: Vec<Tensor> = config
                .noise_stddevs
                .iter()
                .map(|stddev| nowcaster.generate_pair(dataset, source, target, stddev.raw()))
                .try_collect()?;
            let column: Vec<Tensor> = iter::once(dataset.image(target.row).to_device(Device::Cpu))
                .chain(generated.into_iter().map(|image| image.to_device(Device::Cpu)))
                .collect();
            columns.push(render::vconcat(&column)?);
        }

        if columns.is_empty() {
            continue;
        }

        let path = output_dir.join(format!("{}.png", source.name()));
        render::write_png(&render::hconcat(&columns)?, &path)?;
        num_written += 1;
    }

    info!(
        "wrote {} nowcast montages to {}",
        num_written,
        output_dir.display()
    );
    Ok(num_written)
}

/// One line of the realism answer sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealismRecord {
    pub file_name: String,
    pub generated: bool,
    pub source: String,
    pub lead_time: i64,
}

/// Samples (source, lead time) pairs and writes the generated image at zero
/// noise and the observed target under shuffled numeric names, together with
/// an `answers.csv` that tells them apart. Returns the number of pairs.
pub fn realism_pairs<R>(
    nowcaster: &Nowcaster,
    dataset: &PairDataset,
    index: &ObservationIndex,
    config: &config::Nowcast,
    output_dir: impl AsRef<Path>,
    rng: &mut R,
) -> Result<usize>
where
    R: Rng + ?Sized,
{
    let output_dir = output_dir.as_ref();
    ensure!(
        config.realism_max_lead > 0,
        "realism_max_lead must be positive"
    );

    let index = index
        .clone()
        .filter(|record| is_realism_observation(record, config))?;
    let sources: Vec<&IndexRecord> = index.records().iter().collect();
    ensure!(!sources.is_empty(), "no observation qualifies as a realism source");

    let num_leads = (config.realism_max_lead + REALISM_LEAD_STEP - 1) / REALISM_LEAD_STEP;
    let mut pairs = vec![];

    for _ in 0..config.realism_samples {
        let source = sources[rng.gen_range(0..sources.len())];
        let lead_time = rng.gen_range(0..num_leads) * REALISM_LEAD_STEP;

        let target = match index.at_lead_time(source, lead_time)? {
            Some(target) => target,
            None => {
                debug!("{} has no target {} minutes ahead", source.name(), lead_time);
                continue;
            }
        };

        let generated = nowcaster.generate_pair(dataset, source, target, 0.0)?;
        pairs.push((source, lead_time, generated, dataset.image(target.row)));
    }

    fs::create_dir_all(output_dir)?;

    let mut prefixes: Vec<usize> = (0..pairs.len() * 2).collect();
    prefixes.shuffle(rng);
    let width = prefixes.len().to_string().len();

    let mut answers = csv::Writer::from_path(output_dir.join("answers.csv"))?;

    for (pair_index, (source, lead_time, generated, observed)) in pairs.iter().enumerate() {
        let images = [(generated, true), (observed, false)];

        for (offset, (image, is_generated)) in images.into_iter().enumerate() {
            let prefix = prefixes[pair_index * 2 + offset];
            let file_name = format!("{:0width$}.png", prefix, width = width);
            render::write_png(image, output_dir.join(&file_name))?;
            answers.serialize(RealismRecord {
                file_name,
                generated: is_generated,
                source: source.name(),
                lead_time: *lead_time,
            })?;
        }
    }
    answers.flush()?;

    info!(
        "wrote {} realism pairs to {}",
        pairs.len(),
        output_dir.display()
    );
    Ok(pairs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttentionConfig, AttentionKind};

    fn nz(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    fn tiny_model() -> config::Model {
        let network = config::Network {
            pre_channels: nz(4),
            down_channels: [nz(4); 5],
            up_channels: [nz(4); 5],
            post_channels: nz(4),
            attention: Some(AttentionConfig {
                kind: AttentionKind::Row,
                num_heads: nz(1),
                reduced_channels: nz(2),
                constrained: true,
            }),
        };

        config::Model {
            noise_dim: 4,
            noise_channels: 2,
            generator: network.clone(),
            discriminator: network,
        }
    }

    /// Observations of one camera at `references`, one row each.
    fn fixture_at(references: &[&str]) -> Result<(PairDataset, ObservationIndex)> {
        let num_rows = references.len() as i64;
        let images = Tensor::rand(&[num_rows, 32, 32, 3], FLOAT_CPU) * 2.0 - 1.0;
        let weather = Tensor::randn(&[num_rows, 2], FLOAT_CPU);
        let pairs = Tensor::of_slice(&[0i64, num_rows - 1]).view([1, 2]);
        let dataset = PairDataset::new(images, weather, pairs)?;

        let records = references
            .iter()
            .zip(0..)
            .map(|(reference, row)| -> Result<_> {
                Ok(IndexRecord {
                    row,
                    identifier: "cam".into(),
                    position: "east".into(),
                    reference: NaiveDateTime::parse_from_str(reference, "%Y-%m-%d %H:%M:%S")?,
                    path: format!("images/{}.jpeg", row).into(),
                })
            })
            .try_collect()?;
        let index = ObservationIndex::new(records)?;

        Ok((dataset, index))
    }

    /// Three observations of one camera, ten minutes apart.
    fn fixture() -> Result<(PairDataset, ObservationIndex)> {
        fixture_at(&[
            "2021-07-01 09:00:00",
            "2021-07-01 09:10:00",
            "2021-07-01 09:20:00",
        ])
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "sky-nowcast-{}-{}-{}",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos()
        ))
    }

    fn nowcaster(model: &config::Model) -> Result<Nowcaster> {
        NowcasterInit {
            model,
            image_size: (32, 32),
            weather_features: 2,
            device: Device::Cpu,
        }
        .build()
    }

    #[test]
    fn generate_test() -> Result<()> {
        let model = tiny_model();
        let nowcaster = nowcaster(&model)?;
        let (dataset, index) = fixture()?;
        let records = index.records();

        let first = nowcaster.generate_pair(&dataset, &records[0], &records[1], 0.0)?;
        let second = nowcaster.generate_pair(&dataset, &records[0], &records[1], 0.0)?;
        ensure!(first.size() == vec![3, 32, 32]);
        ensure!(first.equal(&second));
        ensure!(f64::from(first.abs().max()) <= 1.0);

        Ok(())
    }

    #[test]
    fn nowcast_montages_test() -> Result<()> {
        let model = tiny_model();
        let nowcaster = nowcaster(&model)?;
        let (dataset, index) = fixture()?;
        let dir = temp_dir("montage");

        // the chain breaks at 30 minutes
        let config = config::Nowcast {
            lead_times: vec![0, 10, 30, 20],
            hours: vec![9],
            noise_stddevs: vec![r64(0.0), r64(1.0)],
            ..Default::default()
        };
        let num_written = nowcast_montages(&nowcaster, &dataset, &index, &config, &dir)?;
        ensure!(num_written == 1);

        let montage = tch::vision::image::load(dir.join("0.png"))?;
        ensure!(montage.size() == vec![3, 96, 64]);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn nowcast_target_year_test() -> Result<()> {
        let model = tiny_model();
        let nowcaster = nowcaster(&model)?;
        let (dataset, index) = fixture_at(&["2020-12-31 23:00:00", "2021-01-01 00:00:00"])?;
        let dir = temp_dir("year");

        // the target an hour earlier falls before min_year
        let config = config::Nowcast {
            lead_times: vec![0, -60],
            hours: vec![0],
            noise_stddevs: vec![r64(0.0)],
            min_year: 2021,
            ..Default::default()
        };
        let num_written = nowcast_montages(&nowcaster, &dataset, &index, &config, &dir)?;
        ensure!(num_written == 1);

        let montage = tch::vision::image::load(dir.join("1.png"))?;
        ensure!(montage.size() == vec![3, 64, 32]);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn missing_checkpoint_dir_test() -> Result<()> {
        let model = tiny_model();
        let dir = temp_dir("missing");
        let result = NowcasterInit {
            model: &model,
            image_size: (32, 32),
            weather_features: 2,
            device: Device::Cpu,
        }
        .load(dir.join("checkpoints"), None);

        ensure!(result.is_err());
        ensure!(!dir.exists());
        Ok(())
    }

    #[test]
    fn realism_target_hours_test() -> Result<()> {
        let model = tiny_model();
        let nowcaster = nowcaster(&model)?;
        let (dataset, index) = fixture_at(&["2021-07-01 09:50:00", "2021-07-01 10:00:00"])?;
        let dir = temp_dir("realism-hours");
        let mut rng = StdRng::seed_from_u64(5);

        // targets at 10 o'clock are outside the window as well
        let config = config::Nowcast {
            realism_samples: 20,
            realism_max_lead: 20,
            realism_hours: [9, 9],
            ..Default::default()
        };
        let num_pairs = realism_pairs(&nowcaster, &dataset, &index, &config, &dir, &mut rng)?;
        ensure!(num_pairs > 0);

        let answers: Vec<RealismRecord> = csv::Reader::from_path(dir.join("answers.csv"))?
            .deserialize()
            .try_collect()?;
        ensure!(answers.iter().all(|record| record.lead_time == 0));

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn realism_pairs_test() -> Result<()> {
        let model = tiny_model();
        let nowcaster = nowcaster(&model)?;
        let (dataset, index) = fixture()?;
        let dir = temp_dir("realism");
        let mut rng = StdRng::seed_from_u64(3);

        let config = config::Nowcast {
            realism_samples: 20,
            realism_max_lead: 30,
            realism_hours: [9, 9],
            ..Default::default()
        };
        let num_pairs = realism_pairs(&nowcaster, &dataset, &index, &config, &dir, &mut rng)?;
        ensure!(num_pairs > 0 && num_pairs <= 20);

        let answers: Vec<RealismRecord> = csv::Reader::from_path(dir.join("answers.csv"))?
            .deserialize()
            .try_collect()?;
        ensure!(answers.len() == num_pairs * 2);
        ensure!(answers.iter().filter(|record| record.generated).count() == num_pairs);
        ensure!(answers
            .iter()
            .all(|record| dir.join(&record.file_name).is_file()));
        ensure!(answers
            .iter()
            .map(|record| &record.file_name)
            .all_unique());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
