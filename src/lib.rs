pub mod checkpoint;
pub mod common;
pub mod config;
pub mod dataset;
pub mod index;
pub mod logging;
pub mod message;
pub mod model;
pub mod nowcast;
pub mod optim;
pub mod render;
pub mod train;
pub mod training_stream;

pub(crate) const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

use crate::{
    common::*,
    dataset::{PairDataset, PairDatasetInit},
    index::ObservationIndex,
    nowcast::{Nowcaster, NowcasterInit},
    training_stream::TrainingStreamInit,
};

/// The directory of a new run: `run_name` under `log_dir`, or the start time
/// when no name is configured.
pub fn new_run_dir(logging: &config::Logging) -> PathBuf {
    let name = match &logging.run_name {
        Some(name) => name.clone(),
        None => format!("{}", Local::now().format(FILE_STRFTIME)),
    };
    logging.log_dir.join(name)
}

/// Trains in `run_dir`, resuming from its latest checkpoint if any.
pub async fn start(config: config::Config, run_dir: Option<PathBuf>) -> Result<()> {
    let config = Arc::new(config);
    let run_dir = run_dir.unwrap_or_else(|| new_run_dir(&config.logging));
    tokio::fs::create_dir_all(&run_dir).await?;
    info!("run directory {}", run_dir.display());

    // keep the configuration next to the outputs
    tokio::fs::write(
        run_dir.join("config.json"),
        serde_json::to_string_pretty(&*config)?,
    )
    .await?;

    let dataset = load_dataset(config.clone()).await?;
    let image_size = dataset.image_size();
    let weather_features = dataset.num_weather_features();

    let stream = TrainingStreamInit {
        batch_size: config.train.batch_size.get(),
        seed: config.train.seed,
    }
    .build(dataset)?;

    let (train_tx, train_rx) = mpsc::channel(config.train.prefetch);
    let (log_tx, log_rx) = mpsc::channel(16);

    // data stream to channel worker
    let data_fut = tokio::task::spawn_blocking(move || stream.run(train_tx))
        .map(|result| Fallible::Ok(result??));

    // training worker
    let train_fut = {
        let config = config.clone();
        let run_dir = run_dir.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            train::training_worker(
                config,
                run_dir,
                image_size,
                weather_features,
                train_rx,
                log_tx,
            )
        })
        .map(|result| Fallible::Ok(result??))
    };

    let log_fut = tokio::task::spawn(logging::logging_worker(run_dir, log_rx))
        .map(|result| Fallible::Ok(result??));

    // run all tasks
    futures::try_join!(data_fut, train_fut, log_fut)?;

    Ok(())
}

/// Writes nowcast montages of checkpoint `checkpoint` (the latest when
/// absent) under `run_dir`.
pub async fn nowcast(
    config: config::Config,
    run_dir: PathBuf,
    checkpoint: Option<u64>,
) -> Result<()> {
    let config = Arc::new(config);
    let dataset = load_dataset(config.clone()).await?;
    let index = load_index(config.clone()).await?;

    tokio::task::spawn_blocking(move || -> Result<()> {
        let (nowcaster, id) = load_nowcaster(&config, &dataset, &run_dir, checkpoint)?;
        let output_dir = run_dir.join(format!("nowcast-chkpt={}", id));
        nowcast::nowcast_montages(&nowcaster, &dataset, &index, &config.nowcast, &output_dir)?;
        Ok(())
    })
    .await??;

    Ok(())
}

/// Writes shuffled pairs of generated and observed images of checkpoint
/// `checkpoint` (the latest when absent) under `run_dir`.
pub async fn realism(
    config: config::Config,
    run_dir: PathBuf,
    checkpoint: Option<u64>,
) -> Result<()> {
    let config = Arc::new(config);
    let dataset = load_dataset(config.clone()).await?;
    let index = load_index(config.clone()).await?;

    tokio::task::spawn_blocking(move || -> Result<()> {
        let (nowcaster, id) = load_nowcaster(&config, &dataset, &run_dir, checkpoint)?;
        let output_dir = run_dir.join(format!("realism-chkpt={}", id));
        let mut rng = match config.train.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        nowcast::realism_pairs(
            &nowcaster,
            &dataset,
            &index,
            &config.nowcast,
            &output_dir,
            &mut rng,
        )?;
        Ok(())
    })
    .await??;

    Ok(())
}

async fn load_dataset(config: Arc<config::Config>) -> Result<PairDataset> {
    tokio::task::spawn_blocking(move || {
        let config::Dataset {
            ref images_file,
            ref weather_file,
            ref pairs_file,
            ..
        } = config.dataset;

        PairDatasetInit {
            images_file,
            weather_file,
            pairs_file,
        }
        .load()
    })
    .await?
}

async fn load_index(config: Arc<config::Config>) -> Result<ObservationIndex> {
    tokio::task::spawn_blocking(move || {
        let index_file = config
            .dataset
            .index_file
            .as_ref()
            .ok_or_else(|| format_err!("dataset.index_file is required to look up lead times"))?;
        ObservationIndex::load(index_file)
    })
    .await?
}

fn load_nowcaster(
    config: &config::Config,
    dataset: &PairDataset,
    run_dir: &Path,
    checkpoint: Option<u64>,
) -> Result<(Nowcaster, u64)> {
    let (nowcaster, entry) = NowcasterInit {
        model: &config.model,
        image_size: dataset.image_size(),
        weather_features: dataset.num_weather_features(),
        device: config.train.device,
    }
    .load(run_dir.join("checkpoints"), checkpoint)?;
    Ok((nowcaster, entry.id))
}
