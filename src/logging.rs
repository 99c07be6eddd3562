use crate::{common::*, message as msg};
use tfrecord::{EventAsyncWriter, EventWriterConfig};

pub async fn logging_worker(
    run_dir: impl AsRef<Path>,
    mut log_rx: mpsc::Receiver<msg::LogMessage>,
) -> Result<()> {
    let event_dir = run_dir.as_ref().join("events");
    tokio::fs::create_dir_all(&event_dir).await?;

    let mut event_writer = {
        let event_path_prefix = event_dir
            .join("sky-nowcast")
            .into_os_string()
            .into_string()
            .map_err(|path| format_err!("non-UTF-8 event path {:?}", path))?;

        EventAsyncWriter::from_prefix(event_path_prefix, "", EventWriterConfig::default()).await?
    };

    while let Some(msg) = log_rx.recv().await {
        match msg {
            msg::LogMessage::Scalars { step, scalars } => {
                for (name, value) in scalars {
                    event_writer
                        .write_scalar(name, step, value as f32)
                        .await?;
                }
            }
        }
    }

    debug!("logging worker finished");
    Ok(())
}
