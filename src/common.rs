pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDateTime, Timelike, Utc,
};
pub use futures::FutureExt;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fs, iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
pub use tch::{kind::FLOAT_CPU, nn, Device, Kind, Reduction, Tensor};
pub use tch_tensor_like::TensorLike;
pub use tokio::sync::mpsc;
pub use tracing::{debug, info, warn};

pub type Fallible<T> = Result<T>;
