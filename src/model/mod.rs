mod attention;
mod batch_norm;
mod block;
mod conv;
mod cutmix;
mod discriminator;
mod generator;
mod loss;
mod spectral_norm;
mod unet;

pub use attention::*;
pub use batch_norm::*;
pub use block::*;
pub use conv::*;
pub use cutmix::*;
pub use discriminator::*;
pub use generator::*;
pub use loss::*;
pub use spectral_norm::*;
pub use unet::*;

/// Number of down-sampling stages of both networks.
pub const UNET_DEPTH: usize = 5;

pub type NowcastGenerator = Generator<UNET_DEPTH>;
pub type NowcastDiscriminator = Discriminator<UNET_DEPTH>;
