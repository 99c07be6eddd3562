use super::{
    attention::{AttentionConfig, BottleneckAttention},
    conv::{Conv2D, Conv2DInit, Dense, DenseInit},
    spectral_norm::{prefixed, SpectralParam, SpectralParams},
    unet::{
        broadcast_weather, check_image_size, Decoder, DecoderInit, Encoder, EncoderInit,
        EncoderOutput,
    },
};
use crate::common::*;

/// Samples a `[bsize, noise_dim]` Gaussian noise batch. A zero `stddev`
/// yields all zeros.
pub fn sample_noise(bsize: i64, noise_dim: i64, stddev: f64, device: Device) -> Tensor {
    Tensor::randn(&[bsize, noise_dim], (Kind::Float, device)) * stddev
}

#[derive(Debug, Clone)]
pub struct GeneratorInit<const DEPTH: usize> {
    pub height: usize,
    pub width: usize,
    pub weather_features: usize,
    pub noise_dim: usize,
    pub noise_channels: usize,
    pub pre_channels: usize,
    pub down_channels: [usize; DEPTH],
    pub up_channels: [usize; DEPTH],
    pub post_channels: usize,
    pub attention: Option<AttentionConfig>,
}

impl<const DEPTH: usize> GeneratorInit<DEPTH> {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Generator<DEPTH>> {
        let path = path.borrow();
        let Self {
            height,
            width,
            weather_features,
            noise_dim,
            noise_channels,
            pre_channels,
            down_channels,
            up_channels,
            post_channels,
            attention,
        } = self;

        check_image_size(height, width, DEPTH)?;
        ensure!(weather_features > 0, "weather_features must be positive");
        ensure!(
            noise_dim > 0 && noise_channels > 0,
            "noise_dim and noise_channels must be positive"
        );

        let bottleneck_h = height >> DEPTH;
        let bottleneck_w = width >> DEPTH;

        let encoder = EncoderInit {
            in_channels: 3 + weather_features * 2,
            pre_channels,
            down_channels,
        }
        .build(path / "encoder")?;

        let attention = attention
            .map(|config| config.build(path / "attention", encoder.out_channels()))
            .transpose()?;

        let noise_dense = DenseInit::default().build(
            path / "noise",
            noise_dim,
            bottleneck_h * bottleneck_w * noise_channels,
        );

        let decoder = DecoderInit {
            in_channels: encoder.out_channels() + noise_channels,
            skip_channels: encoder.skip_channels(),
            up_channels,
            post_channels,
        }
        .build(path / "decoder")?;

        let rgb_conv = Conv2DInit {
            constrained: true,
            ..Conv2DInit::new(1)
        }
        .build(path / "rgb", decoder.out_channels(), 3)?;

        Ok(Generator {
            height: height as i64,
            width: width as i64,
            weather_features: weather_features as i64,
            noise_dim: noise_dim as i64,
            noise_channels: noise_channels as i64,
            encoder,
            attention,
            noise_dense,
            decoder,
            rgb_conv,
        })
    }
}

/// Conditional U-Net that predicts the target image from a source image,
/// the weather of both times and a noise vector.
#[derive(Debug)]
pub struct Generator<const DEPTH: usize> {
    height: i64,
    width: i64,
    weather_features: i64,
    noise_dim: i64,
    noise_channels: i64,
    encoder: Encoder<DEPTH>,
    attention: Option<BottleneckAttention>,
    noise_dense: Dense,
    decoder: Decoder<DEPTH>,
    rgb_conv: Conv2D,
}

impl<const DEPTH: usize> Generator<DEPTH> {
    pub fn noise_dim(&self) -> i64 {
        self.noise_dim
    }

    /// Generates `[B, 3, H, W]` images in `[-1, 1]`.
    ///
    /// The `weather` is the `[B, 2F]` concatenation of source and target
    /// weather vectors and `noise` is `[B, noise_dim]`.
    pub fn forward_t(
        &self,
        image: &Tensor,
        weather: &Tensor,
        noise: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let Self {
            height,
            width,
            weather_features,
            noise_dim,
            noise_channels,
            ref encoder,
            ref attention,
            ref noise_dense,
            ref decoder,
            ref rgb_conv,
        } = *self;

        let (bsize, _c, _h, _w) = image.size4()?;
        ensure!(
            image.size() == vec![bsize, 3, height, width],
            "expect image shape [{}, 3, {}, {}], but get {:?}",
            bsize,
            height,
            width,
            image.size()
        );
        ensure!(
            weather.size() == vec![bsize, weather_features * 2],
            "expect weather shape [{}, {}], but get {:?}",
            bsize,
            weather_features * 2,
            weather.size()
        );
        ensure!(
            noise.size() == vec![bsize, noise_dim],
            "expect noise shape [{}, {}], but get {:?}",
            bsize,
            noise_dim,
            noise.size()
        );

        let input = Tensor::cat(&[image, &broadcast_weather(weather, height, width)?], 1);
        let EncoderOutput { bottleneck, skips } = encoder.forward_t(&input, train)?;

        let bottleneck = match attention {
            Some(attention) => attention.forward(&bottleneck)?,
            None => bottleneck,
        };

        let (_b, _c, bottleneck_h, bottleneck_w) = bottleneck.size4()?;
        let noise_map = noise_dense
            .forward(noise)
            .view([bsize, bottleneck_h, bottleneck_w, noise_channels])
            .permute(&[0, 3, 1, 2]);
        let xs = Tensor::cat(&[bottleneck, noise_map], 1);

        let xs = decoder.forward_t(&xs, &skips, train)?;
        Ok(rgb_conv.forward(&xs).tanh())
    }
}

impl<const DEPTH: usize> SpectralParams for Generator<DEPTH> {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        let Self {
            ref encoder,
            ref attention,
            ref noise_dense,
            ref decoder,
            ref rgb_conv,
            ..
        } = *self;

        prefixed("encoder", encoder.spectral_params())
            .into_iter()
            .chain(prefixed("attention", attention.spectral_params()))
            .chain(prefixed("noise", noise_dense.spectral_params()))
            .chain(prefixed("decoder", decoder.spectral_params()))
            .chain(prefixed("rgb", rgb_conv.spectral_params()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttentionKind, SpectralNorm};

    fn tiny_generator(
        path: &nn::Path,
        height: usize,
        width: usize,
        weather_features: usize,
    ) -> Result<Generator<5>> {
        GeneratorInit::<5> {
            height,
            width,
            weather_features,
            noise_dim: 8,
            noise_channels: 2,
            pre_channels: 4,
            down_channels: [4, 6, 6, 8, 8],
            up_channels: [6, 6, 4, 4, 4],
            post_channels: 4,
            attention: Some(AttentionConfig {
                kind: AttentionKind::Axial,
                num_heads: NonZeroUsize::new(2).unwrap(),
                reduced_channels: NonZeroUsize::new(2).unwrap(),
                constrained: false,
            }),
        }
        .build(path)
    }

    #[test]
    fn generator_zero_input_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = tiny_generator(&vs.root(), 64, 128, 3)?;

        let image = Tensor::zeros(&[1, 3, 64, 128], FLOAT_CPU);
        let weather = Tensor::zeros(&[1, 6], FLOAT_CPU);
        let noise = sample_noise(1, generator.noise_dim(), 0.0, Device::Cpu);

        let output = generator.forward_t(&image, &weather, &noise, false)?;
        ensure!(output.size() == vec![1, 3, 64, 128]);
        ensure!(bool::from(output.isfinite().all()));
        ensure!(f64::from(output.abs().max()) <= 1.0);

        Ok(())
    }

    #[test]
    fn generator_noise_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = tiny_generator(&vs.root(), 32, 64, 2)?;

        let image = Tensor::rand(&[2, 3, 32, 64], FLOAT_CPU) * 2.0 - 1.0;
        let weather = Tensor::randn(&[2, 4], FLOAT_CPU);

        // zero variance is deterministic
        let zeros = sample_noise(2, 8, 0.0, Device::Cpu);
        let output1 = generator.forward_t(&image, &weather, &zeros, false)?;
        let output2 = generator.forward_t(&image, &weather, &zeros, false)?;
        ensure!(output1.equal(&output2));

        // different noise gives different outputs
        let noise1 = sample_noise(2, 8, 1.0, Device::Cpu);
        let noise2 = sample_noise(2, 8, 1.0, Device::Cpu);
        let output1 = generator.forward_t(&image, &weather, &noise1, true)?;
        let output2 = generator.forward_t(&image, &weather, &noise2, true)?;
        ensure!(f64::from((&output1 - &output2).abs().max()) > 1e-6);
        ensure!(f64::from(output1.abs().max()) <= 1.0);

        Ok(())
    }

    #[test]
    fn generator_shape_error_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        // not divisible by 2^5
        ensure!(tiny_generator(&(&root / "bad"), 48, 64, 2).is_err());

        let generator = tiny_generator(&(&root / "good"), 32, 64, 2)?;
        let image = Tensor::zeros(&[1, 3, 32, 64], FLOAT_CPU);
        let noise = sample_noise(1, 8, 0.0, Device::Cpu);
        let wrong_weather = Tensor::zeros(&[1, 3], FLOAT_CPU);
        ensure!(generator
            .forward_t(&image, &wrong_weather, &noise, false)
            .is_err());

        Ok(())
    }

    #[test]
    fn generator_spectral_params_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = tiny_generator(&vs.root(), 32, 64, 2)?;
        let spectral = SpectralNorm::new(&generator)?;

        // pre + 5 down + 5 up + post + rgb
        ensure!(spectral.len() == 13);
        ensure!(spectral.names().any(|name| name == "encoder.down_1.conv.weight"));
        ensure!(spectral.names().any(|name| name == "rgb.weight"));
        Ok(())
    }
}
