use super::{
    attention::{AttentionConfig, BottleneckAttention},
    conv::{Conv2D, Conv2DInit},
    spectral_norm::{prefixed, SpectralParam, SpectralParams},
    unet::{
        broadcast_weather, check_image_size, Decoder, DecoderInit, Encoder, EncoderInit,
        EncoderOutput,
    },
};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct DiscriminatorInit<const DEPTH: usize> {
    pub height: usize,
    pub width: usize,
    pub weather_features: usize,
    pub pre_channels: usize,
    pub down_channels: [usize; DEPTH],
    pub up_channels: [usize; DEPTH],
    pub post_channels: usize,
    pub attention: Option<AttentionConfig>,
}

impl<const DEPTH: usize> DiscriminatorInit<DEPTH> {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Discriminator<DEPTH>> {
        let path = path.borrow();
        let Self {
            height,
            width,
            weather_features,
            pre_channels,
            down_channels,
            up_channels,
            post_channels,
            attention,
        } = self;

        check_image_size(height, width, DEPTH)?;
        ensure!(weather_features > 0, "weather_features must be positive");

        let encoder = EncoderInit {
            in_channels: 3 + weather_features * 2 + 3,
            pre_channels,
            down_channels,
        }
        .build(path / "encoder")?;

        let attention = attention
            .map(|config| config.build(path / "attention", encoder.out_channels()))
            .transpose()?;

        let logit_conv = Conv2DInit {
            constrained: true,
            ..Conv2DInit::new(1)
        };
        let global_head =
            logit_conv
                .clone()
                .build(path / "global_head", encoder.out_channels(), 1)?;

        let decoder = DecoderInit {
            in_channels: encoder.out_channels(),
            skip_channels: encoder.skip_channels(),
            up_channels,
            post_channels,
        }
        .build(path / "decoder")?;
        let pixel_head = logit_conv.build(path / "pixel_head", decoder.out_channels(), 1)?;

        Ok(Discriminator {
            height: height as i64,
            width: width as i64,
            weather_features: weather_features as i64,
            encoder,
            attention,
            global_head,
            decoder,
            pixel_head,
        })
    }
}

/// Realism logits of a discriminated image pair.
#[derive(Debug)]
pub struct DiscriminatorOutput {
    /// `[B, 1, H / 2^DEPTH, W / 2^DEPTH]`
    pub global: Tensor,
    /// `[B, 1, H, W]`
    pub pixel: Tensor,
}

#[derive(Debug)]
pub struct Discriminator<const DEPTH: usize> {
    height: i64,
    width: i64,
    weather_features: i64,
    encoder: Encoder<DEPTH>,
    attention: Option<BottleneckAttention>,
    global_head: Conv2D,
    decoder: Decoder<DEPTH>,
    pixel_head: Conv2D,
}

impl<const DEPTH: usize> Discriminator<DEPTH> {
    /// Scores `image_b` as the outcome of `image_a` under the given weather.
    pub fn forward_t(
        &self,
        image_a: &Tensor,
        weather: &Tensor,
        image_b: &Tensor,
        train: bool,
    ) -> Result<DiscriminatorOutput> {
        let Self {
            height,
            width,
            weather_features,
            ref encoder,
            ref attention,
            ref global_head,
            ref decoder,
            ref pixel_head,
        } = *self;

        let (bsize, _c, _h, _w) = image_a.size4()?;
        let image_shape = vec![bsize, 3, height, width];
        ensure!(
            image_a.size() == image_shape && image_b.size() == image_shape,
            "expect image shapes {:?}, but get {:?} and {:?}",
            image_shape,
            image_a.size(),
            image_b.size()
        );
        ensure!(
            weather.size() == vec![bsize, weather_features * 2],
            "expect weather shape [{}, {}], but get {:?}",
            bsize,
            weather_features * 2,
            weather.size()
        );

        let input = Tensor::cat(
            &[
                image_a,
                &broadcast_weather(weather, height, width)?,
                image_b,
            ],
            1,
        );
        let EncoderOutput { bottleneck, skips } = encoder.forward_t(&input, train)?;

        let bottleneck = match attention {
            Some(attention) => attention.forward(&bottleneck)?,
            None => bottleneck,
        };

        let global = global_head.forward(&bottleneck);
        let pixel = pixel_head.forward(&decoder.forward_t(&bottleneck, &skips, train)?);

        Ok(DiscriminatorOutput { global, pixel })
    }
}

impl<const DEPTH: usize> SpectralParams for Discriminator<DEPTH> {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        let Self {
            ref encoder,
            ref attention,
            ref global_head,
            ref decoder,
            ref pixel_head,
            ..
        } = *self;

        prefixed("encoder", encoder.spectral_params())
            .into_iter()
            .chain(prefixed("attention", attention.spectral_params()))
            .chain(prefixed("global_head", global_head.spectral_params()))
            .chain(prefixed("decoder", decoder.spectral_params()))
            .chain(prefixed("pixel_head", pixel_head.spectral_params()))
            .collect()
    }
}
