use super::{
    block::{ConvBlock, ConvBlockInit},
    spectral_norm::{prefixed, SpectralParam, SpectralParams},
};
use crate::common::*;

/// Repeats a `[B, F]` vector over every pixel of a `[B, F, H, W]` map.
pub fn broadcast_weather(weather: &Tensor, height: i64, width: i64) -> Result<Tensor> {
    let (bsize, features) = weather.size2().with_context(|| {
        format!(
            "expect weather shape [B, F], but get {:?}",
            weather.size()
        )
    })?;
    Ok(weather
        .view([bsize, features, 1, 1])
        .expand(&[bsize, features, height, width], false))
}

/// Checks that an image survives `depth` halvings without rounding.
pub fn check_image_size(height: usize, width: usize, depth: usize) -> Result<()> {
    let scale = 1usize << depth;
    ensure!(
        height > 0 && width > 0 && height % scale == 0 && width % scale == 0,
        "image size {}x{} must be a positive multiple of {}",
        height,
        width,
        scale
    );
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EncoderInit<const DEPTH: usize> {
    pub in_channels: usize,
    pub pre_channels: usize,
    pub down_channels: [usize; DEPTH],
}

impl<const DEPTH: usize> EncoderInit<DEPTH> {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Encoder<DEPTH>> {
        ensure!(DEPTH >= 1, "zero depth is not allowed");

        let path = path.borrow();
        let Self {
            in_channels,
            pre_channels,
            down_channels,
        } = self;

        let pre_block = ConvBlockInit::same_res(pre_channels, "pre").build(path / "pre", in_channels)?;

        let down_blocks: Vec<_> = izip!(
            iter::once(pre_channels).chain(down_channels),
            down_channels
        )
        .enumerate()
        .map(|(index, (in_c, out_c))| {
            let name = format!("down_{}", index + 1);
            ConvBlockInit::down(out_c, name.clone()).build(path / name, in_c)
        })
        .try_collect()?;

        let mut skip_channels = [0; DEPTH];
        skip_channels[0] = pre_channels;
        skip_channels[1..].copy_from_slice(&down_channels[..(DEPTH - 1)]);

        Ok(Encoder {
            pre_block,
            down_blocks,
            skip_channels,
            out_channels: down_channels[DEPTH - 1],
        })
    }
}

#[derive(Debug)]
pub struct Encoder<const DEPTH: usize> {
    pre_block: ConvBlock,
    down_blocks: Vec<ConvBlock>,
    skip_channels: [usize; DEPTH],
    out_channels: usize,
}

#[derive(Debug)]
pub struct EncoderOutput<const DEPTH: usize> {
    pub bottleneck: Tensor,
    /// Activations at every resolution above the bottleneck, finest first.
    pub skips: [Tensor; DEPTH],
}

impl<const DEPTH: usize> Encoder<DEPTH> {
    pub fn skip_channels(&self) -> [usize; DEPTH] {
        self.skip_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<EncoderOutput<DEPTH>> {
        let Self {
            ref pre_block,
            ref down_blocks,
            ..
        } = *self;

        let mut skips = Vec::with_capacity(DEPTH);
        let mut xs = pre_block.forward_t(input, train)?;

        for block in down_blocks {
            let next = block.forward_t(&xs, train)?;
            skips.push(xs);
            xs = next;
        }

        let skips: [Tensor; DEPTH] = skips
            .try_into()
            .map_err(|skips: Vec<_>| format_err!("expect {} skips, but get {}", DEPTH, skips.len()))?;

        Ok(EncoderOutput {
            bottleneck: xs,
            skips,
        })
    }
}

impl<const DEPTH: usize> SpectralParams for Encoder<DEPTH> {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        let pre = prefixed("pre", self.pre_block.spectral_params());
        let down = self
            .down_blocks
            .iter()
            .flat_map(|block| prefixed(block.name(), block.spectral_params()));
        pre.into_iter().chain(down).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DecoderInit<const DEPTH: usize> {
    pub in_channels: usize,
    pub skip_channels: [usize; DEPTH],
    pub up_channels: [usize; DEPTH],
    pub post_channels: usize,
}

impl<const DEPTH: usize> DecoderInit<DEPTH> {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Decoder<DEPTH>> {
        ensure!(DEPTH >= 1, "zero depth is not allowed");

        let path = path.borrow();
        let Self {
            in_channels,
            skip_channels,
            up_channels,
            post_channels,
        } = self;

        let mut up_blocks = Vec::with_capacity(DEPTH);
        let mut channels = in_channels;

        for (index, (out_c, skip_c)) in izip!(up_channels, skip_channels.iter().rev()).enumerate() {
            let name = format!("up_{}", DEPTH - index);
            let block = ConvBlockInit::up(out_c, name.clone()).build(path / name, channels)?;
            up_blocks.push(block);
            channels = out_c + skip_c;
        }

        let post_block =
            ConvBlockInit::same_res(post_channels, "post").build(path / "post", channels)?;

        Ok(Decoder {
            up_blocks,
            post_block,
        })
    }
}

#[derive(Debug)]
pub struct Decoder<const DEPTH: usize> {
    up_blocks: Vec<ConvBlock>,
    post_block: ConvBlock,
}

impl<const DEPTH: usize> Decoder<DEPTH> {
    pub fn out_channels(&self) -> usize {
        self.post_block.out_channels()
    }

    /// Upsamples the bottleneck, consuming the skips coarsest first.
    pub fn forward_t(&self, input: &Tensor, skips: &[Tensor; DEPTH], train: bool) -> Result<Tensor> {
        let Self {
            ref up_blocks,
            ref post_block,
        } = *self;

        let xs = izip!(up_blocks, skips.iter().rev()).try_fold(
            input.shallow_clone(),
            |xs, (block, skip)| -> Result<_> {
                let xs = block.forward_t(&xs, train)?;
                ensure!(
                    xs.size()[2..] == skip.size()[2..],
                    "block '{}' output size {:?} does not match skip size {:?}",
                    block.name(),
                    xs.size(),
                    skip.size()
                );
                Ok(Tensor::cat(&[&xs, skip], 1))
            },
        )?;

        post_block.forward_t(&xs, train)
    }
}

impl<const DEPTH: usize> SpectralParams for Decoder<DEPTH> {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        self.up_blocks
            .iter()
            .flat_map(|block| prefixed(block.name(), block.spectral_params()))
            .chain(prefixed("post", self.post_block.spectral_params()))
            .collect()
    }
}
