use super::{
    batch_norm::{BatchNorm2D, BatchNorm2DInit},
    conv::{Conv2D, Conv2DInit},
    spectral_norm::{prefixed, SpectralParam, SpectralParams},
};
use crate::common::*;

pub const LEAKY_RELU_SLOPE: f64 = 0.3;

pub fn leaky_relu(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * LEAKY_RELU_SLOPE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// 3x3 convolution, keeps the spatial size.
    SameRes,
    /// 4x4 stride-2 convolution, halves the spatial size.
    Down,
    /// 4x4 stride-2 transposed convolution, doubles the spatial size.
    Up,
}

/// Constrained convolution → batch norm → leaky ReLU.
#[derive(Debug, Clone)]
pub struct ConvBlockInit {
    pub kind: BlockKind,
    pub out_channels: usize,
    pub name: String,
}

impl ConvBlockInit {
    pub fn same_res(out_channels: usize, name: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::SameRes,
            out_channels,
            name: name.into(),
        }
    }

    pub fn down(out_channels: usize, name: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Down,
            out_channels,
            name: name.into(),
        }
    }

    pub fn up(out_channels: usize, name: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Up,
            out_channels,
            name: name.into(),
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, in_channels: usize) -> Result<ConvBlock> {
        let path = path.borrow();
        let Self {
            kind,
            out_channels,
            name,
        } = self;

        let conv_init = match kind {
            BlockKind::SameRes => Conv2DInit::new(3),
            BlockKind::Down => Conv2DInit::down_sample(),
            BlockKind::Up => Conv2DInit::up_sample(),
        };
        let conv = Conv2DInit {
            bias: false,
            constrained: true,
            ..conv_init
        }
        .build(path / "conv", in_channels, out_channels)
        .with_context(|| format!("unable to build block '{}'", name))?;
        let bn = BatchNorm2DInit::default().build(path / "bn", out_channels);

        Ok(ConvBlock {
            name,
            out_channels,
            conv,
            bn,
        })
    }
}

#[derive(Debug)]
pub struct ConvBlock {
    name: String,
    out_channels: usize,
    conv: Conv2D,
    bn: BatchNorm2D,
}

impl ConvBlock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref name,
            ref conv,
            ref bn,
            ..
        } = *self;

        let (_b, c, _h, _w) = input.size4().with_context(|| {
            format!(
                "block '{}' expects input shape [B, C, H, W], but get {:?}",
                name,
                input.size()
            )
        })?;
        ensure!(
            c == conv.in_dim(),
            "block '{}' expects {} input channels, but get {}",
            name,
            conv.in_dim(),
            c
        );

        let xs = conv.forward(input);
        let xs = bn.forward_t(&xs, train)?;
        Ok(leaky_relu(&xs))
    }
}

impl SpectralParams for ConvBlock {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        prefixed("conv", self.conv.spectral_params())
    }
}
