use super::spectral_norm::{MatrixLayout, SpectralParam, SpectralParams};
use crate::common::*;

/// Glorot (Xavier) uniform initializer.
pub fn glorot_uniform(fan_in: i64, fan_out: i64) -> nn::Init {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    nn::Init::Uniform {
        lo: -limit,
        up: limit,
    }
}

#[derive(Debug, Clone)]
pub struct Conv2DInit {
    pub ksize: usize,
    pub stride: usize,
    pub padding: usize,
    pub transposed: bool,
    pub bias: bool,
    pub constrained: bool,
}

impl Conv2DInit {
    /// A stride-1 convolution that preserves the spatial size for odd kernels.
    pub fn new(ksize: usize) -> Self {
        Self {
            ksize,
            stride: 1,
            padding: ksize / 2,
            transposed: false,
            bias: true,
            constrained: false,
        }
    }

    /// A 4x4 stride-2 convolution that halves even spatial sizes.
    pub fn down_sample() -> Self {
        Self {
            ksize: 4,
            stride: 2,
            padding: 1,
            ..Self::new(4)
        }
    }

    /// A 4x4 stride-2 transposed convolution that doubles the spatial size.
    pub fn up_sample() -> Self {
        Self {
            transposed: true,
            ..Self::down_sample()
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Conv2D> {
        let Self {
            ksize,
            stride,
            padding,
            transposed,
            bias,
            constrained,
        } = self;
        ensure!(ksize > 0 && stride > 0, "ksize and stride must be positive");
        ensure!(in_dim > 0 && out_dim > 0, "channels must be positive");

        let path = path.borrow();
        let in_dim = in_dim as i64;
        let out_dim = out_dim as i64;
        let ksize = ksize as i64;
        let area = ksize * ksize;

        let ws = {
            let weight_size = if transposed {
                [in_dim, out_dim, ksize, ksize]
            } else {
                [out_dim, in_dim, ksize, ksize]
            };
            path.var(
                "weight",
                &weight_size,
                glorot_uniform(in_dim * area, out_dim * area),
            )
        };
        let bs = bias.then(|| path.var("bias", &[out_dim], nn::Init::Const(0.0)));

        Ok(Conv2D {
            in_dim,
            stride: stride as i64,
            padding: padding as i64,
            transposed,
            constrained,
            weight: ws,
            bias: bs,
        })
    }
}

#[derive(Debug)]
pub struct Conv2D {
    in_dim: i64,
    stride: i64,
    padding: i64,
    transposed: bool,
    constrained: bool,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Conv2D {
    pub fn in_dim(&self) -> i64 {
        self.in_dim
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        let Self {
            stride,
            padding,
            transposed,
            ref weight,
            ref bias,
            ..
        } = *self;

        input.convolution(
            weight,
            bias.as_ref(),
            &[stride, stride],
            &[padding, padding],
            &[1, 1], // dilation
            transposed,
            &[0, 0], // output_padding
            1,       // groups
        )
    }
}

impl SpectralParams for Conv2D {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        if self.constrained {
            vec![SpectralParam::new(
                "weight",
                &self.weight,
                MatrixLayout::Leading,
            )]
        } else {
            vec![]
        }
    }
}

#[derive(Debug, Clone)]
pub struct DenseInit {
    pub bias: bool,
    pub constrained: bool,
}

impl Default for DenseInit {
    fn default() -> Self {
        Self {
            bias: true,
            constrained: false,
        }
    }
}

impl DenseInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, in_dim: usize, out_dim: usize) -> Dense {
        let path = path.borrow();
        let Self { bias, constrained } = self;
        let in_dim = in_dim as i64;
        let out_dim = out_dim as i64;

        let weight = path.var("weight", &[in_dim, out_dim], glorot_uniform(in_dim, out_dim));
        let bias = bias.then(|| path.var("bias", &[out_dim], nn::Init::Const(0.0)));

        Dense {
            weight,
            bias,
            constrained,
        }
    }
}

/// Fully connected layer with a `[in, out]` weight.
#[derive(Debug)]
pub struct Dense {
    weight: Tensor,
    bias: Option<Tensor>,
    constrained: bool,
}

impl Dense {
    pub fn forward(&self, input: &Tensor) -> Tensor {
        let output = input.matmul(&self.weight);
        match &self.bias {
            Some(bias) => output + bias,
            None => output,
        }
    }
}

impl SpectralParams for Dense {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        if self.constrained {
            vec![SpectralParam::new(
                "weight",
                &self.weight,
                MatrixLayout::Trailing,
            )]
        } else {
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_2d_shape_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let input = Tensor::rand(&[2, 3, 16, 24], FLOAT_CPU);

        let same = Conv2DInit::new(3).build(&root / "same", 3, 5)?;
        ensure!(same.forward(&input).size() == vec![2, 5, 16, 24]);

        let down = Conv2DInit::down_sample().build(&root / "down", 3, 5)?;
        ensure!(down.forward(&input).size() == vec![2, 5, 8, 12]);

        let up = Conv2DInit::up_sample().build(&root / "up", 3, 5)?;
        ensure!(up.forward(&input).size() == vec![2, 5, 32, 48]);

        let point = Conv2DInit::new(1).build(&root / "point", 3, 1)?;
        ensure!(point.forward(&input).size() == vec![2, 1, 16, 24]);

        Ok(())
    }

    #[test]
    fn dense_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let dense = DenseInit {
            constrained: true,
            ..Default::default()
        }
        .build(&vs.root() / "dense", 7, 11);

        let output = dense.forward(&Tensor::rand(&[4, 7], FLOAT_CPU));
        ensure!(output.size() == vec![4, 11]);
        ensure!(dense.spectral_params().len() == 1);
        Ok(())
    }
}
