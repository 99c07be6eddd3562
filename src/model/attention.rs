use super::{
    conv::glorot_uniform,
    spectral_norm::{prefixed, MatrixLayout, SpectralParam, SpectralParams},
};
use crate::common::*;

/// The spatial axis along which [AxisAttention] attends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Attends across rows, independently within each column.
    Row,
    /// Attends across columns, independently within each row.
    Column,
}

impl Axis {
    /// Permutation from `[B, C, H, W]` to `[B, strips, sequence, C]`.
    fn to_sequence_order(self) -> [i64; 4] {
        match self {
            Self::Row => [0, 3, 2, 1],
            Self::Column => [0, 2, 3, 1],
        }
    }

    /// Permutation from `[B, strips, sequence, C]` back to `[B, C, H, W]`.
    fn from_sequence_order(self) -> [i64; 4] {
        match self {
            Self::Row => [0, 3, 2, 1],
            Self::Column => [0, 3, 1, 2],
        }
    }
}

#[derive(Debug)]
struct Projections {
    in_channels: i64,
    num_heads: i64,
    reduced_channels: i64,
    constrained: bool,
    query_weight: Tensor,
    key_weight: Tensor,
    value_weight: Tensor,
    output_weight: Tensor,
    gamma: Tensor,
}

impl Projections {
    fn new(
        path: &nn::Path,
        in_channels: usize,
        num_heads: usize,
        reduced_channels: usize,
        constrained: bool,
    ) -> Result<Self> {
        ensure!(in_channels > 0, "input channels must be positive");
        ensure!(num_heads > 0, "number of heads must be positive");
        ensure!(reduced_channels > 0, "reduced channels must be positive");

        let in_channels = in_channels as i64;
        let num_heads = num_heads as i64;
        let reduced_channels = reduced_channels as i64;
        let qkv_init = glorot_uniform(num_heads * in_channels, num_heads * reduced_channels);
        let qkv_size = [num_heads, in_channels, reduced_channels];

        let query_weight = path.var("query_weight", &qkv_size, qkv_init);
        let key_weight = path.var("key_weight", &qkv_size, qkv_init);
        let value_weight = path.var("value_weight", &qkv_size, qkv_init);
        let output_weight = path.var(
            "output_weight",
            &[num_heads * reduced_channels, in_channels],
            glorot_uniform(num_heads * reduced_channels, in_channels),
        );
        let gamma = path.var("gamma", &[1], nn::Init::Const(0.0));

        Ok(Self {
            in_channels,
            num_heads,
            reduced_channels,
            constrained,
            query_weight,
            key_weight,
            value_weight,
            output_weight,
            gamma,
        })
    }

    /// Multi-head attention over the third axis of a `[B, strips, sequence, C]`
    /// tensor. Strips are attended independently.
    fn attend(&self, xs: &Tensor) -> Result<Tensor> {
        let Self {
            in_channels,
            num_heads,
            reduced_channels,
            ref query_weight,
            ref key_weight,
            ref value_weight,
            ref output_weight,
            ref gamma,
            ..
        } = *self;

        let (bsize, num_strips, seq_len, channels) = xs.size4()?;
        ensure!(
            channels == in_channels,
            "attention expects {} input channels, but get {}",
            in_channels,
            channels
        );

        // [B, heads, strips, seq, reduced]
        let query = Tensor::einsum("bpqc,nck->bnpqk", &[xs, query_weight]);
        let key = Tensor::einsum("bpqc,nck->bnpqk", &[xs, key_weight]);
        let value = Tensor::einsum("bpqc,nck->bnpqk", &[xs, value_weight]);

        let similarity = Tensor::einsum("bnpqk,bnpsk->bnpqs", &[&query, &key])
            / (reduced_channels as f64).sqrt();
        let similarity = similarity.softmax(-1, Kind::Float);
        let heads = Tensor::einsum("bnpqs,bnpsk->bnpqk", &[&similarity, &value]);

        let merged = heads.permute(&[0, 2, 3, 1, 4]).reshape(&[
            bsize,
            num_strips,
            seq_len,
            num_heads * reduced_channels,
        ]);
        let output = merged.matmul(output_weight);

        Ok(gamma * output + xs)
    }
}

impl SpectralParams for Projections {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        if !self.constrained {
            return vec![];
        }

        vec![
            SpectralParam::new("query_weight", &self.query_weight, MatrixLayout::Trailing),
            SpectralParam::new("key_weight", &self.key_weight, MatrixLayout::Trailing),
            SpectralParam::new("value_weight", &self.value_weight, MatrixLayout::Trailing),
            SpectralParam::new("output_weight", &self.output_weight, MatrixLayout::Trailing),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct AxisAttentionInit {
    pub axis: Axis,
    pub num_heads: usize,
    pub reduced_channels: usize,
    pub constrained: bool,
}

impl AxisAttentionInit {
    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_channels: usize,
    ) -> Result<AxisAttention> {
        let Self {
            axis,
            num_heads,
            reduced_channels,
            constrained,
        } = self;
        let projections = Projections::new(
            path.borrow(),
            in_channels,
            num_heads,
            reduced_channels,
            constrained,
        )?;
        Ok(AxisAttention { axis, projections })
    }
}

/// Self-attention restricted to one spatial axis.
///
/// The orthogonal axis is treated as a batch dimension, so the cost is
/// `O(H·W·(H+W))` for both axes combined.
#[derive(Debug)]
pub struct AxisAttention {
    axis: Axis,
    projections: Projections,
}

impl AxisAttention {
    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn gamma(&self) -> &Tensor {
        &self.projections.gamma
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let Self {
            axis,
            ref projections,
        } = *self;
        ensure!(
            input.dim() == 4,
            "expect input shape [B, C, H, W], but get {:?}",
            input.size()
        );

        let xs = input.permute(&axis.to_sequence_order());
        let ys = projections.attend(&xs)?;
        Ok(ys.permute(&axis.from_sequence_order()))
    }
}

impl SpectralParams for AxisAttention {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        self.projections.spectral_params()
    }
}

#[derive(Debug, Clone)]
pub struct Attention2DInit {
    pub num_heads: usize,
    pub reduced_channels: usize,
}

impl Attention2DInit {
    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_channels: usize,
    ) -> Result<Attention2D> {
        let Self {
            num_heads,
            reduced_channels,
        } = self;
        let projections =
            Projections::new(path.borrow(), in_channels, num_heads, reduced_channels, true)?;
        Ok(Attention2D { projections })
    }
}

/// Self-attention over the whole spatial extent. All projections are
/// spectrally constrained.
#[derive(Debug)]
pub struct Attention2D {
    projections: Projections,
}

impl Attention2D {
    pub fn gamma(&self) -> &Tensor {
        &self.projections.gamma
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (bsize, channels, height, width) = input.size4().with_context(|| {
            format!(
                "expect input shape [B, C, H, W], but get {:?}",
                input.size()
            )
        })?;

        // a single strip holding every location
        let xs = input
            .permute(&[0, 2, 3, 1])
            .reshape(&[bsize, 1, height * width, channels]);
        let ys = self.projections.attend(&xs)?;
        Ok(ys
            .reshape(&[bsize, height, width, channels])
            .permute(&[0, 3, 1, 2]))
    }
}

impl SpectralParams for Attention2D {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        self.projections.spectral_params()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    Row,
    Column,
    /// Row attention followed by column attention.
    Axial,
    Full,
}

/// Attention placed at a network bottleneck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub kind: AttentionKind,
    pub num_heads: NonZeroUsize,
    pub reduced_channels: NonZeroUsize,
    /// Constrains the axis variants. The full variant is always constrained.
    #[serde(default)]
    pub constrained: bool,
}

impl AttentionConfig {
    pub fn build<'a>(
        &self,
        path: impl Borrow<nn::Path<'a>>,
        in_channels: usize,
    ) -> Result<BottleneckAttention> {
        let path = path.borrow();
        let Self {
            kind,
            num_heads,
            reduced_channels,
            constrained,
        } = *self;
        let num_heads = num_heads.get();
        let reduced_channels = reduced_channels.get();
        let axis_init = |axis| AxisAttentionInit {
            axis,
            num_heads,
            reduced_channels,
            constrained,
        };

        let attention = match kind {
            AttentionKind::Row => {
                BottleneckAttention::Axis(axis_init(Axis::Row).build(path / "row", in_channels)?)
            }
            AttentionKind::Column => BottleneckAttention::Axis(
                axis_init(Axis::Column).build(path / "column", in_channels)?,
            ),
            AttentionKind::Axial => BottleneckAttention::Axial {
                row: axis_init(Axis::Row).build(path / "row", in_channels)?,
                column: axis_init(Axis::Column).build(path / "column", in_channels)?,
            },
            AttentionKind::Full => BottleneckAttention::Full(
                Attention2DInit {
                    num_heads,
                    reduced_channels,
                }
                .build(path / "full", in_channels)?,
            ),
        };

        Ok(attention)
    }
}

#[derive(Debug)]
pub enum BottleneckAttention {
    Axis(AxisAttention),
    Axial {
        row: AxisAttention,
        column: AxisAttention,
    },
    Full(Attention2D),
}

impl BottleneckAttention {
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Self::Axis(attention) => attention.forward(input),
            Self::Axial { row, column } => column.forward(&row.forward(input)?),
            Self::Full(attention) => attention.forward(input),
        }
    }
}

impl SpectralParams for BottleneckAttention {
    fn spectral_params(&self) -> Vec<SpectralParam> {
        match self {
            Self::Axis(attention) => match attention.axis() {
                Axis::Row => prefixed("row", attention.spectral_params()),
                Axis::Column => prefixed("column", attention.spectral_params()),
            },
            Self::Axial { row, column } => prefixed("row", row.spectral_params())
                .into_iter()
                .chain(prefixed("column", column.spectral_params()))
                .collect(),
            Self::Full(attention) => prefixed("full", attention.spectral_params()),
        }
    }
}
