use crate::common::*;

#[derive(Debug, Clone)]
pub struct BatchNorm2DInit {
    pub cudnn_enabled: bool,
    pub eps: f64,
    pub momentum: f64,
    pub ws_init: Option<nn::Init>,
    pub bs_init: Option<nn::Init>,
}

impl Default for BatchNorm2DInit {
    fn default() -> Self {
        Self {
            cudnn_enabled: true,
            eps: 1e-3,
            momentum: 0.01,
            ws_init: Some(nn::Init::Const(1.0)),
            bs_init: Some(nn::Init::Const(0.0)),
        }
    }
}

impl BatchNorm2DInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, out_dim: usize) -> BatchNorm2D {
        let path = path.borrow();
        let Self {
            cudnn_enabled,
            eps,
            momentum,
            ws_init,
            bs_init,
        } = self;
        let out_dim = out_dim as i64;

        let ws = ws_init.map(|init| path.var("weight", &[out_dim], init));
        let bs = bs_init.map(|init| path.var("bias", &[out_dim], init));

        BatchNorm2D {
            running_mean: path.zeros_no_train("running_mean", &[out_dim]),
            running_var: path.ones_no_train("running_var", &[out_dim]),
            ws,
            bs,
            cudnn_enabled,
            eps,
            momentum,
        }
    }
}

/// Batch normalization over `[B, C, H, W]` inputs.
///
/// In training mode the batch statistics are used and the running statistics
/// are updated in-place. In inference mode the running statistics are used.
#[derive(Debug)]
pub struct BatchNorm2D {
    running_mean: Tensor,
    running_var: Tensor,
    ws: Option<Tensor>,
    bs: Option<Tensor>,
    cudnn_enabled: bool,
    eps: f64,
    momentum: f64,
}

impl BatchNorm2D {
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref running_mean,
            ref running_var,
            ref ws,
            ref bs,
            cudnn_enabled,
            eps,
            momentum,
        } = *self;

        ensure!(
            input.dim() == 4,
            "expected an input tensor with 4 dims, got {:?}",
            input.dim()
        );

        let output = Tensor::batch_norm(
            input,
            ws.as_ref(),
            bs.as_ref(),
            Some(running_mean),
            Some(running_var),
            train,
            momentum,
            eps,
            cudnn_enabled,
        );

        Ok(output)
    }
}
