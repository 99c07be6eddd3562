use crate::common::*;

pub const SPECTRAL_NORM_EPS: f64 = 1e-12;

/// Tells how a weight tensor is flattened into a `[fan_in, fan_out]` matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixLayout {
    /// The first axis is the fan-out, e.g. convolution kernels `[out, in, kh, kw]`
    /// or transposed convolution kernels `[in, out, kh, kw]`.
    Leading,
    /// The last axis is the fan-out, e.g. projections `[heads, in, reduced]`.
    Trailing,
}

impl MatrixLayout {
    pub fn to_matrix(self, weight: &Tensor) -> Tensor {
        let size = weight.size();
        match self {
            Self::Leading => weight.reshape(&[size[0], -1]).transpose(0, 1),
            Self::Trailing => weight.reshape(&[-1, size[size.len() - 1]]),
        }
    }

    pub fn from_matrix(self, matrix: &Tensor, size: &[i64]) -> Tensor {
        match self {
            Self::Leading => matrix.transpose(0, 1).reshape(size),
            Self::Trailing => matrix.reshape(size),
        }
    }

    fn num_rows(self, weight: &Tensor) -> Result<i64> {
        let size = weight.size();
        ensure!(
            size.len() >= 2,
            "spectral norm expects a weight with at least 2 dims, but get {:?}",
            size
        );
        let numel: i64 = size.iter().product();
        let cols = match self {
            Self::Leading => size[0],
            Self::Trailing => size[size.len() - 1],
        };
        Ok(numel / cols)
    }
}

#[derive(Debug)]
pub struct SpectralOutput {
    /// `W / max(σ, eps)`
    pub weight: Tensor,
    /// Updated left singular vector estimate, unit norm.
    pub u: Tensor,
    /// Spectral norm estimate of the input matrix.
    pub sigma: f64,
}

/// Runs a single power-iteration step on a `[fan_in, fan_out]` matrix.
///
/// The input matrix is left untouched. The caller decides whether to write the
/// normalized matrix and the refined `u` back.
pub fn spectral_normalize(matrix: &Tensor, u: &Tensor, eps: f64) -> Result<SpectralOutput> {
    let (rows, _cols) = matrix.size2()?;
    ensure!(
        u.size() == vec![rows],
        "expect u of shape [{}], but get {:?}",
        rows,
        u.size()
    );

    let v = l2_normalize(&matrix.transpose(0, 1).mv(u), eps);
    let wv = matrix.mv(&v);
    let u = l2_normalize(&wv, eps);
    let sigma = f64::from(u.dot(&wv));

    let weight = matrix / sigma.max(eps);

    Ok(SpectralOutput { weight, u, sigma })
}

fn l2_normalize(xs: &Tensor, eps: f64) -> Tensor {
    xs / xs.norm().clamp_min(eps)
}

/// A constrained weight exposed by a layer.
#[derive(Debug)]
pub struct SpectralParam {
    pub name: String,
    pub weight: Tensor,
    pub layout: MatrixLayout,
}

impl SpectralParam {
    pub fn new(name: impl Into<String>, weight: &Tensor, layout: MatrixLayout) -> Self {
        Self {
            name: name.into(),
            weight: weight.shallow_clone(),
            layout,
        }
    }
}

/// Layers that own spectrally constrained weights.
pub trait SpectralParams {
    fn spectral_params(&self) -> Vec<SpectralParam>;
}

impl<T> SpectralParams for Option<T>
where
    T: SpectralParams,
{
    fn spectral_params(&self) -> Vec<SpectralParam> {
        self.as_ref()
            .map(|inner| inner.spectral_params())
            .unwrap_or_default()
    }
}

impl<T> SpectralParams for [T]
where
    T: SpectralParams,
{
    fn spectral_params(&self) -> Vec<SpectralParam> {
        self.iter()
            .flat_map(|item| item.spectral_params())
            .collect()
    }
}

/// Prepends `prefix.` to every parameter name.
pub fn prefixed(prefix: &str, params: Vec<SpectralParam>) -> Vec<SpectralParam> {
    params
        .into_iter()
        .map(|param| SpectralParam {
            name: format!("{}.{}", prefix, param.name),
            ..param
        })
        .collect()
}

#[derive(Debug)]
struct SpectralEntry {
    weight: Tensor,
    u: Tensor,
    layout: MatrixLayout,
}

/// Persisted singular vector estimates, keyed by weight name.
#[derive(Debug)]
pub struct SpectralNorm {
    entries: IndexMap<String, SpectralEntry>,
    eps: f64,
}

impl SpectralNorm {
    pub fn new(model: &impl SpectralParams) -> Result<Self> {
        Self::with_eps(model, SPECTRAL_NORM_EPS)
    }

    pub fn with_eps(model: &impl SpectralParams, eps: f64) -> Result<Self> {
        ensure!(eps > 0.0, "eps must be positive");

        let mut entries = IndexMap::new();

        for param in model.spectral_params() {
            let SpectralParam {
                name,
                weight,
                layout,
            } = param;
            let rows = layout.num_rows(&weight)?;
            let u = tch::no_grad(|| {
                let u = Tensor::randn(&[rows], (Kind::Float, weight.device()));
                l2_normalize(&u, eps)
            });

            let prev = entries.insert(name.clone(), SpectralEntry { weight, u, layout });
            ensure!(prev.is_none(), "duplicated constrained weight '{}'", name);
        }

        Ok(Self { entries, eps })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|name| name.as_str())
    }

    pub fn u(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name).map(|entry| &entry.u)
    }

    /// Applies one power-iteration step to every constrained weight and
    /// replaces the weight by its normalized value.
    pub fn constrain(&mut self) -> Result<()> {
        let eps = self.eps;

        tch::no_grad(|| {
            self.entries.iter_mut().try_for_each(|(name, entry)| {
                let SpectralEntry { weight, u, layout } = entry;
                let matrix = layout.to_matrix(weight);
                let SpectralOutput {
                    weight: normalized,
                    u: new_u,
                    sigma,
                } = spectral_normalize(&matrix, u, eps)
                    .with_context(|| format!("failed to constrain '{}'", name))?;

                if sigma < eps {
                    debug!("spectral norm of '{}' is clamped", name);
                }

                let normalized = layout.from_matrix(&normalized, &weight.size());
                weight.copy_(&normalized);
                u.copy_(&new_u);
                Ok(())
            })
        })
    }

    pub fn state(&self) -> Vec<(String, Tensor)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.u.shallow_clone()))
            .collect()
    }

    pub fn load_state(&mut self, state: &IndexMap<String, Tensor>) -> Result<()> {
        tch::no_grad(|| {
            self.entries.iter_mut().try_for_each(|(name, entry)| {
                let src = state
                    .get(name)
                    .ok_or_else(|| format_err!("missing singular vector for '{}'", name))?;
                ensure!(
                    src.size() == entry.u.size(),
                    "singular vector shape mismatch for '{}'",
                    name
                );
                entry.u.copy_(src);
                Ok(())
            })
        })
    }
}
