use crate::common::*;

#[derive(Debug, Clone)]
pub struct AdamInit {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamInit {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.0,
            beta2: 0.9,
            eps: 1e-7,
        }
    }
}

impl AdamInit {
    /// Tracks every trainable variable of the store, ordered by name.
    pub fn build(self, vs: &nn::VarStore) -> Result<Adam> {
        let Self {
            lr,
            beta1,
            beta2,
            eps,
        } = self;
        ensure!(lr > 0.0, "learning rate must be positive");
        ensure!(
            (0.0..1.0).contains(&beta1) && (0.0..1.0).contains(&beta2),
            "betas must be in [0, 1)"
        );
        ensure!(eps > 0.0, "eps must be positive");

        let params: Vec<_> = vs
            .variables()
            .into_iter()
            .filter(|(_, var)| var.requires_grad())
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .map(|(name, var)| {
                let (first_moment, second_moment) =
                    tch::no_grad(|| (var.zeros_like(), var.zeros_like()));
                AdamParam {
                    name,
                    var,
                    first_moment,
                    second_moment,
                }
            })
            .collect();

        Ok(Adam {
            lr,
            beta1,
            beta2,
            eps,
            num_updates: 0,
            params,
        })
    }
}

#[derive(Debug)]
struct AdamParam {
    name: String,
    var: Tensor,
    first_moment: Tensor,
    second_moment: Tensor,
}

/// Adam with explicit moment state that can be saved and restored.
#[derive(Debug)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    num_updates: i64,
    params: Vec<AdamParam>,
}

impl Adam {
    pub fn num_updates(&self) -> i64 {
        self.num_updates
    }

    /// The optimized variables, in the order gradients are expected.
    pub fn variables(&self) -> Vec<&Tensor> {
        self.params.iter().map(|param| &param.var).collect()
    }

    /// Applies one update. Undefined gradients leave their variable untouched.
    pub fn apply_gradients(&mut self, grads: &[Tensor]) -> Result<()> {
        let Self {
            lr,
            beta1,
            beta2,
            eps,
            ref mut num_updates,
            ref mut params,
        } = *self;
        ensure!(
            grads.len() == params.len(),
            "expect {} gradients, but get {}",
            params.len(),
            grads.len()
        );

        *num_updates += 1;
        let step = *num_updates as f64;
        let lr_t = lr * (1.0 - beta2.powf(step)).sqrt() / (1.0 - beta1.powf(step));

        tch::no_grad(|| {
            izip!(params.iter_mut(), grads).try_for_each(|(param, grad)| {
                if !grad.defined() {
                    return Ok(());
                }
                let AdamParam {
                    name,
                    var,
                    first_moment,
                    second_moment,
                } = param;
                ensure!(
                    grad.size() == var.size(),
                    "gradient shape mismatch for '{}'",
                    name
                );

                let new_first = &*first_moment * beta1 + grad * (1.0 - beta1);
                let new_second = &*second_moment * beta2 + grad.square() * (1.0 - beta2);
                let update = &new_first / (new_second.sqrt() + eps) * lr_t;
                let new_var = &*var - update;

                first_moment.copy_(&new_first);
                second_moment.copy_(&new_second);
                var.copy_(&new_var);
                Ok(())
            })
        })
    }

    pub fn state(&self) -> Vec<(String, Tensor)> {
        let step = Tensor::of_slice(&[self.num_updates]);
        let moments = self.params.iter().flat_map(|param| {
            [
                (
                    format!("{}.first_moment", param.name),
                    param.first_moment.shallow_clone(),
                ),
                (
                    format!("{}.second_moment", param.name),
                    param.second_moment.shallow_clone(),
                ),
            ]
        });
        iter::once(("num_updates".to_string(), step))
            .chain(moments)
            .collect()
    }

    pub fn load_state(&mut self, state: &IndexMap<String, Tensor>) -> Result<()> {
        let get = |key: &str| {
            state
                .get(key)
                .ok_or_else(|| format_err!("missing optimizer state '{}'", key))
        };

        let num_updates = i64::from(get("num_updates")?);

        tch::no_grad(|| {
            self.params.iter_mut().try_for_each(|param| -> Result<()> {
                let first = get(&format!("{}.first_moment", param.name))?;
                let second = get(&format!("{}.second_moment", param.name))?;
                ensure!(
                    first.size() == param.var.size() && second.size() == param.var.size(),
                    "optimizer state shape mismatch for '{}'",
                    param.name
                );
                param.first_moment.copy_(first);
                param.second_moment.copy_(second);
                Ok(())
            })
        })?;

        self.num_updates = num_updates;
        Ok(())
    }
}
