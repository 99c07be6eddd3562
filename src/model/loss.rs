use super::discriminator::DiscriminatorOutput;
use crate::common::*;

/// Mean sigmoid cross entropy of logits against targets in `[0, 1]`.
pub fn bce_with_logits(logits: &Tensor, target: &Tensor) -> Tensor {
    logits.binary_cross_entropy_with_logits::<Tensor>(target, None, None, Reduction::Mean)
}

/// Mean sigmoid cross entropy of logits against a constant label.
pub fn bce_with_label(logits: &Tensor, label: f64) -> Tensor {
    bce_with_logits(logits, &logits.full_like(label))
}

/// Negative mean absolute difference between two generations from different
/// noise. Lower when the outputs are further apart.
pub fn diversity_loss(generated1: &Tensor, generated2: &Tensor) -> Tensor {
    -(generated1 - generated2).abs().mean(Kind::Float)
}

#[derive(Debug)]
pub struct GeneratorLoss {
    pub fake_loss: Tensor,
    pub similarity_loss: Tensor,
    pub total_loss: Tensor,
}

impl GeneratorLoss {
    /// The generator wants both heads to call its output real.
    pub fn new(fake: &DiscriminatorOutput, generated1: &Tensor, generated2: &Tensor) -> Self {
        let fake_loss = bce_with_label(&fake.global, 1.0) + bce_with_label(&fake.pixel, 1.0);
        let similarity_loss = diversity_loss(generated1, generated2);
        let total_loss = &fake_loss + &similarity_loss;

        Self {
            fake_loss,
            similarity_loss,
            total_loss,
        }
    }
}

#[derive(Debug)]
pub struct DiscriminatorLoss {
    pub real_loss: Tensor,
    pub fake_loss: Tensor,
    pub mixed_loss: Tensor,
    pub total_loss: Tensor,
}

impl DiscriminatorLoss {
    /// The pixel logits of the mixed sample are trained against the CutMix
    /// `mask`, where 1 marks real pixels.
    pub fn new(
        real: &DiscriminatorOutput,
        fake: &DiscriminatorOutput,
        mixed_pixel: &Tensor,
        mask: &Tensor,
    ) -> Result<Self> {
        let (bsize, _c, height, width) = mask.size4()?;
        ensure!(
            mixed_pixel.size() == vec![bsize, 1, height, width],
            "pixel logits {:?} do not match the mask {:?}",
            mixed_pixel.size(),
            mask.size()
        );

        let real_loss = bce_with_label(&real.global, 1.0) + bce_with_label(&real.pixel, 1.0);
        let fake_loss = bce_with_label(&fake.global, 0.0) + bce_with_label(&fake.pixel, 0.0);
        let mixed_loss = bce_with_logits(mixed_pixel, &mask.narrow(1, 0, 1));
        let total_loss = &real_loss + &fake_loss + &mixed_loss;

        Ok(Self {
            real_loss,
            fake_loss,
            mixed_loss,
            total_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn constant_output(value: f64) -> DiscriminatorOutput {
        DiscriminatorOutput {
            global: Tensor::full(&[2, 1, 2, 4], value, FLOAT_CPU),
            pixel: Tensor::full(&[2, 1, 8, 16], value, FLOAT_CPU),
        }
    }

    #[test]
    fn bce_test() {
        let logits = Tensor::zeros(&[3, 5], FLOAT_CPU);
        assert_abs_diff_eq!(
            f64::from(bce_with_label(&logits, 1.0)),
            2f64.ln(),
            epsilon = 1e-6
        );

        // confident and right is cheap, confident and wrong is not
        let logits = Tensor::full(&[4], 10.0, FLOAT_CPU);
        assert!(f64::from(bce_with_label(&logits, 1.0)) < 1e-3);
        assert!(f64::from(bce_with_label(&logits, 0.0)) > 9.0);
    }

    #[test]
    fn diversity_loss_test() {
        let lhs = Tensor::zeros(&[2, 3, 4, 4], FLOAT_CPU);
        let rhs = Tensor::ones(&[2, 3, 4, 4], FLOAT_CPU) * 0.5;
        assert_abs_diff_eq!(f64::from(diversity_loss(&lhs, &lhs)), 0.0);
        assert_abs_diff_eq!(f64::from(diversity_loss(&lhs, &rhs)), -0.5, epsilon = 1e-6);
    }

    #[test]
    fn gan_losses_test() -> Result<()> {
        let neutral = constant_output(0.0);
        let mask = Tensor::ones(&[2, 3, 8, 16], FLOAT_CPU);
        let generated = Tensor::zeros(&[2, 3, 8, 16], FLOAT_CPU);

        let GeneratorLoss {
            fake_loss,
            similarity_loss,
            total_loss,
        } = GeneratorLoss::new(&neutral, &generated, &generated);
        assert_abs_diff_eq!(f64::from(fake_loss), 2.0 * 2f64.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(similarity_loss), 0.0);
        assert_abs_diff_eq!(f64::from(total_loss), 2.0 * 2f64.ln(), epsilon = 1e-6);

        let loss = DiscriminatorLoss::new(&neutral, &neutral, &neutral.pixel, &mask)?;
        assert_abs_diff_eq!(f64::from(loss.total_loss), 5.0 * 2f64.ln(), epsilon = 1e-5);

        // a perfect discriminator has near zero loss
        let real = constant_output(20.0);
        let fake = constant_output(-20.0);
        let loss = DiscriminatorLoss::new(&real, &fake, &real.pixel, &mask)?;
        ensure!(f64::from(loss.total_loss) < 1e-6);

        let wrong_mask = Tensor::ones(&[2, 1, 4, 16], FLOAT_CPU);
        ensure!(DiscriminatorLoss::new(&real, &fake, &real.pixel, &wrong_mask).is_err());

        Ok(())
    }
}
