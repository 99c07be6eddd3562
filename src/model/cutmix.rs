use crate::common::*;

/// Generates `[B, C, H, W]` CutMix masks with values in {0, 1}.
///
/// For each sample a rectangle of relative side `sqrt(U(0, 1))` is centered at
/// a uniformly drawn pixel, clipped to the image and zeroed. Half of the samples
/// are then inverted. The masks are created on the CPU.
pub fn cutmix_masks<R>(shape: [i64; 4], rng: &mut R) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let [bsize, _channels, height, width] = shape;
    ensure!(
        shape.iter().all(|&size| size > 0),
        "mask shape must be positive, but get {:?}",
        shape
    );

    let masks = Tensor::ones(&shape, FLOAT_CPU);

    for index in 0..bsize {
        let ratio = rng.gen::<f64>().sqrt();
        let cut_w = (width as f64 * ratio) as i64;
        let cut_h = (height as f64 * ratio) as i64;
        let center_x = rng.gen_range(0..width);
        let center_y = rng.gen_range(0..height);

        let x1 = (center_x - cut_w / 2).clamp(0, width);
        let x2 = (center_x + cut_w / 2).clamp(0, width);
        let y1 = (center_y - cut_h / 2).clamp(0, height);
        let y2 = (center_y + cut_h / 2).clamp(0, height);

        let mut sample = masks.get(index);
        let _ = sample
            .narrow(1, y1, y2 - y1)
            .narrow(2, x1, x2 - x1)
            .fill_(0.0);

        if rng.gen::<f64>() > 0.5 {
            let inverted = sample.ones_like() - &sample;
            sample.copy_(&inverted);
        }
    }

    Ok(masks)
}
