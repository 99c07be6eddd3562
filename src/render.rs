use crate::common::*;

/// Converts a `[3, H, W]` image in `[-1, 1]` to `[3, H, W]` bytes.
pub fn to_bytes(image: &Tensor) -> Tensor {
    ((image + 1.0) * 127.5)
        .clamp(0.0, 255.0)
        .to_kind(Kind::Uint8)
}

/// Concatenates `[C, H, W]` images side by side.
pub fn hconcat<T>(images: &[T]) -> Result<Tensor>
where
    T: Borrow<Tensor>,
{
    concat(images, 2)
}

/// Stacks `[C, H, W]` images top to bottom.
pub fn vconcat<T>(images: &[T]) -> Result<Tensor>
where
    T: Borrow<Tensor>,
{
    concat(images, 1)
}

fn concat<T>(images: &[T], dim: i64) -> Result<Tensor>
where
    T: Borrow<Tensor>,
{
    ensure!(!images.is_empty(), "nothing to concatenate");
    ensure!(
        images.iter().all(|image| image.borrow().dim() == 3),
        "expect [C, H, W] images"
    );
    Ok(Tensor::cat(images, dim))
}

/// Maps `[1, H, W]` logits to a gray `[3, H, W]` image in `[-1, 1]`.
pub fn logits_to_image(logits: &Tensor) -> Tensor {
    logits.tanh().repeat(&[3, 1, 1])
}

/// Writes a `[3, H, W]` image in `[-1, 1]` as PNG, creating parent
/// directories.
pub fn write_png(image: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let (channels, _h, _w) = image.size3()?;
    ensure!(channels == 3, "expect an RGB image, but get {} channels", channels);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let bytes = to_bytes(&image.to_device(Device::Cpu));
    tch::vision::image::save(&bytes, path)
        .with_context(|| format!("unable to write {}", path.display()))?;
    Ok(())
}
