//! Image folder datasets
//!
//! The training set is a folder with `input/` (degraded) and `target/` (clean)
//! subfolders whose files pair up by name. The real set is a flat folder of
//! unpaired underwater photographs. Images are resized to a square and
//! scaled to `[-1, 1]` in CHW layout.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;
use tracing::{debug, info, instrument};

use super::{Dataset, Sample};
use crate::error::{Error, Result};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Paired (degraded, clean) training images
pub struct PairedImageDataset {
    name: String,
    inputs: Vec<PathBuf>,
    targets: Vec<PathBuf>,
    image_size: u32,
}

impl PairedImageDataset {
    /// Open `root/input` and `root/target`; every input needs a target of the same name
    #[instrument(skip(root), fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>, image_size: u32) -> Result<Self> {
        let root = root.as_ref();
        let input_dir = root.join("input");
        let target_dir = root.join("target");

        let inputs = list_images(&input_dir)?;
        if inputs.is_empty() {
            return Err(Error::data(format!(
                "no training images found in {}",
                input_dir.display()
            )));
        }

        let mut targets = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let file_name = input.file_name().unwrap_or_default();
            let target = target_dir.join(file_name);
            if !target.is_file() {
                return Err(Error::data(format!(
                    "missing clean target for {}",
                    input.display()
                )));
            }
            targets.push(target);
        }

        info!("Loaded paired dataset with {} samples", inputs.len());
        Ok(Self {
            name: dataset_name(root),
            inputs,
            targets,
            image_size,
        })
    }
}

impl Dataset for PairedImageDataset {
    fn len(&self) -> usize {
        self.inputs.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.len() {
            return Err(Error::data(format!(
                "invalid sample index: {index} >= {}",
                self.len()
            )));
        }
        Ok(Sample {
            id: sample_id(&self.inputs[index]),
            input: load_image(&self.inputs[index], self.image_size)?,
            target: Some(load_image(&self.targets[index], self.image_size)?),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Unpaired real underwater images
pub struct RealImageDataset {
    name: String,
    images: Vec<PathBuf>,
    image_size: u32,
}

impl RealImageDataset {
    pub fn open(root: impl AsRef<Path>, image_size: u32) -> Result<Self> {
        let root = root.as_ref();
        let images = list_images(root)?;
        info!(
            "Loaded real dataset {} with {} images",
            root.display(),
            images.len()
        );
        Ok(Self {
            name: dataset_name(root),
            images,
            image_size,
        })
    }
}

impl Dataset for RealImageDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let path = self.images.get(index).ok_or_else(|| {
            Error::data(format!("invalid sample index: {index} >= {}", self.len()))
        })?;
        Ok(Sample {
            id: sample_id(path),
            input: load_image(path, self.image_size)?,
            target: None,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sorted image files directly inside `dir`
fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::data(format!("dataset not found: {}", dir.display())));
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.extension()
                .and_then(|s| s.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    debug!("Found {} images in {}", paths.len(), dir.display());
    Ok(paths)
}

fn sample_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dataset_name(root: &Path) -> String {
    root.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string())
}

/// Decode an image, resize it to `size x size` and scale it to `[-1, 1]`
pub fn load_image(path: &Path, size: u32) -> Result<Tensor> {
    let img = image::open(path)?.to_rgb8();
    let img = if img.dimensions() == (size, size) {
        img
    } else {
        image::imageops::resize(&img, size, size, FilterType::Triangle)
    };

    let plane = (size * size) as usize;
    let mut chw = vec![0.0f32; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * size + x) as usize;
        for channel in 0..3 {
            chw[channel * plane + base] = pixel[channel] as f32 / 127.5 - 1.0;
        }
    }
    Ok(Tensor::from_vec(
        chw,
        (3, size as usize, size as usize),
        &Device::Cpu,
    )?)
}

/// Write a `(3, H, W)` tensor in `[-1, 1]` as an 8-bit image
pub fn save_image(tensor: &Tensor, path: &Path) -> Result<()> {
    let (channels, height, width) = tensor.dims3()?;
    if channels != 3 {
        return Err(Error::invalid_input(format!(
            "expected 3 channels, got {channels}"
        )));
    }
    let values: Vec<f32> = tensor
        .to_device(&Device::Cpu)?
        .to_dtype(candle_core::DType::F32)?
        .clamp(-1.0f32, 1.0f32)?
        .flatten_all()?
        .to_vec1()?;

    let plane = height * width;
    let img = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let base = y as usize * width + x as usize;
        let px = |c: usize| ((values[c * plane + base] + 1.0) * 127.5).round() as u8;
        image::Rgb([px(0), px(1), px(2)])
    });
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    fn write_png(path: &Path, size: u32, color: [u8; 3]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(size, size, Rgb(color)).save(path).unwrap();
    }

    #[test]
    fn test_paired_dataset_loads_scaled_images() {
        let dir = TempDir::new().unwrap();
        for name in ["b.png", "a.png"] {
            write_png(&dir.path().join("input").join(name), 8, [255, 0, 0]);
            write_png(&dir.path().join("target").join(name), 8, [0, 0, 255]);
        }

        let dataset = PairedImageDataset::open(dir.path(), 4).unwrap();
        assert_eq!(dataset.len(), 2);

        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.id, "a");
        assert_eq!(sample.input.dims(), &[3, 4, 4]);
        let red: Vec<f32> = sample.input.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(red.iter().all(|v| (*v - 1.0).abs() < 1e-6));
        let green: Vec<f32> = sample.input.get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(green.iter().all(|v| (*v + 1.0).abs() < 1e-6));
        assert!(sample.target.is_some());

        assert!(dataset.get(2).is_err());
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_png(&dir.path().join("input/x.png"), 4, [1, 2, 3]);
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        assert!(matches!(
            PairedImageDataset::open(dir.path(), 4),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn test_real_dataset_is_unpaired() {
        let dir = TempDir::new().unwrap();
        write_png(&dir.path().join("reef.jpg"), 6, [10, 120, 200]);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let dataset = RealImageDataset::open(dir.path(), 4).unwrap();
        assert_eq!(dataset.len(), 1);
        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.id, "reef");
        assert!(sample.target.is_none());
    }

    #[test]
    fn test_save_image_writes_png() {
        let dir = TempDir::new().unwrap();
        let tensor = Tensor::zeros((3, 5, 7), candle_core::DType::F32, &Device::Cpu).unwrap();
        let path = dir.path().join("nested/out.png");
        save_image(&tensor, &path).unwrap();

        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (7, 5));
        // 0.0 maps to mid-grey
        assert_eq!(img.get_pixel(0, 0)[0], 128);
    }
}
