use std::path::Path;

use anyhow::Context;

/// Estimates how much of an image is skin-toned, as a percentage of its pixels.
pub trait SkinEstimator: Send + Sync {
    fn estimate(&self, path: &Path) -> anyhow::Result<f64>;
}

/// Thresholds each pixel in HSV and YCrCb space, opens each mask with a 3x3
/// kernel, intersects them, then smooths the result with a 3x3 median and a 4x4
/// opening before counting.
#[derive(Debug, Default, Clone, Copy)]
pub struct PixelSkinEstimator;

impl SkinEstimator for PixelSkinEstimator {
    fn estimate(&self, path: &Path) -> anyhow::Result<f64> {
        let img = image::open(path)
            .with_context(|| format!("open image {}", path.display()))?
            .to_rgb8();
        let (width, height) = (img.width() as usize, img.height() as usize);
        if width == 0 || height == 0 {
            return Ok(0.0);
        }

        let hsv = Mask::from_fn(width, height, |x, y| {
            in_hsv_range(img.get_pixel(x as u32, y as u32).0)
        })
        .open(3);
        let ycrcb = Mask::from_fn(width, height, |x, y| {
            in_ycrcb_range(img.get_pixel(x as u32, y as u32).0)
        })
        .open(3);
        let skin = hsv.and(&ycrcb).median3().open(4);

        Ok(skin.count() as f64 / (width * height) as f64 * 100.0)
    }
}

/// Binary image, row-major.
#[derive(Debug, Clone, PartialEq)]
struct Mask {
    width: usize,
    height: usize,
    bits: Vec<bool>,
}

impl Mask {
    fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> bool) -> Self {
        let bits = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Self {
            width,
            height,
            bits,
        }
    }

    fn at(&self, x: isize, y: isize) -> Option<bool> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(self.bits[y as usize * self.width + x as usize])
    }

    fn count(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }

    fn and(&self, other: &Mask) -> Mask {
        Mask::from_fn(self.width, self.height, |x, y| {
            let i = y * self.width + x;
            self.bits[i] && other.bits[i]
        })
    }

    /// Kernel offsets for a `k`x`k` square anchored at its centre.
    fn offsets(k: usize) -> std::ops::RangeInclusive<isize> {
        let anchor = (k / 2) as isize;
        -anchor..=(k as isize - 1 - anchor)
    }

    // Pixels outside the image never clear a pixel.
    fn erode(&self, k: usize) -> Mask {
        Mask::from_fn(self.width, self.height, |x, y| {
            Self::offsets(k).all(|dy| {
                Self::offsets(k).all(|dx| {
                    self.at(x as isize + dx, y as isize + dy).unwrap_or(true)
                })
            })
        })
    }

    // Reflected kernel, so that `open` never grows the mask.
    fn dilate(&self, k: usize) -> Mask {
        Mask::from_fn(self.width, self.height, |x, y| {
            Self::offsets(k).any(|dy| {
                Self::offsets(k).any(|dx| {
                    self.at(x as isize - dx, y as isize - dy).unwrap_or(false)
                })
            })
        })
    }

    fn open(&self, k: usize) -> Mask {
        self.erode(k).dilate(k)
    }

    /// 3x3 median with replicated borders: a majority vote over the neighbourhood.
    fn median3(&self) -> Mask {
        let (w, h) = (self.width as isize, self.height as isize);
        Mask::from_fn(self.width, self.height, |x, y| {
            let mut set = 0;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let nx = (x as isize + dx).clamp(0, w - 1);
                    let ny = (y as isize + dy).clamp(0, h - 1);
                    if self.at(nx, ny) == Some(true) {
                        set += 1;
                    }
                }
            }
            set >= 5
        })
    }
}

fn is_skin(rgb: [u8; 3]) -> bool {
    in_hsv_range(rgb) && in_ycrcb_range(rgb)
}

// Hue on the 0..180 scale used by 8-bit HSV images.
fn in_hsv_range([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let mut hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    let hue = hue / 2.0;

    hue <= 17.0 && (15.0..=170.0).contains(&saturation)
}

fn in_ycrcb_range([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cr = (r - y) * 0.713 + 128.0;
    let cb = (b - y) * 0.564 + 128.0;
    (135.0..=180.0).contains(&cr) && (85.0..=135.0).contains(&cb)
}
