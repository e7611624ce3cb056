//! Spatial resampling: average pooling and upsampling of NCHW tensors.

use ndarray::*;
use serde::{Deserialize, Serialize};

use crate::error::{ConvError, Result};
use crate::module::{Module, NamedParameter, NamedParameterMut, Parameterized};
use crate::{Element, KernelSize};

/// Interpolation used by [`upsample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsampleMode {
    Nearest,
    /// Bilinear interpolation with half-pixel centers (`align_corners = false`).
    Bilinear,
}

impl Default for UpsampleMode {
    fn default() -> Self {
        UpsampleMode::Nearest
    }
}

/// Average pooling over non-overlapping windows (stride = kernel size, no padding).
/// Rows and columns that do not fill a whole window are dropped.
pub fn avg_pool2d<'a, V, F>(input: V, kernel_size: KernelSize) -> Result<Array4<F>>
where
    V: AsArray<'a, F, Ix4>,
    F: Element,
{
    let input: ArrayView4<F> = input.into();
    let (batch, channels, height, width) = input.dim();
    let KernelSize {
        height: kh,
        width: kw,
    } = kernel_size;
    if kh == 0 || kw == 0 {
        return Err(ConvError::InvalidParameter(
            "pooling window must not be empty".to_string(),
        ));
    }
    let (out_h, out_w) = (height / kh, width / kw);
    if out_h == 0 || out_w == 0 {
        return Err(ConvError::InputTooSmall {
            height,
            width,
            window_h: kh,
            window_w: kw,
        });
    }

    let count = F::from(kh * kw).unwrap_or_else(F::one);
    let mut output = Array4::zeros((batch, channels, out_h, out_w));
    for i in 0..out_h {
        for j in 0..out_w {
            let window_sum = input
                .slice(s![.., .., i * kh..(i + 1) * kh, j * kw..(j + 1) * kw])
                .sum_axis(Axis(3))
                .sum_axis(Axis(2));
            output
                .slice_mut(s![.., .., i, j])
                .assign(&window_sum.mapv(|v| v / count));
        }
    }
    Ok(output)
}

/// Upsamples height and width by an integer factor.
pub fn upsample<'a, V, F>(input: V, scale_factor: usize, mode: UpsampleMode) -> Result<Array4<F>>
where
    V: AsArray<'a, F, Ix4>,
    F: Element,
{
    let input: ArrayView4<F> = input.into();
    if scale_factor == 0 {
        return Err(ConvError::InvalidParameter(
            "scale factor must be positive".to_string(),
        ));
    }
    let (batch, channels, height, width) = input.dim();
    let (out_h, out_w) = (height * scale_factor, width * scale_factor);

    let output = match mode {
        UpsampleMode::Nearest => Array4::from_shape_fn((batch, channels, out_h, out_w), |(n, c, y, x)| {
            input[[n, c, y / scale_factor, x / scale_factor]]
        }),
        UpsampleMode::Bilinear => {
            let rows = source_taps(height, out_h, scale_factor);
            let cols = source_taps(width, out_w, scale_factor);
            Array4::from_shape_fn((batch, channels, out_h, out_w), |(n, c, y, x)| {
                let (y0, y1, ly) = rows[y];
                let (x0, x1, lx) = cols[x];
                let top = input[[n, c, y0, x0]].to_f64().unwrap_or(0.) * (1.0 - lx)
                    + input[[n, c, y0, x1]].to_f64().unwrap_or(0.) * lx;
                let bottom = input[[n, c, y1, x0]].to_f64().unwrap_or(0.) * (1.0 - lx)
                    + input[[n, c, y1, x1]].to_f64().unwrap_or(0.) * lx;
                F::from(top * (1.0 - ly) + bottom * ly).unwrap_or_else(F::zero)
            })
        }
    };
    Ok(output)
}

/// For every output index: the two neighbouring source indices and the weight of the second.
fn source_taps(input: usize, output: usize, scale_factor: usize) -> Vec<(usize, usize, f64)> {
    let scale = 1.0 / scale_factor as f64;
    (0..output)
        .map(|dst| {
            let src = (scale * (dst as f64 + 0.5) - 0.5).max(0.0);
            let lo = (src.floor() as usize).min(input - 1);
            let hi = (lo + 1).min(input - 1);
            (lo, hi, src - lo as f64)
        })
        .collect()
}

/// [`avg_pool2d`] as a single-tensor stage.
#[derive(Debug, Clone, Copy)]
pub struct AvgPool2d {
    pub kernel_size: KernelSize,
}

impl AvgPool2d {
    pub fn new(kernel_size: impl Into<KernelSize>) -> Self {
        AvgPool2d {
            kernel_size: kernel_size.into(),
        }
    }
}

impl<F: Element> Parameterized<F> for AvgPool2d {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        Vec::new()
    }
}

impl<F: Element> Module<F> for AvgPool2d {
    fn forward(&mut self, x: &Array4<F>) -> Result<Array4<F>> {
        avg_pool2d(x, self.kernel_size)
    }
}

/// [`upsample`] as a single-tensor stage.
#[derive(Debug, Clone, Copy)]
pub struct Upsample {
    pub scale_factor: usize,
    pub mode: UpsampleMode,
}

impl Upsample {
    pub fn new(scale_factor: usize, mode: UpsampleMode) -> Self {
        Upsample { scale_factor, mode }
    }
}

impl<F: Element> Parameterized<F> for Upsample {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        Vec::new()
    }
}

impl<F: Element> Module<F> for Upsample {
    fn forward(&mut self, x: &Array4<F>) -> Result<Array4<F>> {
        upsample(x, self.scale_factor, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f64> {
        let len = shape.0 * shape.1 * shape.2 * shape.3;
        Array::from_shape_vec(shape, (0..len).map(|v| v as f64).collect()).unwrap()
    }

    #[test]
    fn avg_pool_averages_windows() {
        let input = ramp((1, 1, 4, 4));
        let output = avg_pool2d(&input, KernelSize::from(2)).unwrap();
        assert_eq!(output.dim(), (1, 1, 2, 2));
        // (0 + 1 + 4 + 5) / 4, ...
        assert_eq!(output.into_raw_vec(), vec![2.5, 4.5, 10.5, 12.5]);
    }

    #[test]
    fn avg_pool_drops_ragged_border() {
        let input = ramp((2, 3, 5, 7));
        let output = avg_pool2d(&input, KernelSize::from((2, 3))).unwrap();
        assert_eq!(output.dim(), (2, 3, 2, 2));
        assert!(matches!(
            avg_pool2d(&input, KernelSize::from(8)),
            Err(ConvError::InputTooSmall { .. })
        ));
    }

    #[test]
    fn nearest_repeats_pixels() {
        let input = ramp((1, 1, 2, 2));
        let output = upsample(&input, 2, UpsampleMode::Nearest).unwrap();
        assert_eq!(
            output.into_raw_vec(),
            vec![0., 0., 1., 1., 0., 0., 1., 1., 2., 2., 3., 3., 2., 2., 3., 3.]
        );
    }

    #[test]
    fn bilinear_uses_half_pixel_centers() {
        let input = Array::from_shape_vec((1, 1, 1, 2), vec![0.0f64, 1.0]).unwrap();
        let output = upsample(&input, 2, UpsampleMode::Bilinear).unwrap();
        // torch.nn.functional.interpolate(..., scale_factor=2, mode="bilinear")
        let expected = [0.0, 0.25, 0.75, 1.0];
        for r in 0..2 {
            for (x, e) in expected.iter().enumerate() {
                assert_abs_diff_eq!(output[[0, 0, r, x]], *e, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn bilinear_keeps_constant_images_constant() {
        let input = Array4::from_elem((1, 2, 3, 3), 0.5f32);
        let output = upsample(&input, 3, UpsampleMode::Bilinear).unwrap();
        assert_eq!(output.dim(), (1, 2, 9, 9));
        assert!(output.iter().all(|v| (*v - 0.5).abs() < 1e-6));
    }
}
