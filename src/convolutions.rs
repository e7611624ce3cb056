//! Module that contains classical convolutions, as used f.e. in convolutional neural networks.
//!
//! More can be read here:
//! - <https://towardsdatascience.com/a-comprehensive-guide-to-convolutional-neural-networks-the-eli5-way-3bd2b1164a53?gi=f4a37beea40b>

use log::debug;
use ndarray::*;
use num_traits::Float;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::config::ConvConfig;
use crate::error::{ConvError, Result};
use crate::module::{Module, NamedParameter, NamedParameterMut, Parameterized};
use crate::{ConvKernel, DataRepresentation, Element, Padding};

/// Rust implementation of a convolutional layer.
/// The weight matrix shall have dimension (in that order)
/// (output channels, input channels / groups, kernel height, kernel width),
/// to comply with the order in which pytorch weights are saved.
#[derive(Debug, Clone)]
pub struct ConvolutionLayer<F: Float> {
    /// Weight matrix of the kernel
    pub(crate) kernel: ConvKernel<F>,
    pub(crate) bias: Option<Array1<F>>,
    pub(crate) stride: usize,
    pub(crate) padding: Padding,
    pub(crate) dilation: usize,
    pub(crate) groups: usize,
}

impl<F: Element> ConvolutionLayer<F> {
    /// Creates new convolution layer without dilation or groups.
    /// The weights are given in Pytorch layout.
    /// (out channels, in channels, kernel height, kernel width)
    /// Bias: (out channels)
    pub fn new(
        weights: ConvKernel<F>,
        bias_array: Option<Array1<F>>,
        stride: usize,
        padding: Padding,
    ) -> Result<ConvolutionLayer<F>> {
        ConvolutionLayer::with_options(weights, bias_array, stride, padding, 1, 1)
    }

    /// Creates new convolution layer with every option spelled out.
    /// With `groups > 1`, the second weight axis holds in channels / groups.
    pub fn with_options(
        weights: ConvKernel<F>,
        bias_array: Option<Array1<F>>,
        stride: usize,
        padding: Padding,
        dilation: usize,
        groups: usize,
    ) -> Result<ConvolutionLayer<F>> {
        if stride == 0 || dilation == 0 || groups == 0 {
            return Err(ConvError::InvalidParameter(format!(
                "stride ({}), dilation ({}) and groups ({}) must be positive",
                stride, dilation, groups
            )));
        }
        let (out_channels, _, kernel_h, kernel_w) = weights.dim();
        if kernel_h == 0 || kernel_w == 0 {
            return Err(ConvError::InvalidParameter(
                "kernel must not be empty".to_string(),
            ));
        }
        if out_channels % groups != 0 {
            return Err(ConvError::ChannelsNotDivisible {
                channels: out_channels,
                groups,
            });
        }
        if let Some(b) = &bias_array {
            if b.len() != out_channels {
                return Err(ConvError::shape_mismatch(&[out_channels], b.shape()));
            }
        }
        Ok(ConvolutionLayer {
            kernel: weights,
            bias: bias_array,
            stride,
            padding,
            dilation,
            groups,
        })
    }

    /// Creates new convolution layer. The weights are given in
    /// Tensorflow layout.
    /// (kernel height, kernel width, in channels, out channels)
    pub fn new_tf(
        weights: ConvKernel<F>,
        bias_array: Option<Array1<F>>,
        stride: usize,
        padding: Padding,
    ) -> Result<ConvolutionLayer<F>> {
        // permuted_axes leaves a non-contiguous view behind,
        // im2col wants the weights in standard layout
        let permuted_array = weights
            .view()
            .permuted_axes([3, 2, 0, 1])
            .as_standard_layout()
            .into_owned();
        ConvolutionLayer::new(permuted_array, bias_array, stride, padding)
    }

    /// Creates a layer described by `config` with Pytorch's default initialisation:
    /// weights and bias are drawn uniformly from `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    pub fn from_config<R: Rng + ?Sized>(config: &ConvConfig, rng: &mut R) -> Result<ConvolutionLayer<F>> {
        config.validate()?;
        let shape = config.kernel_shape();
        let fan_in = shape.1 * shape.2 * shape.3;
        let bound = F::from(1.0 / (fan_in as f64).sqrt()).unwrap_or_else(F::one);
        let dist = Uniform::new_inclusive(-bound, bound);

        let kernel = Array4::from_shape_simple_fn(shape, || dist.sample(&mut *rng));
        let bias = if config.bias {
            Some(Array1::from_shape_simple_fn(config.out_channels, || dist.sample(&mut *rng)))
        } else {
            None
        };
        debug!(
            "initialised convolution {} -> {}, kernel {:?}, fan in {}",
            config.in_channels, config.out_channels, config.kernel_size, fan_in
        );
        ConvolutionLayer::with_options(
            kernel,
            bias,
            config.stride,
            config.padding,
            config.dilation,
            config.groups,
        )
    }

    /// Analog to conv2d.
    pub fn convolve(&self, image: &DataRepresentation<F>) -> Result<DataRepresentation<F>> {
        conv2d(
            &self.kernel,
            self.bias.as_ref(),
            image,
            self.padding,
            self.stride,
            self.dilation,
            self.groups,
        )
    }

    pub fn kernel(&self) -> &ConvKernel<F> {
        &self.kernel
    }

    pub fn bias(&self) -> Option<&Array1<F>> {
        self.bias.as_ref()
    }

    /// Replaces weights and bias, keeping the layer's shape.
    pub fn set_weights(&mut self, kernel: ConvKernel<F>, bias: Option<Array1<F>>) -> Result<()> {
        if kernel.dim() != self.kernel.dim() {
            return Err(ConvError::shape_mismatch(self.kernel.shape(), kernel.shape()));
        }
        if let Some(b) = &bias {
            if b.len() != self.out_channels() {
                return Err(ConvError::shape_mismatch(&[self.out_channels()], b.shape()));
            }
        }
        self.kernel = kernel;
        self.bias = bias;
        Ok(())
    }

    pub fn in_channels(&self) -> usize {
        self.kernel.len_of(Axis(1)) * self.groups
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.len_of(Axis(0))
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }

    pub fn groups(&self) -> usize {
        self.groups
    }
}

impl<F: Element> Parameterized<F> for ConvolutionLayer<F> {
    fn parameters(&self) -> Vec<NamedParameter<'_, F>> {
        let mut params = vec![("weight".to_string(), self.kernel.view().into_dyn())];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b.view().into_dyn()));
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<NamedParameterMut<'_, F>> {
        let mut params = vec![("weight".to_string(), self.kernel.view_mut().into_dyn())];
        if let Some(b) = &mut self.bias {
            params.push(("bias".to_string(), b.view_mut().into_dyn()));
        }
        params
    }
}

impl<F: Element> Module<F> for ConvolutionLayer<F> {
    fn forward(&mut self, x: &Array4<F>) -> Result<Array4<F>> {
        self.convolve(x)
    }
}

/// Spatial output extent of a convolution along one axis, after padding was added.
pub fn output_extent(padded_input: usize, kernel: usize, stride: usize, dilation: usize) -> Option<usize> {
    let effective_kernel = dilation * (kernel - 1) + 1;
    if padded_input < effective_kernel {
        None
    } else {
        Some((padded_input - effective_kernel) / stride + 1)
    }
}

/// Unrolls every receptive field of a (C, H, W) image into one row.
/// Returns a (new_h * new_w, C * kh * kw) matrix; the column order matches a
/// (F, C, kh, kw) kernel flattened to (F, C * kh * kw).
pub(crate) fn im2col_ref<'a, T, F: 'a + Float>(
    im_arr: T,
    ker_height: usize,
    ker_width: usize,
    dilation: usize,
    stride: usize,
    new_h: usize,
    new_w: usize,
) -> Array2<F>
where
    T: AsArray<'a, F, Ix3>,
{
    let im2d_arr: ArrayView3<F> = im_arr.into();
    let im_channel = im2d_arr.len_of(Axis(0));
    let span_h = dilation * (ker_height - 1) + 1;
    let span_w = dilation * (ker_width - 1) + 1;
    let mut cols_img: Array2<F> =
        Array::zeros((new_h * new_w, im_channel * ker_height * ker_width));
    let mut cont = 0_usize;
    for i in 0..new_h {
        for j in 0..new_w {
            let top = i * stride;
            let left = j * stride;
            let patch = im2d_arr.slice(s![
                ..,
                top..top + span_h;dilation,
                left..left + span_w;dilation
            ]);
            cols_img
                .row_mut(cont)
                .iter_mut()
                .zip(patch.iter())
                .for_each(|(dst, src)| *dst = *src);
            cont += 1;
        }
    }
    cols_img
}

/// Performs a convolution on the given image data using this layers parameters.
/// We always convolve on flattened images and expect the input array in im2col
/// style format.
///
/// Read more here:
/// - <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>
///
/// Input:
/// -----------------------------------------------
/// - kernel_weights: weights of shape (F, C / groups, HH, WW)
/// - im2d: Input data of shape (N, C, H, W)
/// -----------------------------------------------
/// - 'padding': "Same", "Valid" or an explicit amount of zeros per side
/// - 'stride': The number of pixels between adjacent receptive fields in the
///     horizontal and vertical directions, must be int
/// - 'dilation': Spacing between kernel taps
/// - 'groups': Input and output channels are split into this many independent groups
///
/// Returns:
/// -----------------------------------------------
/// - out: Output data, of shape (N, F, H', W')
pub fn conv2d<'a, T, V, F: Element>(
    kernel_weights: T,
    bias: Option<&Array1<F>>,
    im2d: V,
    padding: Padding,
    stride: usize,
    dilation: usize,
    groups: usize,
) -> Result<DataRepresentation<F>>
where
    // This trait bound ensures that kernel and im2d can be passed as owned array or view.
    // AsArray just ensures that im2d can be converted to an array view via ".into()".
    // Read more here: https://docs.rs/ndarray/0.12.1/ndarray/trait.AsArray.html
    V: AsArray<'a, F, Ix4>,
    T: AsArray<'a, F, Ix4>,
{
    let im2d_arr: ArrayView4<F> = im2d.into();
    let kernel_weights_arr: ArrayView4<F> = kernel_weights.into();
    if stride == 0 || dilation == 0 || groups == 0 {
        return Err(ConvError::InvalidParameter(
            "stride, dilation and groups must be positive".to_string(),
        ));
    }

    let (num_filters, group_channels, kernel_height, kernel_width) = kernel_weights_arr.dim();
    if kernel_height == 0 || kernel_width == 0 {
        return Err(ConvError::InvalidParameter(
            "kernel must not be empty".to_string(),
        ));
    }
    let (batch, im_channel, im_height, im_width) = im2d_arr.dim();
    if group_channels * groups != im_channel || num_filters % groups != 0 {
        return Err(ConvError::shape_mismatch(
            &[num_filters, im_channel / groups, kernel_height, kernel_width],
            kernel_weights_arr.shape(),
        ));
    }

    let span_h = dilation * (kernel_height - 1) + 1;
    let span_w = dilation * (kernel_width - 1) + 1;
    if im_height == 0 || im_width == 0 {
        return Err(ConvError::InputTooSmall {
            height: im_height,
            width: im_width,
            window_h: span_h,
            window_w: span_w,
        });
    }
    let (pad_top, pad_bottom, pad_left, pad_right) =
        padding.amounts(im_height, im_width, span_h, span_w, stride);
    let im_height_pad = im_height + pad_top + pad_bottom;
    let im_width_pad = im_width + pad_left + pad_right;

    let too_small = ConvError::InputTooSmall {
        height: im_height_pad,
        width: im_width_pad,
        window_h: span_h,
        window_w: span_w,
    };
    let new_im_height = match output_extent(im_height_pad, kernel_height, stride, dilation) {
        Some(h) => h,
        None => return Err(too_small),
    };
    let new_im_width = match output_extent(im_width_pad, kernel_width, stride, dilation) {
        Some(w) => w,
        None => return Err(too_small),
    };

    let padded: CowArray<F, Ix4> = if (pad_top, pad_bottom, pad_left, pad_right) == (0, 0, 0, 0) {
        im2d_arr.into()
    } else {
        let mut im2d_arr_pad: Array4<F> =
            Array::zeros((batch, im_channel, im_height_pad, im_width_pad));
        // https://github.com/rust-ndarray/ndarray/issues/823
        im2d_arr_pad
            .slice_mut(s![
                ..,
                ..,
                pad_top..pad_top + im_height,
                pad_left..pad_left + im_width
            ])
            .assign(&im2d_arr);
        im2d_arr_pad.into()
    };

    // weights.reshape(F, HH*WW*C) per group
    let filters_per_group = num_filters / groups;
    let mut filter_cols = Vec::with_capacity(groups);
    for g in 0..groups {
        let filters = kernel_weights_arr
            .slice(s![g * filters_per_group..(g + 1) * filters_per_group, .., .., ..])
            .as_standard_layout()
            .into_owned()
            .into_shape((filters_per_group, group_channels * kernel_height * kernel_width))?;
        filter_cols.push(filters);
    }

    let mut output: Array4<F> = Array::zeros((batch, num_filters, new_im_height, new_im_width));
    for n in 0..batch {
        for (g, filter_col) in filter_cols.iter().enumerate() {
            let im_col = im2col_ref(
                padded.slice(s![n, g * group_channels..(g + 1) * group_channels, .., ..]),
                kernel_height,
                kernel_width,
                dilation,
                stride,
                new_im_height,
                new_im_width,
            );
            let mul = im_col.dot(&filter_col.t());
            let result = mul
                .into_shape((new_im_height, new_im_width, filters_per_group))?
                .permuted_axes([2, 0, 1]);
            output
                .slice_mut(s![n, g * filters_per_group..(g + 1) * filters_per_group, .., ..])
                .assign(&result);
        }
    }

    add_bias(&mut output, bias)?;
    Ok(output)
}

/// Bias laid out along the channel axis of an NCHW tensor, ready to broadcast.
pub(crate) fn channel_view<F: Float>(bias: &Array1<F>) -> Result<ArrayView4<'_, F>> {
    Ok(bias.view().into_shape((1, bias.len(), 1, 1))?)
}

pub(crate) fn add_bias<F: Element>(x: &mut Array4<F>, bias: Option<&Array1<F>>) -> Result<()> {
    if let Some(bias_array) = bias {
        if bias_array.len() != x.len_of(Axis(1)) {
            return Err(ConvError::shape_mismatch(&[x.len_of(Axis(1))], bias_array.shape()));
        }
        // Broadcasting with ndarray starts at the right side of the shape, so the
        // bias gets its channel axis put in place by hand.
        *x += &channel_view(bias_array)?;
    }
    Ok(())
}
