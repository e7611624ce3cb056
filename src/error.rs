use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{channels} channels cannot be split into {groups} groups")]
    ChannelsNotDivisible { channels: usize, groups: usize },

    #[error("Gated convolution needs an even number of output channels, got {0}")]
    OddGatedChannels(usize),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Input of size {height}x{width} is smaller than the window {window_h}x{window_w}")]
    InputTooSmall {
        height: usize,
        width: usize,
        window_h: usize,
        window_w: usize,
    },

    #[error("Reshape failed: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Parameter '{0}' is missing")]
    MissingParameter(String),

    #[error("Failed to read npy file: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("Failed to write npy file: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConvError>;

impl ConvError {
    pub(crate) fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        ConvError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
