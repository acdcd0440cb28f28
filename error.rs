use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image Error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ONNX Runtime Error: {0}")]
    Ort(#[from] ort::Error),

    #[error("Path Error: {0}")]
    Path(String),

    #[error("Initialization Failed: {0}")]
    Init(String),

    #[error("Invalid Configuration: {0}")]
    Config(String),

    #[error("Inference Failed: {0}")]
    Inference(String),

    #[error("Tag Store Error: {0}")]
    Store(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}
