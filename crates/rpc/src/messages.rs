//! Message types of `latex_ocr.proto`.
//!
//! Field tags must stay in sync with the Python server's generated code.

/// Request for `GenerateLatex`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LatexRequest {
    /// Absolute path of the image; the server opens the file itself.
    #[prost(string, tag = "1")]
    pub image_path: String,
}

/// Reply of `GenerateLatex`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LatexReply {
    #[prost(string, tag = "1")]
    pub latex: String,
}

/// Empty argument of `IsReady` and `GetConfig`.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Empty {}

/// Reply of `IsReady`. `false` while the model is still downloading or loading.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ServerIsReadyReply {
    #[prost(bool, tag = "1")]
    pub is_ready: bool,
}

/// Reply of `GetConfig`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerConfig {
    /// Torch device the model runs on, e.g. `cpu` or `cuda:0`.
    #[prost(string, tag = "1")]
    pub device: String,
    #[prost(string, tag = "2")]
    pub cache_dir: String,
}
