use std::time::Duration;

use log::debug;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::GrpcMethod;
use tonic_prost::ProstCodec;

use crate::messages::{Empty, LatexReply, LatexRequest, ServerConfig, ServerIsReadyReply};
use crate::{RpcError, SERVICE_NAME};

const GENERATE_LATEX: &str = "/latexocr.LatexOCR/GenerateLatex";
const IS_READY: &str = "/latexocr.LatexOCR/IsReady";
const GET_CONFIG: &str = "/latexocr.LatexOCR/GetConfig";

/// Client for a `latex_ocr_server` listening on localhost.
///
/// Cloning is cheap: clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct LatexOcrClient {
    inner: tonic::client::Grpc<Channel>,
}

impl LatexOcrClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Endpoint of a server on `localhost:<port>` (no transport encryption).
    pub fn endpoint(port: u16) -> Result<Endpoint, RpcError> {
        Ok(Endpoint::from_shared(format!("http://localhost:{}", port))?)
    }

    /// Create a client whose channel connects on first use.
    ///
    /// Never blocks; must be called from within a tokio runtime.
    pub fn connect_lazy(port: u16) -> Result<Self, RpcError> {
        let channel = Self::endpoint(port)?.connect_lazy();
        Ok(Self::new(channel))
    }

    /// Connect eagerly, failing with [`RpcError::Timeout`] if the server does
    /// not accept the connection within `deadline`.
    pub async fn connect(port: u16, deadline: Duration) -> Result<Self, RpcError> {
        let endpoint = Self::endpoint(port)?.connect_timeout(deadline);
        let channel = tokio::time::timeout(deadline, endpoint.connect())
            .await
            .map_err(|_| RpcError::Timeout(deadline))??;
        debug!("Connected to latex_ocr_server on port {}", port);
        Ok(Self::new(channel))
    }

    /// `GenerateLatex(image_path) -> latex`
    pub async fn generate_latex(&mut self, image_path: &str) -> Result<String, RpcError> {
        let request = LatexRequest {
            image_path: image_path.to_string(),
        };
        let reply: LatexReply = self.unary("GenerateLatex", GENERATE_LATEX, request).await?;
        Ok(reply.latex)
    }

    /// `IsReady() -> is_ready`
    pub async fn is_ready(&mut self) -> Result<bool, RpcError> {
        let reply: ServerIsReadyReply = self.unary("IsReady", IS_READY, Empty {}).await?;
        Ok(reply.is_ready)
    }

    /// `GetConfig() -> (device, cache_dir)`
    pub async fn get_config(&mut self) -> Result<ServerConfig, RpcError> {
        self.unary("GetConfig", GET_CONFIG, Empty {}).await
    }

    async fn unary<Req, Resp>(
        &mut self,
        method: &'static str,
        path: &'static str,
        message: Req,
    ) -> Result<Resp, RpcError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner.ready().await?;

        let codec = ProstCodec::<Req, Resp>::default();
        let mut request = tonic::Request::new(message);
        request
            .extensions_mut()
            .insert(GrpcMethod::new(SERVICE_NAME, method));

        let response = self
            .inner
            .unary(request, PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }
}
