// Image backend abstraction: a streaming call that yields binary payloads and text

use anyhow::Result;
use bytes::Bytes;
use futures_util::stream::BoxStream;

/// One incremental piece of a streamed generation response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationChunk {
    Image { mime_type: String, data: Bytes },
    Text(String),
}

/// Parameters for a single generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub aspect_ratio: String,
}

pub type ChunkStream = BoxStream<'static, Result<GenerationChunk>>;

/// Backend that turns a prompt into a stream of image payloads
#[async_trait::async_trait]
pub trait ImageBackend: Send + Sync {
    /// Start a generation call. Errors before the first chunk are returned here,
    /// errors mid-stream are yielded as stream items.
    async fn generate(&self, request: GenerationRequest) -> Result<ChunkStream>;

    fn name(&self) -> &str;
}
