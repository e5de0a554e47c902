//! 模型层：客户端抽象、线协议与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）

pub mod deepseek;
pub mod embedding;
pub mod mock;
pub mod openai;
pub mod protocol;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use embedding::{create_embedder_from_config, Embedder, HashingEmbedder, OpenAiEmbedder};
pub use mock::{MockModelClient, Scripted, ScriptedModelClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use protocol::{parse_model_output, render_system_prompt};
pub use traits::{
    assemble_stream, ModelClient, ModelError, ModelEvent, ModelEventStream, ModelRequest,
    ModelResponse, RetryConfig, RetryingModelClient,
};
