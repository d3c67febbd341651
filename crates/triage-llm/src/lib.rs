pub mod embedder;
pub mod mock;
pub mod openai;
pub mod reliable;

pub use embedder::MockEmbedder;
pub use mock::{EchoProvider, MockProvider, MockResponse};
pub use openai::{OpenAiConfig, OpenAiEmbedder, OpenAiProvider};
pub use reliable::{ReliableConfig, ReliableProvider};
