mod openai;

pub use openai::{ChatClient, ChatConfig, ChatMessage, LlmError};
