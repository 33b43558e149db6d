pub mod chat;
pub mod embeddings;
pub mod models;
pub mod responses;
pub mod sse;

pub use sse::{SseFrame, SseFrameParser};
