pub mod chunk;
pub mod engine;
pub mod faq;
pub mod graph;
pub mod progress;
pub mod task;
