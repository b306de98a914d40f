//! NoteFlow: a tick-driven pipeline over a markdown knowledge base.

pub mod config;
pub mod document;
pub mod error;
pub mod forms;
pub mod linking;
pub mod llm;
pub mod notify;
pub mod processor;
pub mod processors;
pub mod review;
pub mod scheduler;
