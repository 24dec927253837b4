#![deny(missing_docs)]
//! Imagen Telegram bot.
//!
//! Turns `/imagen` chat commands into Gemini image generation and edit
//! requests, collecting user-posted attachments and keeping the chat's
//! typing indicator alive while work is in flight.

/// Telegram command surface, handlers and transport glue.
pub mod bot;
/// Attachment collection sessions and the waiting-session registry.
pub mod collect;
/// Configuration management.
pub mod config;
/// Image generation service.
pub mod imagen;
/// Telegram runtime entrypoint.
pub mod runner;
/// Typing indicator coalescer.
pub mod typing;
/// Utility functions.
pub mod utils;
