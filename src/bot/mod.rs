/// Commands, `/imagen` argument parsing and request planning
pub mod command;
/// Message and command handlers
pub mod handlers;
/// `/imagen` and `/imagencancel` command flow
pub mod imagen;
/// Attachment download
pub mod media;
/// Replies and uploads bound to a command message
pub mod outbound;
