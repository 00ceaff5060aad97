pub mod chat;
pub mod fallback;
pub mod sessions;
pub mod status;
pub mod usage;
