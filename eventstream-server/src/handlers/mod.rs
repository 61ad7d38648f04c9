pub mod events;
pub mod streaming;
