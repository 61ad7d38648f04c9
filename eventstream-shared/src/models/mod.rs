pub mod cursor;
pub mod errors;
pub mod event;
pub mod frame;

pub use cursor::{Cursor, CursorError};
pub use errors::StreamErrorPayload;
pub use event::{CursorResponse, Event, PublishEventRequest, PublishEventResponse};
pub use frame::SseFrame;
