pub mod chunk_handlers;
pub mod drive_handlers;
pub mod health_handlers;
pub mod object_handlers;
