pub mod api;
pub mod dead_letter;
pub mod job;
pub mod post;
pub mod progress;
pub mod stage;
pub mod sync;
