#![deny(rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed:
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation, // durations and byte counts stay far below u64::MAX
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions, // e.g. QueueError in buffer
    clippy::must_use_candidate,
    clippy::doc_markdown
)]

pub mod app;
pub mod buffer;
pub mod domain;
pub mod receiver;
pub mod reliability;
pub mod sender;

pub use app::{App, Config};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
