/// CoachLink - trainer/member chat synchronization core
///
/// Client-side sync engine for the gym platform's chat: periodic polling,
/// optimistic sends with delivery tracking, and duplicate-free merging
/// against the REST backend.

pub mod api;
pub mod backend;
pub mod cli_app;
pub mod config;
pub mod error;
pub mod events;
pub mod inbox;
pub mod session;
pub mod sync;
pub mod types;

pub use config::Config;
pub use error::{ChatError, Result};
pub use inbox::TrainerInbox;
pub use session::{Role, Session};
pub use sync::{ChatSync, FetchMode};
