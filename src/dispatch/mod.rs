pub mod dispatcher;
pub mod filter;
pub mod handler;

pub use dispatcher::{DispatchStats, Dispatcher};
pub use filter::NamespaceFilter;
pub use handler::{EventHandler, HandlerSet, Sanitizer};
