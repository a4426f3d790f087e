pub mod error;
pub mod position;
pub mod session;

pub use error::TailError;
pub use position::{AckWindow, PositionTracker, PositionWatch};
pub use session::{SessionState, TailHandle, TailSession, TailSessionBuilder};
