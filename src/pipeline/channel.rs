use crate::tail::error::TailError;
use tokio::sync::mpsc;
use tracing::warn;

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;

/// Create a bounded channel with the specified buffer size
pub fn create_channel<T>(buffer_size: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(buffer_size)
}

/// Where every stage reports non-fatal problems.
///
/// The queue is unbounded so that reporting never blocks the data path; a
/// slow error handler only delays other error reports.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<TailError>,
}

impl ErrorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TailError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, error: TailError) {
        warn!(error = %error, "Reporting tail error");
        if self.tx.send(error).is_err() {
            warn!("Error handler is gone, error report discarded");
        }
    }
}
