use std::pin::Pin;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

/// A live feed that starts with the current value (if any) and then yields
/// every published update. A slow reader skips what it missed rather than
/// stalling the publisher.
pub struct Subscription<T> {
    first: Option<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub(crate) fn new(first: Option<T>, rx: broadcast::Receiver<T>) -> Self {
        Self { first, rx }
    }

    /// `None` once the publisher has been dropped.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => break Some(value),
                Err(RecvError::Lagged(n)) => {
                    debug!("subscriber lagged, skipped {} updates", n);
                    continue;
                }
                Err(RecvError::Closed) => break None,
            }
        }
    }

    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = T> + Send>> {
        let live = BroadcastStream::new(self.rx).filter_map(|r| r.ok());
        Box::pin(tokio_stream::iter(self.first).chain(live))
    }
}
