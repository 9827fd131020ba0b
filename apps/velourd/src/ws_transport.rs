use std::io::{Error, ErrorKind};
use std::pin::Pin;
use std::task::Poll;

use futures_util::{Sink, SinkExt};
use tokio::io::AsyncWrite;
use warp::ws::Message as WsMessage;

/// Adapts the websocket sink to `AsyncWrite` so the codec can treat a
/// websocket channel like any other byte stream; each write becomes one
/// binary frame.
pub struct SinkWriter<T>(pub T);

impl<T> AsyncWrite for SinkWriter<T>
where
    T: Sink<WsMessage, Error = warp::Error> + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, Error>> {
        match self.0.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => {
                return Poll::Ready(Err(Error::new(ErrorKind::Other, err.to_string())))
            }
            Poll::Pending => return Poll::Pending,
        }

        let _ = self.0.start_send_unpin(WsMessage::binary(buf));
        self.0
            .poll_flush_unpin(cx)
            .map_err(|err| Error::new(ErrorKind::Other, err.to_string()))
            .map_ok(|_| buf.len())
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Error>> {
        self.0
            .poll_flush_unpin(cx)
            .map_err(|err| Error::new(ErrorKind::Other, err.to_string()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Error>> {
        self.0
            .poll_close_unpin(cx)
            .map_err(|err| Error::new(ErrorKind::Other, err.to_string()))
    }
}
