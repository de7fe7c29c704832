//! IPC bridge between the controller and its worker subprocesses.
//!
//! - **protocol**: message types (ControlRequest, WorkerMessage, CallOutcome)
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures::SinkExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use codec::JsonCodec;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

pub(crate) type FrameReader<T> = FramedRead<BoxedReader, JsonCodec<T>>;

/// One writer per channel direction, shared by every task that sends on it.
pub(crate) type SharedWriter<T> = Arc<tokio::sync::Mutex<FramedWrite<BoxedWriter, JsonCodec<T>>>>;

pub(crate) fn frame_reader<T>(reader: BoxedReader) -> FrameReader<T> {
    FramedRead::new(reader, JsonCodec::new())
}

pub(crate) fn shared_writer<T>(writer: BoxedWriter) -> SharedWriter<T> {
    Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        writer,
        JsonCodec::new(),
    )))
}

pub(crate) async fn send_frame<T: Serialize>(writer: &SharedWriter<T>, msg: T) -> io::Result<()> {
    let mut w = writer.lock().await;
    w.send(msg).await
}
