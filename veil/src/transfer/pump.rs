// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bidirectional relay of MultiBuffer streams under a shared idle deadline
use std::{future::Future, io};

use tokio_util::sync::CancellationToken;

use super::{
  activity::ActivityTimer,
  copy::{copy, CopyOptions, SizeCounter},
};
use crate::common::{
  buf::{MultiBufferReader, MultiBufferWriter},
  policy::Timeouts,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// Local source toward the remote peer
  Uplink,
  /// Remote peer toward the local destination
  Downlink,
}

impl std::fmt::Display for Direction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Direction::Uplink => f.write_str("uplink"),
      Direction::Downlink => f.write_str("downlink"),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
  #[error("{direction} transfer failed")]
  Io {
    direction: Direction,
    #[source]
    source: io::Error,
  },
  #[error("Transfer idle for longer than its timeout")]
  IdleTimeout,
  #[error("Transfer cancelled")]
  Cancelled,
}

impl TransferError {
  fn io(direction: Direction, source: io::Error) -> Self {
    Self::Io { direction, source }
  }

  /// Whether the transfer ended by cancellation rather than an I/O failure
  pub fn is_cancellation(&self) -> bool {
    matches!(self, Self::IdleTimeout | Self::Cancelled)
  }

  /// The failure as seen by a downstream reader of an aborted direction
  pub fn to_io_error(&self) -> io::Error {
    let kind = match self {
      Self::Io { source, .. } => source.kind(),
      Self::IdleTimeout => io::ErrorKind::TimedOut,
      Self::Cancelled => io::ErrorKind::Interrupted,
    };
    io::Error::new(kind, self.to_string())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
  pub uplink: u64,
  pub downlink: u64,
}

async fn until_cancelled<T, F>(token: &CancellationToken, task: F) -> Result<T, TransferError>
where
  F: Future<Output = Result<T, TransferError>>,
{
  tokio::select! {
    res = task => res,
    _ = token.cancelled() => Err(TransferError::Cancelled),
  }
}

/// Polls both tasks concurrently, abandoning both on the first failure
///
/// A failure in either task cancels `token`, so anything else observing it
/// unblocks as well.
pub async fn execute_parallel<A, B, TA, TB>(
  token: &CancellationToken,
  a: A,
  b: B,
) -> Result<(TA, TB), TransferError>
where
  A: Future<Output = Result<TA, TransferError>>,
  B: Future<Output = Result<TB, TransferError>>,
{
  let res = futures::future::try_join(until_cancelled(token, a), until_cancelled(token, b)).await;
  if res.is_err() {
    token.cancel();
  }
  res
}

/// One relay session between a local link and a remote peer
///
/// End of stream on either source half-closes its destination and swaps the
/// idle timeout to the remaining direction's bound. A failed session closes
/// both destinations with its error instead, so neither reads as complete.
#[derive(Debug)]
pub struct DuplexPump {
  token: CancellationToken,
  timeouts: Timeouts,
}

impl DuplexPump {
  /// `token` is cancelled when the session fails or idles out; pass a child
  /// token to keep that from spreading to the caller
  pub fn new(token: CancellationToken, timeouts: Timeouts) -> Self {
    Self { token, timeouts }
  }

  #[tracing::instrument(level = "debug", skip_all, err)]
  pub async fn run<UR, UW, DR, DW>(
    self,
    uplink: (UR, UW),
    downlink: (DR, DW),
  ) -> Result<TransferStats, TransferError>
  where
    UR: MultiBufferReader,
    UW: MultiBufferWriter,
    DR: MultiBufferReader,
    DW: MultiBufferWriter,
  {
    let timer = ActivityTimer::spawn(self.token.clone(), self.timeouts.connection_idle);
    let uplink_bytes = SizeCounter::new();
    let downlink_bytes = SizeCounter::new();
    let (mut uplink_reader, mut uplink_writer) = uplink;
    let (mut downlink_reader, mut downlink_writer) = downlink;

    let upload = async {
      let options = CopyOptions::new()
        .update_activity(&timer)
        .count_size(&uplink_bytes);
      copy(&mut uplink_reader, &mut uplink_writer, options)
        .await
        .map_err(|e| TransferError::io(Direction::Uplink, e.into_io_error()))?;
      uplink_writer
        .close()
        .await
        .map_err(|e| TransferError::io(Direction::Uplink, e))?;
      tracing::trace!("uplink reached end of stream");
      timer.set_timeout(self.timeouts.downlink_only);
      Ok::<(), TransferError>(())
    };

    let download = async {
      let options = CopyOptions::new()
        .update_activity(&timer)
        .count_size(&downlink_bytes);
      copy(&mut downlink_reader, &mut downlink_writer, options)
        .await
        .map_err(|e| TransferError::io(Direction::Downlink, e.into_io_error()))?;
      downlink_writer
        .close()
        .await
        .map_err(|e| TransferError::io(Direction::Downlink, e))?;
      tracing::trace!("downlink reached end of stream");
      timer.set_timeout(self.timeouts.uplink_only);
      Ok::<(), TransferError>(())
    };

    let res = execute_parallel(&self.token, upload, download).await;
    timer.stop();
    let stats = TransferStats {
      uplink: uplink_bytes.get(),
      downlink: downlink_bytes.get(),
    };
    let err = match res {
      Ok(((), ())) => return Ok(stats),
      Err(TransferError::Cancelled) if timer.has_fired() => TransferError::IdleTimeout,
      Err(e) => e,
    };
    tracing::debug!(?stats, error = %err, "transfer aborted");
    uplink_writer.close_with_error(err.to_io_error());
    downlink_writer.close_with_error(err.to_io_error());
    Err(err)
  }
}
