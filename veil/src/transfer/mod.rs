// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transfer loops, their idle deadline, and in-memory links between them

pub mod activity;
pub mod copy;
pub mod pipe;
pub mod pump;

pub use activity::{ActivityState, ActivityTimer};
pub use copy::{copy, CopyError, CopyOptions, SizeCounter};
pub use pipe::{link_pair, pipe, Link, PipeReader, PipeWriter, DEFAULT_PIPE_CAPACITY};
pub use pump::{execute_parallel, Direction, DuplexPump, TransferError, TransferStats};
