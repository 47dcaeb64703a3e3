// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Pooled byte storage and the ownership-transferring reader/writer seams built on it

mod buffer;
pub use buffer::Buffer;

mod multi_buffer;
pub use multi_buffer::MultiBuffer;

mod pool;
pub use pool::{BufferPool, ClassStats, BASE_SIZE, NUM_CLASSES, SIZE_MULTIPLIER};

pub mod io;
pub use io::{BufferedWriter, MultiBufferReader, MultiBufferWriter, StreamReader, StreamWriter};
