// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Core of an authenticated tunneling relay
//!
//! Inbound connections open with a time-windowed authentication tag which
//! [common::authentication::TimedIdentityTable] resolves to a registered
//! identity. Authenticated sessions are dispatched toward their destination
//! and relayed by [transfer::DuplexPump] until both directions finish or
//! the session idles out.

pub mod common;
pub mod server;
pub mod transfer;
pub mod util;
