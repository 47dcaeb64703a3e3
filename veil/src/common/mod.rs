// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod access;
pub mod authentication;
pub mod buf;
pub mod inbound;
pub mod outbound;
pub mod policy;
pub mod protocol;
