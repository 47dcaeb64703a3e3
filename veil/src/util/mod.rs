// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod cancellation;
pub mod periodic;
pub mod retry;
pub mod validators;
