// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by writer construction and lifecycle calls.
///
/// Runtime failures inside the pipeline (overflow, transport errors, invalid
/// records) are absorbed and counted instead.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Writer already started")]
    AlreadyStarted,

    #[error("Writer not running")]
    NotRunning,
}
