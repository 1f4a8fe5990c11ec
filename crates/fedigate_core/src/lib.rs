/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod abuse_guard;
pub mod admission;
pub mod audit;
pub mod classify;
pub mod config;
pub mod counters;
pub mod dispatch;
pub mod domain_blocks;
pub mod error;
pub mod http_sig;
pub mod json_limits;
pub mod pipeline;
pub mod request;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod store;
pub mod task_queue;
pub mod uri_safety;

pub use config::InboxConfig;
pub use error::{InboxError, Stage};
pub use pipeline::{InboxPipeline, PipelineOutcome, Rejection};
