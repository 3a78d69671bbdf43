/*
 * zcicd Control Plane - Tekton execution and Argo CD delivery orchestration
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! CI/CD control plane core library
//!
//! Two engines share one resource client:
//! - the execution engine renders and submits Tekton `PipelineRun`/`TaskRun`
//!   resources, watches their status, and relays build logs;
//! - the delivery engine manages Argo CD applications, sync, rollouts, and
//!   GitOps value writes.
//!
//! The services layer orchestrates both on top of the storage seams.

pub mod client;
pub mod config;
pub mod crd;
pub mod delivery;
pub mod error;
pub mod execution;
pub mod services;
pub mod templates;
pub mod watch;
pub mod webhooks;

// Re-export commonly used types
pub use client::{KubeResourceClient, MemoryResourceClient, ResourceClient};
pub use config::{load_controller_config, ControllerConfig};
pub use crd::{KindRegistry, ResourceKind, RunPhase, RunStatus};
pub use error::{Error, Result};
