/*
 * Notebook Validation Operator - Kubernetes Controller for Notebook CI
 * Copyright (C) 2025 MLOps Validation Team
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

//! Validation operator core library
//!
//! This crate provides the core functionality for the notebook validation
//! operator: the `NotebookValidationJob` CRD, the reconciliation state
//! machine, the build strategy abstraction and the post-success trigger
//! executor.

pub mod crds;
pub mod tasks;

// Re-export commonly used types
pub use crds::{
    JobPhase, NotebookValidationJob, NotebookValidationJobSpec, NotebookValidationJobStatus,
};
pub use tasks::config::ControllerConfig;
pub use tasks::run_validation_controller;
