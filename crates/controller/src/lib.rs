/*
 * 5D Labs Agent Platform - NamespaceClass Controller
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

//! NamespaceClass controller library
//!
//! Projects cluster-scoped `NamespaceClass` templates onto every namespace that
//! carries the class membership label, and keeps the generated `NetworkPolicy`
//! and `ServiceAccount` objects in sync with the class.

pub mod crds;
pub mod membership;
pub mod store;
pub mod tasks;

// Re-export commonly used types
pub use crds::{NamespaceClass, NamespaceClassSpec, NamespaceClassStatus, ServiceAccountTemplate};
pub use membership::{LabelMembership, MembershipIndex};
pub use store::{KindRegistry, KubeStore, MemoryStore, ObjectStore, StoreError};
pub use tasks::config::{ControllerConfig, DeletionPolicy};
pub use tasks::types::{Error, Result};
