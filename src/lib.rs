// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Label-scoped Kubernetes watch caches
//!
//! Builds one cache group for namespaces and one for tracked resources, each
//! restricted by its own mandatory label requirements, and provides a single
//! call that blocks until both hold a complete initial snapshot.

pub mod config;
pub mod error;
pub mod kubernetes;

pub use error::{Error, Result};
pub use kubernetes::{ApiFilters, Client, ClientState, GroupKind};
