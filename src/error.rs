// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Error types for cache bootstrap

use crate::kubernetes::GroupKind;
use crate::kubernetes::selector::SelectorError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A resource type never produced its first snapshot
    #[error("failed to wait for cache with type {resource_type} in {group} group")]
    CacheSync {
        group: GroupKind,
        resource_type: String,
    },

    /// The cancellation token fired before the group was ready
    #[error("cache synchronization of {group} group cancelled before completion")]
    Cancelled { group: GroupKind },

    #[error("client has already been started")]
    AlreadyStarted,

    #[error("invalid label selector: {0}")]
    Selector(#[from] SelectorError),
}

impl Error {
    /// True when the error reports a shutdown request rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
