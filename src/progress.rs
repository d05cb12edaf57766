// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Progress reporting while caches synchronize
//!
//! Follows the client's state channel and mirrors it on a terminal spinner.

use indicatif::{ProgressBar, ProgressStyle};
use k8s_replicator::{ClientState, GroupKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Create a spinner with consistent styling
pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Spinner message for a client state, None once startup has finished
pub fn state_message(state: ClientState) -> Option<String> {
    match state {
        ClientState::Constructed => Some("Preparing caches...".to_string()),
        ClientState::Starting(GroupKind::Namespace) => {
            Some("Synchronizing namespace cache...".to_string())
        }
        ClientState::Starting(GroupKind::Resource) => {
            Some("Synchronizing resource caches...".to_string())
        }
        ClientState::Ready | ClientState::Failed => None,
    }
}

/// Show a spinner until the client reaches a terminal state
///
/// The returned task finishes (and clears the spinner) once the state is
/// `Ready` or `Failed`, or the client is dropped.
pub fn track_startup(mut state: watch::Receiver<ClientState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = *state.borrow_and_update();
        let Some(msg) = state_message(initial) else {
            return;
        };
        let spinner = create_spinner(&msg);

        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            match state_message(current) {
                Some(msg) => spinner.set_message(msg),
                None => break,
            }
        }

        spinner.finish_and_clear();
    })
}
