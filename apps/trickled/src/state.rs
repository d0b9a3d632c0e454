// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use trickle_core::StreamHub;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<StreamHub>,
    pub config: Arc<Config>,
}
