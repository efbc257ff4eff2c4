use std::sync::Arc;

use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::types::ProcessConfig;

/// Shared cancellation + task tracking threaded through every long-running
/// loop on both the client and server side (per-connection HTTP/3 pump,
/// per-stream dispatch, TUN reader). Mirrors the `ctx: Arc<AppContext>`
/// field the teacher threads through its inbound/outbound handlers.
#[derive(Debug, Clone)]
pub struct AppContext {
	pub token: CancellationToken,
	pub tasks: TaskTracker,
	pub config: Arc<ProcessConfig>,
}

impl Default for AppContext {
	fn default() -> Self {
		Self {
			token: CancellationToken::new(),
			tasks: TaskTracker::new(),
			config: Arc::new(ProcessConfig::default()),
		}
	}
}

impl AppContext {
	pub fn with_config(config: ProcessConfig) -> Self {
		Self {
			config: Arc::new(config),
			..Self::default()
		}
	}

	/// Cancels the shared token and waits for every task spawned through
	/// `self.tasks` to observe it and return.
	pub async fn shutdown(&self) {
		self.token.cancel();
		self.tasks.close();
		self.tasks.wait().await;
	}
}
