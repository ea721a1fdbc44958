use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Per-invocation context threaded through every action: the layered
/// configuration, a progress multiplexer, and the root cancellation token
/// every core operation inherits.
#[derive(Clone, Debug)]
pub struct Context<A = (), B = ()> {
	pub args_top: A,
	pub args_sub: B,
	pub config: Config,
	pub progress: MultiProgress,
	pub cancel: CancellationToken,
}

impl Context {
	pub fn new(config: Config) -> Self {
		Self {
			args_top: (),
			args_sub: (),
			config,
			progress: MultiProgress::new(),
			cancel: CancellationToken::new(),
		}
	}
}

impl<A, B> Context<A, B> {
	pub fn with_top<C>(self, args_top: C) -> Context<C, B> {
		Context::<C, B> {
			args_top,
			args_sub: self.args_sub,
			config: self.config,
			progress: self.progress,
			cancel: self.cancel,
		}
	}

	pub fn with_sub<C>(self, args_sub: C) -> Context<A, C> {
		Context::<A, C> {
			args_top: self.args_top,
			args_sub,
			config: self.config,
			progress: self.progress,
			cancel: self.cancel,
		}
	}

	/// A byte-denominated progress bar attached to this context.
	pub fn data_bar(&self, len: u64) -> ProgressBar {
		self.progress.add(ProgressBar::new(len).with_style(
			ProgressStyle::default_bar()
				.template("[{bar:20.cyan/blue}] {wide_msg} {bytes}/{total_bytes} [{bytes_per_sec}] ({eta})")
				.expect("BUG: data bar template invalid")
		))
	}
}
