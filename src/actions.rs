use clap::Subcommand;
use miette::Result;
use tracing::{debug, trace, warn};

pub use context::Context;
pub mod context;

#[macro_export]
macro_rules! subcommands {
	(
		[$argtype:ty => $ctxcode:block]
		$(
			$modname:ident => $enumname:ident($argname:ident)
		),+
	) => {
		$(
			pub mod $modname;
		)*

		#[derive(Debug, Clone, Subcommand)]
		pub enum Action {
			$(
				$enumname($modname::$argname),
			)*
		}

		pub async fn run(ctx: $argtype) -> Result<()> {
			let ctxfn = $ctxcode;
			match ctxfn(ctx)? {
				$(
					(Action::$enumname(args), ctx) => $modname::run(ctx.with_top(args)).await,
				)*
			}
		}
	};
}
#[allow(unused_imports)]
pub(crate) use subcommands;

use crate::args::Args;

subcommands! {
	[Args => {|args: Args| -> Result<(Action, Context<()>)> {
		debug!(version=%env!("CARGO_PKG_VERSION"), "starting up");
		trace!(action=?args.action, "action");

		let config = args.globals.clone().into_config()?;
		let ctx = Context::new(config);

		// First Ctrl-C cancels cooperatively; a second one aborts hard.
		let cancel = ctx.cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				warn!("interrupt received, cancelling");
				cancel.cancel();
				if tokio::signal::ctrl_c().await.is_ok() {
					std::process::exit(5);
				}
			}
		});

		Ok((args.action, ctx))
	}}]

	backup => Backup(BackupArgs),
	restore => Restore(RestoreArgs),
	wal => Wal(WalArgs),
	cloud => Cloud(CloudArgs),
	retention => Retention(RetentionArgs)
}
