use std::process::ExitCode;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> ExitCode {
	let result = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("BUG: tokio runtime failed to build")
		.block_on(async {
			let (args, _guard) = dbbak::args()?;
			dbbak::run(args).await
		});

	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(report) => {
			// The core error carries the process exit code contract.
			let code = report
				.downcast_ref::<dbbak::error::Error>()
				.map(|e| e.exit_code())
				.unwrap_or(1);
			eprintln!("{report:?}");
			ExitCode::from(code)
		}
	}
}
