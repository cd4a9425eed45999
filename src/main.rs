use clap::Parser;
use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use quizshot::{
	config::{AppConfig, InferenceMode, RunSettings, SettingsFlags, check_target_url},
	export,
	llm::AnswerClient,
	runner::{self, LoopEnd, Summary},
	session::{QuizPage, Session},
	stop::{self, StopFlag},
	upload::ImgBb,
};
use v_utils::{elog, io::confirm, log};

#[derive(Debug, Parser)]
#[command(name = "quizshot")]
#[command(about = "Step through a browser quiz, capture passages and export import-ready results", long_about = None)]
struct Cli {
	#[command(flatten)]
	settings: SettingsFlags,

	/// Start right away instead of waiting for Enter (use when no login is needed)
	#[arg(long)]
	no_wait: bool,

	/// Continue without AI answers when no LLM key is configured, without asking
	#[arg(long)]
	yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	dotenvy::dotenv().ok();
	init_tracing();

	let cli = Cli::parse();
	let config = AppConfig::try_build(cli.settings).map_err(|e| eyre!("Failed to load config: {e}"))?;
	let settings = config.resolve()?;
	check_target_url(&settings.target_url)?;

	log!("Target: {}", settings.target_url);
	log!("Questions: {}, wait {}s", settings.question_count, settings.wait.as_secs());
	if settings.inference != InferenceMode::Off && settings.llm.is_none() {
		elog!("No LLM API key found, answers will be left blank");
		if !cli.yes && !confirm("Continue without AI answers?").await {
			bail!("Cancelled: no LLM API key");
		}
	}
	if settings.imgbb_api_key.is_none() {
		tracing::info!("No image host key, screenshots stay local");
	}

	let session = Session::launch(config.visible).await?;
	let flag = stop::install_interrupt();
	let outcome = tokio::select! {
		outcome = run(&session, &settings, cli.no_wait, config.stop_key, &flag) => Some(outcome),
		() = flag.aborted() => None,
	};
	if let Err(e) = session.close().await {
		elog!("{e}");
	}

	match outcome {
		None => {
			let message = "Quiz run abandoned after a second interrupt, nothing exported";
			elog!("{message}");
			runner::run_stop_hook(config.stop_hook.as_deref(), message);
			std::process::exit(130);
		}
		Some(Ok((summary, end))) => {
			let message = format!("Quiz run finished ({end:?}): {summary}");
			log!("{message}");
			for path in &summary.written {
				log!("  {}", path.display());
			}
			runner::run_stop_hook(config.stop_hook.as_deref(), &message);
			Ok(())
		}
		Some(Err(e)) => {
			runner::run_stop_hook(config.stop_hook.as_deref(), &format!("Quiz run failed: {e}"));
			Err(e)
		}
	}
}

async fn run(session: &Session, settings: &RunSettings, no_wait: bool, stop_key: bool, flag: &StopFlag) -> Result<(Summary, LoopEnd)> {
	session.open(&settings.target_url).await?;

	if !no_wait {
		log!("Log in and open the first question, then press ENTER to start...");
		// tokio stdin reads can't be cancelled, keep this one on a plain thread
		let (tx, rx) = tokio::sync::oneshot::channel();
		std::thread::spawn(move || {
			let mut line = String::new();
			let _ = tx.send(std::io::stdin().read_line(&mut line));
		});
		tokio::select! {
			read = rx => {
				read.map_err(|_| eyre!("Start prompt reader went away"))?.map_err(|e| eyre!("Failed to read stdin: {e}"))?;
			}
			() = flag.requested() => bail!("Cancelled before the first question"),
		}
	}

	if let Err(e) = session.wait_until_ready(settings.settle).await {
		tracing::warn!("{e}");
	}
	session.set_page_zoom(settings.page_zoom).await?;

	stop::install_keys(stop_key, flag);
	let driver = QuizPage::new(session, settings);
	let (mut records, end) = runner::run_loop(&driver, settings.question_count, settings.wait, flag).await;

	let host = settings.imgbb_api_key.clone().map(ImgBb::new).transpose()?;
	let client = match &settings.llm {
		Some(llm) if settings.ai_enabled() => Some(AnswerClient::http(llm.clone())?),
		_ => None,
	};
	let summary = runner::finish(&mut records, host.as_ref(), client.as_ref(), settings, &export::run_stamp()).await?;
	Ok((summary, end))
}

/// `RUST_LOG` filter (default `warn`), `QUIZSHOT_LOG_FORMAT=json` for JSON lines on stderr
fn init_tracing() {
	use tracing_subscriber::{EnvFilter, fmt, prelude::*};

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
	let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
	let builder = tracing_subscriber::registry().with(filter);

	match std::env::var("QUIZSHOT_LOG_FORMAT").as_deref() {
		Ok("json") => {
			let _ = builder.with(fmt_layer.json().flatten_event(true)).try_init();
		}
		_ => {
			let _ = builder.with(fmt_layer.compact()).try_init();
		}
	}
}
