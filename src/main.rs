use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use issuebot::agent::{Bot, BotDeps};
use issuebot::config::Config;
use issuebot::error::BotError;
use issuebot::history::{FileHistoryStore, HistoryStore};
use issuebot::llm::create_llm_provider;
use issuebot::platform::{GitHubClient, PlatformClient, RepoRef};
use issuebot::task::{TaskBuilder, TaskGenerator};

#[derive(Parser, Debug)]
#[command(name = "issuebot", version, about = "Works GitHub issues assigned to the bot account")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a single issue or pull request and exit
    Once(OnceArgs),

    /// Poll for assigned work until interrupted
    Poll {
        /// Seconds between poll cycles
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Directory for resumable conversation transcripts
        #[arg(long, env = "ISSUEBOT_HISTORY_DIR")]
        history_dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct OnceArgs {
    /// Repository as owner/name
    #[arg(long)]
    repo: RepoRef,

    /// Issue number
    #[arg(long, conflicts_with = "pull", required_unless_present = "pull")]
    issue: Option<u64>,

    /// Pull request number
    #[arg(long)]
    pull: Option<u64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            signal.cancel();
        }
    });

    if let Err(e) = run(cli.command, cancel).await {
        if matches!(e.downcast_ref::<BotError>(), Some(BotError::Cancelled)) {
            std::process::exit(130);
        }
        tracing::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("issuebot=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn run(command: Command, cancel: CancellationToken) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mut config = Config::from_env()?;

    let (interval, history_dir) = match &command {
        Command::Poll {
            interval_secs,
            history_dir,
        } => (interval_secs.map(Duration::from_secs), history_dir.clone()),
        Command::Once(_) => (None, None),
    };
    config.apply_overrides(interval, history_dir)?;

    let platform: Arc<dyn PlatformClient> = Arc::new(GitHubClient::new(&config.github)?);
    let llm = create_llm_provider(&config.llm)?;
    let history = config.history.dir.as_ref().map(|dir| {
        tracing::info!("Saving transcripts under {}", dir.display());
        Arc::new(FileHistoryStore::new(dir)) as Arc<dyn HistoryStore>
    });

    let builder = TaskBuilder::new(
        platform.clone(),
        config.github.login.clone(),
        config.agent.branch_prefix.clone(),
    )
    .with_validation_workflow(config.agent.validation.as_ref().map(|v| v.workflow.clone()));

    let bot = Bot::new(
        config.agent.clone(),
        config.github.login.clone(),
        BotDeps {
            platform: platform.clone(),
            llm,
            history,
        },
    );

    match command {
        Command::Once(args) => {
            let task = tokio::select! {
                _ = cancel.cancelled() => return Err(BotError::Cancelled.into()),
                task = async {
                    match (args.issue, args.pull) {
                        (Some(n), _) => builder.build_for_number(&args.repo, n).await.map_err(anyhow::Error::from),
                        (None, Some(n)) => builder.build_for_pull(&args.repo, n).await.map_err(anyhow::Error::from),
                        (None, None) => Err(anyhow::anyhow!("one of --issue or --pull is required")),
                    }
                } => task?,
            };
            let outcome = bot.do_task(task, &cancel).await?;
            tracing::info!("Finished: {:?}", outcome);
            println!("{:?}", outcome);
        }
        Command::Poll { .. } => {
            tracing::info!(
                "Polling every {}s as {}",
                config.generator.poll_interval.as_secs(),
                config.github.login
            );
            let generator = TaskGenerator::new(platform, builder, config.generator.clone());
            let tasks = generator.generate(cancel.clone());
            bot.run(tasks, cancel).await?;
        }
    }
    Ok(())
}
