use clap::Parser;
use erna_common::{config::Config, prelude::*, tracing_support::initialize_tracing};

mod cmd;
mod description;

/// Command-line options, parsed using `clap`.
#[derive(Debug, Parser)]
#[command(name = "erna", version, about = "Operator tool for the ERNA batch orchestrator.")]
struct Opt {
    /// The config file to use. Defaults to $ERNA_CONFIG, then ./erna.yaml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, clap::Subcommand)]
enum Cmd {
    /// Job-related commands.
    Job {
        #[command(subcommand)]
        cmd: cmd::job::Opt,
    },

    /// Create the job store, or migrate it to the latest schema.
    Migrate,

    /// Commands for the run catalog.
    Runs {
        #[command(subcommand)]
        cmd: cmd::runs::Opt,
    },

    /// Store tool versions and configurations.
    Upload {
        #[command(subcommand)]
        cmd: cmd::upload::Opt,
    },
}

fn main() -> Result<()> {
    initialize_tracing("erna=info,erna_common=warn");
    let opt = Opt::parse();
    debug!("Args: {:?}", opt);

    let config = Config::load(opt.config.as_deref())?;
    let store = config.open_store()?;
    match &opt.cmd {
        Cmd::Job { cmd } => cmd::job::run(cmd, &config, &store),
        Cmd::Migrate => cmd::migrate::run(&store),
        Cmd::Runs { cmd } => cmd::runs::run(cmd, &config, &store),
        Cmd::Upload { cmd } => cmd::upload::run(cmd, &store),
    }
}
