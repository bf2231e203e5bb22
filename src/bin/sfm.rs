use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use study_folder_manager::app::{
    App, JsonRecordProvider, MaintainOptions, StudyRecordProvider, SyncRequest,
};
use study_folder_manager::config::ConfigLoader;
use study_folder_manager::domain::{StorageFolder, StudyId, StudyRecord, StudyStatus};
use study_folder_manager::error::StudyError;
use study_folder_manager::jobs::LsfGateway;
use study_folder_manager::output::{JsonOutput, OutputMode};
use study_folder_manager::transfer::TransferFilters;

#[derive(Parser)]
#[command(name = "sfm")]
#[command(about = "Maintain and transfer metabolomics study folders across study storages")]
#[command(version, author)]
struct Cli {
    /// Path of the sfm.json config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// JSON array of study records standing in for the study database.
    #[arg(long, global = true)]
    records: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Normalize the rw metadata folder of one or more studies")]
    Maintain(MaintainArgs),
    #[command(about = "Start, check or dry-run a folder synchronization job")]
    Sync(SyncArgs),
    #[command(about = "Inspect or kill cluster jobs")]
    Jobs(JobsArgs),
    #[command(about = "Create the private FTP folder of a study and align its permissions")]
    FtpFolder(FtpFolderArgs),
}

#[derive(Args)]
struct MaintainArgs {
    #[arg(required = true)]
    ids: Vec<String>,

    #[arg(long)]
    status: Option<StudyStatus>,

    #[arg(long)]
    force: bool,

    #[arg(long)]
    no_audit: bool,

    #[arg(long)]
    apply_future_actions: bool,
}

#[derive(Args)]
struct SyncArgs {
    id: String,

    /// Source folder as `<location>:<folder-type>`, e.g. `private-ftp:data`.
    #[arg(long)]
    from: String,

    #[arg(long)]
    to: String,

    #[arg(long)]
    dry_run: bool,

    /// Report the current task state without submitting.
    #[arg(long)]
    check: bool,

    #[arg(long)]
    force: bool,

    /// Wait for the submitted job to leave the queue and report its final state.
    #[arg(long)]
    wait: bool,

    #[arg(long = "include")]
    include: Vec<String>,

    #[arg(long = "exclude")]
    exclude: Vec<String>,
}

#[derive(Args)]
struct JobsArgs {
    #[command(subcommand)]
    command: JobsCommand,
}

#[derive(Subcommand)]
enum JobsCommand {
    #[command(about = "List jobs, optionally filtered by name")]
    List {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    #[command(about = "Kill a job by id")]
    Kill {
        job_id: String,
        #[arg(long)]
        queue: Option<String>,
    },
}

#[derive(Args)]
struct FtpFolderArgs {
    id: String,

    #[arg(long)]
    status: Option<StudyStatus>,

    /// Obfuscation code; overrides the one in the study record.
    #[arg(long)]
    code: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<StudyError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &StudyError) -> u8 {
    match error {
        StudyError::InvalidStudyId(_)
        | StudyError::InvalidStatus(_)
        | StudyError::InvalidFolderSpecifier(_)
        | StudyError::MissingConfig
        | StudyError::ConfigRead(_)
        | StudyError::ConfigParse(_)
        | StudyError::StudyNotFound(_)
        | StudyError::TransferValidation(_) => 2,
        StudyError::Job(_)
        | StudyError::Worker(_)
        | StudyError::WorkerTimeout(_)
        | StudyError::Ftp(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let records: Box<dyn StudyRecordProvider> = match &cli.records {
        Some(path) => Box::new(JsonRecordProvider::load(path)?),
        None => Box::new(JsonRecordProvider::default()),
    };
    let gateway = LsfGateway::new(config.jobs.clone());
    let app = App::new(config, gateway, records);
    let sink = output_mode.sink();

    match cli.command {
        Commands::Maintain(args) => {
            let ids = parse_ids(&args.ids)?;
            let options = MaintainOptions {
                status: args.status,
                force: args.force,
                no_audit: args.no_audit,
                apply_future_actions: args.apply_future_actions,
            };
            let result = app.maintain(&ids, &options, sink.as_ref())?;
            JsonOutput::print_maintain(&result).into_diagnostic()?;
        }
        Commands::Sync(args) => {
            let id = args.id.parse::<StudyId>()?;
            let filters = if args.include.is_empty() && args.exclude.is_empty() {
                None
            } else {
                Some(TransferFilters {
                    include: args.include,
                    exclude: args.exclude,
                })
            };
            let request = SyncRequest {
                source: args.from.parse::<StorageFolder>()?,
                target: args.to.parse::<StorageFolder>()?,
                dry_run: args.dry_run,
                status_check_only: args.check,
                force: args.force,
                filters,
                wait: args.wait,
            };
            let result = app.sync(&id, &request, sink.as_ref())?;
            JsonOutput::print_sync(&result).into_diagnostic()?;
        }
        Commands::Jobs(args) => {
            let outcome = match args.command {
                JobsCommand::List { queue, name } => {
                    app.list_jobs(queue.as_deref(), name.as_deref())?
                }
                JobsCommand::Kill { job_id, queue } => app.kill_job(queue.as_deref(), &job_id)?,
            };
            JsonOutput::print_jobs(&outcome).into_diagnostic()?;
        }
        Commands::FtpFolder(args) => {
            let id = args.id.parse::<StudyId>()?;
            let mut record: StudyRecord = app.record(&id, args.status)?;
            if let Some(code) = args.code {
                record.obfuscation_code = Some(code);
            }
            let result = app.ensure_private_ftp_folder(&record, sink.as_ref())?;
            JsonOutput::print_provisioning(&result).into_diagnostic()?;
        }
    }
    Ok(())
}

fn parse_ids(values: &[String]) -> Result<Vec<StudyId>, StudyError> {
    values.iter().map(|value| value.parse::<StudyId>()).collect()
}
