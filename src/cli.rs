use clap::Parser;

/// CLI arguments for the markdown runner.
#[derive(Parser, Debug)]
#[command(
    name = "mdrun",
    version,
    about = "Runs the annotated code blocks of markdown documents as staged workflows",
    after_help = "Examples:\n  mdrun -m ./docs\n  mdrun -m ./docs --update-files\n  mdrun -m ./docs --filter 'tutorial.*' --dry-run\n  mdrun -m ./docs --start-from deploy\n  mdrun -m ./docs --break-at deploy/push"
)]
pub struct RootArgs {
    /// Where to find the markdown files to execute
    #[arg(short = 'm', long, value_name = "DIR", default_value = "./")]
    pub markdown_dir: String,

    /// Recurse into subdirectories when discovering files
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Run only the files whose path matches this regex
    #[arg(long, value_name = "REGEX")]
    pub filter: Option<String>,

    /// Just list the files found
    #[arg(short = 'l', long = "list")]
    pub just_list: bool,

    /// List what would be executed without doing it
    #[arg(short = 'd', long)]
    pub dry_run: bool,

    /// Prompt before each command
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Ignore the breakpoints
    #[arg(long)]
    pub ignore_breakpoints: bool,

    /// Update the chunk output sections in the markdown files
    #[arg(short = 'u', long)]
    pub update_files: bool,

    /// The timeout in minutes for every executed command
    #[arg(short = 't', long, value_name = "MINUTES", default_value_t = 10)]
    pub timeout: u64,

    /// Start from a specific stage: either a stage name or file@stage
    #[arg(short = 's', long, value_name = "STAGE")]
    pub start_from: Option<String>,

    /// Turn on interactive mode at a stage, stage/chunk, or file@stage/chunk
    #[arg(short = 'b', long, value_name = "STAGE")]
    pub break_at: Option<String>,

    /// UI flavour: default, ci or mock
    #[arg(long, value_name = "KIND", default_value = "default")]
    pub view: String,

    /// Print more logs
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Disable output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Disable colors and symbols in the cli output
    #[arg(long)]
    pub no_styling: bool,
}
