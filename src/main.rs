use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use porter::{
    default_cache_dir, default_config_file, human_size, resolve_path, BuildArgs, CancelToken,
    ImageError, ImageName, State, StateSettings,
};
use std::{fs, io::Write, path::PathBuf};

#[derive(Parser)]
#[command(
    name = "porter",
    version,
    about = "Daemonless container image builder and registry client"
)]
struct Cli {
    /// State directory
    #[arg(long, global = true, env = "PORTER_CACHE")]
    cache: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true, env = "PORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "error")]
    log: String,

    /// Keep all state changes only in memory
    #[arg(long, global = true)]
    memory_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct PullCmd {
    /// Don't refresh cached manifest files
    #[arg(long)]
    cached: bool,
    #[arg(required = true)]
    images: Vec<String>,
}

#[derive(Args)]
struct BuildCmd {
    /// Name of the Dockerfile
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,
    /// Name and optionally a tag in the 'name:tag' format
    #[arg(short = 't', long)]
    tag: Option<String>,
    /// Set the target build stage to build
    #[arg(long)]
    target: Option<String>,
    /// Push the image after building
    #[arg(long)]
    push: bool,
    /// Set target platform for the build
    #[arg(long)]
    platform: Option<String>,
    context: PathBuf,
}

#[derive(Args)]
struct RefsCmd {
    #[arg(required = true)]
    images: Vec<String>,
}

#[derive(Args)]
struct SaveCmd {
    /// Write to a file, instead of STDOUT
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    #[arg(required = true)]
    images: Vec<String>,
}

#[derive(Args)]
struct LoginCmd {
    #[arg(short = 'u', long)]
    username: String,
    #[arg(short = 'p', long)]
    password: String,
    server: String,
}

#[derive(Args)]
struct TagCmd {
    source: String,
    target: String,
}

#[derive(Subcommand)]
enum Command {
    /// Pull an image from a registry
    Pull(PullCmd),
    /// Build an image from a Dockerfile
    Build(BuildCmd),
    /// Push one or more images to a registry
    Push(RefsCmd),
    /// Save one or more images to a tar archive (streamed to STDOUT by default)
    Save(SaveCmd),
    /// List images
    Images,
    /// Return low-level information on image objects
    Inspect(RefsCmd),
    /// Remove one or more images
    #[command(alias = "rmi")]
    Rm(RefsCmd),
    /// Log in to a Docker registry
    Login(LoginCmd),
    /// Create a tag TARGET_IMAGE that refers to SOURCE_IMAGE
    Tag(TagCmd),
    /// Manage images
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },
}

#[derive(Subcommand)]
enum ImageCommand {
    Build(BuildCmd),
    Inspect(RefsCmd),
    Ls,
    Pull(PullCmd),
    Push(RefsCmd),
    Rm(RefsCmd),
    Save(SaveCmd),
    Tag(TagCmd),
}

impl From<ImageCommand> for Command {
    fn from(command: ImageCommand) -> Command {
        match command {
            ImageCommand::Build(args) => Command::Build(args),
            ImageCommand::Inspect(args) => Command::Inspect(args),
            ImageCommand::Ls => Command::Images,
            ImageCommand::Pull(args) => Command::Pull(args),
            ImageCommand::Push(args) => Command::Push(args),
            ImageCommand::Rm(args) => Command::Rm(args),
            ImageCommand::Save(args) => Command::Save(args),
            ImageCommand::Tag(args) => Command::Tag(args),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log)).init();

    if let Err(err) = run(cli).await {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ImageError> {
    let settings = StateSettings {
        cache_dir: match &cli.cache {
            Some(dir) if !dir.as_os_str().is_empty() => resolve_path(dir),
            _ => default_cache_dir()?,
        },
        config_file: match &cli.config {
            Some(file) if !file.as_os_str().is_empty() => resolve_path(file),
            _ => default_config_file()?,
        },
        memory_cache: cli.memory_cache,
    };
    let mut state = State::new(&settings)?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let command = match cli.command {
        Command::Image { command } => command.into(),
        other => other,
    };

    match command {
        Command::Pull(args) => {
            for image in &args.images {
                let image = ImageName::parse(image)?;
                let manifest = state.pull(&image, args.cached, &cancel).await?;
                println!("{}", manifest.digest());
            }
        }
        Command::Build(args) => {
            if args.push && args.tag.is_none() {
                return Err(ImageError::IllegalArgument(
                    "tag is required to push a built image".to_owned(),
                ));
            }
            let build_args = BuildArgs {
                dockerfile: args.file.as_deref().map(resolve_path),
                tag: args.tag.clone(),
                target: args.target,
                platform: args.platform,
            };
            let context_path = resolve_path(&args.context);
            let digest = state.build(&build_args, &context_path, &cancel).await?;
            println!("{}", digest);
            if args.push {
                if let Some(tag) = &args.tag {
                    state.push(&[ImageName::parse(tag)?], &cancel).await?;
                }
            }
        }
        Command::Push(args) => {
            state.push(&parse_refs(&args.images)?, &cancel).await?;
        }
        Command::Save(args) => {
            let images = parse_refs(&args.images)?;
            let writer: Box<dyn Write + Send> = match &args.output {
                Some(path) => Box::new(fs::File::create(resolve_path(path))?),
                None => Box::new(std::io::stdout()),
            };
            state.save(writer, images, &cancel).await?;
        }
        Command::Images => {
            print_images(&state)?;
        }
        Command::Inspect(args) => {
            let inspected = state.inspect(&parse_refs(&args.images)?)?;
            println!("{}", serde_json::to_string_pretty(&inspected)?);
        }
        Command::Rm(args) => {
            state.remove(&parse_refs(&args.images)?, &cancel).await?;
        }
        Command::Login(args) => {
            state.login(&args.username, &args.password, &args.server)?;
        }
        Command::Tag(args) => {
            state.tag(
                &ImageName::parse(&args.source)?,
                &ImageName::parse(&args.target)?,
            )?;
        }
        Command::Image { .. } => unreachable!("flattened above"),
    }
    Ok(())
}

fn parse_refs(images: &[String]) -> Result<Vec<ImageName>, ImageError> {
    images.iter().map(|image| ImageName::parse(image)).collect()
}

fn print_images(state: &State) -> Result<(), ImageError> {
    let mut rows = vec![[
        "REPOSITORY".to_owned(),
        "TAG".to_owned(),
        "IMAGE ID".to_owned(),
        "SIZE".to_owned(),
    ]];
    for summary in state.images()? {
        rows.push([
            summary.repository(),
            summary.name.identifier().to_owned(),
            summary.short_id().to_owned(),
            human_size(summary.size),
        ]);
    }

    let mut widths = [0usize; 4];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }
    for row in &rows {
        let mut line = String::new();
        for (width, cell) in widths.iter().zip(row.iter()) {
            line.push_str(cell);
            line.push_str(&" ".repeat(width - cell.len() + 3));
        }
        println!("{}", line.trim_end());
    }
    Ok(())
}
