use clap::Parser;
use std::error::Error;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use image_tester::config::{
    self, BackendSettings, BatchInfo, Capabilities, Config, DocumentOptions, MatchLevel, SplitNaming, Viewport,
};
use image_tester::convert::{DocumentConverter, ExternalConverter, PageSelection};
use image_tester::{Executor, LocalBaselineFactory, RunReport, SuiteBuilder};

/// Exit status when discovery or configuration fails
const EXIT_SETUP_FAILURE: u8 = 2;

/// Image Tester - visual regression testing of image folders and documents
#[derive(Parser, Debug)]
#[command(
    name = "image-tester",
    version,
    about = "Batch visual regression testing of image folders, image files, PDF and PostScript documents",
    after_help = "ENVIRONMENT VARIABLES:\n\
        IMAGE_TESTER_APP_NAME       Application name\n\
        IMAGE_TESTER_THREADS        Worker pool size\n\
        IMAGE_TESTER_BASELINE_DIR   Local baseline directory\n\
        IMAGE_TESTER_DPI            Document conversion resolution\n\
        JOB_NAME + IMAGE_TESTER_BATCH_ID   CI flat batch (name and id)\n\
        RUST_LOG                    Log filter (overrides --debug)"
)]
struct Args {
    /// Directory tree or single file to test
    #[arg(short = 'f', long, default_value = ".")]
    folder: PathBuf,

    /// Application name reported with every test
    #[arg(short = 'a', long, env = config::ENV_APP_NAME, default_value = config::DEFAULT_APP_NAME)]
    app_name: String,

    /// Number of tests executed concurrently
    #[arg(long, env = config::ENV_THREADS, default_value_t = config::DEFAULT_THREADS)]
    threads: usize,

    /// Fixed viewport declared for every test, as WxH (default: size of the first image)
    #[arg(long)]
    viewport: Option<Viewport>,

    /// Use this test name for every unit instead of the path-derived name
    #[arg(long)]
    forced_name: Option<String>,

    /// Run every image of a folder as its own test
    #[arg(long)]
    split_steps: bool,

    /// Naming of split tests when --forced-name is set
    #[arg(long, value_enum, default_value_t = SplitNaming::Suffixed)]
    split_naming: SplitNaming,

    /// Group every unit under one batch with this name
    #[arg(long)]
    flat_batch: Option<String>,

    /// Document rasterization resolution
    #[arg(long, env = config::ENV_DPI, default_value_t = config::DEFAULT_DPI, value_parser = parse_dpi)]
    dpi: f32,

    /// Password for protected PDF documents
    #[arg(long)]
    password: Option<String>,

    /// Pages to test, e.g. "1,3-5" (default: all)
    #[arg(long)]
    pages: Option<String>,

    /// Stamp "Page N" onto each rendered page
    #[arg(long)]
    page_numbers: bool,

    /// Comparison strictness
    #[arg(long, value_enum, default_value_t = MatchLevel::Strict)]
    match_level: MatchLevel,

    /// Accept checkpoints whose content only moved by a few pixels
    #[arg(long)]
    ignore_displacement: bool,

    /// Baseline branch
    #[arg(long)]
    branch: Option<String>,

    /// Branch whose baselines are used when the branch has none
    #[arg(long)]
    parent_branch: Option<String>,

    /// Baseline environment name (default: <host-os>_<host-app>)
    #[arg(long)]
    baseline_env: Option<String>,

    /// Host operating system reported with every test
    #[arg(long)]
    host_os: Option<String>,

    /// Host application reported with every test
    #[arg(long)]
    host_app: Option<String>,

    /// Replace mismatching baselines with the new images
    #[arg(long)]
    auto_save: bool,

    /// Local baseline directory
    #[arg(long, env = config::ENV_BASELINE_DIR, default_value = config::DEFAULT_BASELINE_DIR)]
    baseline_dir: PathBuf,

    /// Write the run report as JSON to this path
    #[arg(long)]
    json: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = Args::parse();
    if let Err(e) = init_logging(args.debug, args.log_file.as_deref()) {
        eprintln!("Cannot open log file: {}", e);
        return Ok(ExitCode::from(EXIT_SETUP_FAILURE));
    }

    if let Some(pages) = &args.pages {
        if let Err(e) = PageSelection::parse(pages) {
            error!("{}", e);
            return Ok(ExitCode::from(EXIT_SETUP_FAILURE));
        }
    }

    let converter = ExternalConverter::new();
    let capabilities = Capabilities {
        document_conversion: converter.probe(),
    };
    if !capabilities.document_conversion {
        warn!("Neither pdftoppm nor Ghostscript found, documents will be skipped");
    }

    let config = Arc::new(build_config(&args, capabilities));
    let converter: Arc<dyn DocumentConverter> = Arc::new(converter);

    let suite = match SuiteBuilder::new(Arc::clone(&config))
        .with_converter(converter)
        .build(&args.folder)
    {
        Ok(suite) => suite,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(EXIT_SETUP_FAILURE));
        }
    };

    if suite.is_empty() {
        println!("Nothing to test!");
        return Ok(ExitCode::SUCCESS);
    }

    let started_at = chrono::Utc::now();
    let factory = Arc::new(LocalBaselineFactory::new(&args.baseline_dir));
    let executor = match Executor::new(args.threads, factory, config) {
        Ok(executor) => executor,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(EXIT_SETUP_FAILURE));
        }
    };
    executor.run(suite);

    let report = RunReport::from_records(executor.results().snapshot(), started_at);
    report.print_table();

    if let Some(path) = &args.json {
        report.write_json(path)?;
        info!("Report written to {}", path.display());
    }

    Ok(if report.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn init_logging(debug: bool, log_file: Option<&Path>) -> io::Result<()> {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            subscriber.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => subscriber.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn build_config(args: &Args, capabilities: Capabilities) -> Config {
    let mut config = Config::new(&args.app_name)
        .split_steps(args.split_steps)
        .split_naming(args.split_naming)
        .document(DocumentOptions {
            dpi: args.dpi,
            password: args.password.clone(),
            pages: args.pages.clone(),
            include_page_numbers: args.page_numbers,
        })
        .backend(BackendSettings {
            match_level: args.match_level,
            branch: args.branch.clone(),
            parent_branch: args.parent_branch.clone(),
            baseline_env_name: args.baseline_env.clone(),
            host_os: args.host_os.clone(),
            host_app: args.host_app.clone(),
            auto_save: args.auto_save,
            ignore_displacement: args.ignore_displacement,
        })
        .capabilities(capabilities);

    if let Some(viewport) = args.viewport {
        config = config.viewport(viewport);
    }
    if let Some(name) = &args.forced_name {
        config = config.forced_name(name);
    }

    // CI environment takes precedence over the flag
    if let Some(batch) = BatchInfo::from_ci_env() {
        config = config.flat_batch(batch);
    } else if let Some(name) = &args.flat_batch {
        config = config.flat_batch(BatchInfo::new(name));
    }
    config
}

/// Resolution must be a finite, positive number of dots per inch
fn parse_dpi(s: &str) -> Result<f32, String> {
    let dpi: f32 = s.parse().map_err(|_| format!("invalid resolution '{}'", s))?;
    if dpi.is_finite() && dpi > 0.0 {
        Ok(dpi)
    } else {
        Err(format!("resolution must be a positive number, got '{}'", s))
    }
}
