use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use idxd_decode::{
    DecodeConfig, DecodeError, DecodeState, DocumentLocation, DocumentObserver, ImageCodec,
    LoadedDocument, ReaderChunkSource, Rect, Session,
};

struct CliArgs {
    config: DecodeConfig,
    inputs: Vec<String>,
}

fn parse_args() -> Result<CliArgs> {
    let mut config = DecodeConfig::from_env();
    let mut inputs = Vec::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stall-timeout-ms" => {
                let value = args
                    .next()
                    .context("Missing value for --stall-timeout-ms")?;
                let ms = value
                    .parse::<u64>()
                    .context("Failed to parse --stall-timeout-ms as a non-negative integer")?;
                config = config.with_stall_timeout(Some(Duration::from_millis(ms)));
            }
            "--chunk-size" => {
                let value = args.next().context("Missing value for --chunk-size")?;
                let size = value
                    .parse::<usize>()
                    .context("Failed to parse --chunk-size as a positive integer")?;
                config = config.with_chunk_size(size);
            }
            "--temp-dir" => {
                let value = args.next().context("Missing value for --temp-dir")?;
                config = config.with_temp_dir(PathBuf::from(value));
            }
            "-h" | "--help" => {
                println!(
                    "usage: idxd-decode [--stall-timeout-ms N] [--chunk-size N] [--temp-dir DIR] <path|file://url|->..."
                );
                std::process::exit(0);
            }
            "-" => inputs.push(arg),
            other if other.starts_with("--") => bail!("Unknown argument: {}", other),
            _ => inputs.push(arg),
        }
    }

    if inputs.is_empty() {
        bail!("No input given; pass a path, file:// URL or - for stdin");
    }
    Ok(CliArgs { config, inputs })
}

/// Logs progress and keeps the terminal result.
#[derive(Default)]
struct SummaryObserver {
    regions: usize,
    result: Option<Result<LoadedDocument, DecodeError>>,
}

impl DocumentObserver for SummaryObserver {
    fn size_known(&mut self, width: u32, height: u32) {
        info!(width, height, "Image size known");
    }

    fn region_updated(&mut self, rect: Rect) {
        self.regions += 1;
        debug!(?rect, "Region updated");
    }

    fn finished(&mut self, result: Result<LoadedDocument, DecodeError>) {
        self.result = Some(result);
    }
}

fn decode_one(input: &str, config: &DecodeConfig) -> Result<bool> {
    let location = DocumentLocation::parse(input);
    let source = ReaderChunkSource::new(config);
    let started = Instant::now();
    let mut session = Session::open(
        location,
        ImageCodec::new(),
        SummaryObserver::default(),
        config.clone(),
        &source,
    )?;
    let state = session.run();
    let used_fallback = session.scheduler().used_fallback();
    let elapsed_ms = started.elapsed().as_millis();
    let summary = session.into_observer();

    match (state, summary.result) {
        (DecodeState::Finished, Some(Ok(document))) => {
            let (width, height) = document.dimensions();
            let mut line = format!(
                "{input}: {:?} {width}x{height} {:?} regions={} fallback={} time={}ms",
                document.format(),
                document.image().color(),
                summary.regions,
                used_fallback,
                elapsed_ms
            );
            if let Some(path) = document.as_jpeg().and_then(|jpeg| jpeg.editable_path()) {
                line.push_str(&format!(" editable={}", path.display()));
            }
            println!("{line}");
            Ok(true)
        }
        (_, Some(Err(err))) => {
            eprintln!("{input}: failed: {err}");
            Ok(false)
        }
        (state, _) => {
            eprintln!("{input}: stopped in state {state:?}");
            Ok(false)
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idxd_decode=info".parse()?),
        )
        .init();

    let args = parse_args()?;
    let mut failures = 0usize;
    for input in &args.inputs {
        match decode_one(input, &args.config) {
            Ok(true) => {}
            Ok(false) => failures += 1,
            Err(err) => {
                eprintln!("{input}: {err:#}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
