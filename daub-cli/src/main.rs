use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::Parser;
use daub_core::{
    CandleBackend, DeviceMap, Engine, EngineConfig, GenerationRequest, ImageSource, SystemProbe,
    DEFAULT_GUIDANCE_SCALE, DEFAULT_STEPS, DEFAULT_STRENGTH,
};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Turn rough drawings into images with latent consistency models"
)]
struct Args {
    /// Print the selectable models and exit
    #[arg(long)]
    list_models: bool,

    /// Display name of the model to load
    #[arg(long, default_value = "Dreamshaper7")]
    model: String,

    #[arg(long, default_value = "")]
    prompt: String,

    #[arg(long, default_value = "")]
    negative_prompt: String,

    #[arg(long, default_value_t = DEFAULT_STEPS)]
    steps: usize,

    #[arg(long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    guidance: f64,

    /// How far the result may drift from the drawing, in (0, 1]
    #[arg(long, default_value_t = DEFAULT_STRENGTH)]
    strength: f64,

    #[arg(long, default_value_t = 1337)]
    seed: u64,

    /// Influence of the reference image
    #[arg(long, default_value_t = 1.0)]
    ip_scale: f64,

    /// Reference image for image-prompt conditioning
    #[arg(long)]
    ip_reference: Option<PathBuf>,

    /// The drawing to transform
    #[arg(long)]
    input: Option<PathBuf>,

    /// Where the result is written, replacing any previous file
    #[arg(long, default_value = "result.png")]
    output: PathBuf,

    /// Regenerate whenever the input file changes
    #[arg(long)]
    watch: bool,

    #[arg(long, default_value_t = 250)]
    interval_ms: u64,

    /// Generate a starting image from the prompt alone
    #[arg(long)]
    preimage: bool,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// JSON engine configuration
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::from_env(),
        };
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if self.cpu {
            config.device_map = DeviceMap::ForceCpu;
        }
        if let Some(reference) = &self.ip_reference {
            config.use_image_prompt = true;
            config.reference_image = Some(reference.clone());
        }
        Ok(config)
    }

    fn request(&self, input: &Path) -> GenerationRequest {
        GenerationRequest {
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            guidance_scale: self.guidance,
            strength: self.strength,
            ip_scale: self.ip_scale,
            ..GenerationRequest::new(self.prompt.clone(), input.to_path_buf(), self.seed)
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn run_once(engine: &mut Engine<CandleBackend>, args: &Args, input: &Path) -> Result<()> {
    let session = engine.session().context("no model loaded")?;
    let result = session.infer(&args.request(input))?;
    result
        .image
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    tracing::info!(output = %args.output.display(), "wrote result");
    Ok(())
}

async fn watch(engine: &mut Engine<CandleBackend>, args: &Args, input: &Path) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut last_seen = None;
    tracing::info!(input = %input.display(), "watching for changes, ctrl-c to stop");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let stamp = modified(input);
                if stamp.is_none() || stamp == last_seen {
                    continue;
                }
                last_seen = stamp;
                // keep watching after a failed frame
                if let Err(err) = run_once(engine, args, input) {
                    tracing::error!("generation failed: {err:#}");
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("stopping");
                return Ok(());
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    if args.list_models {
        for name in Engine::<CandleBackend>::list_models() {
            println!("{name}");
        }
        return Ok(());
    }

    let config = args.engine_config()?;
    let backend = CandleBackend::new(&config)?;
    let mut engine = Engine::new(backend, config, &SystemProbe)?;
    tracing::info!(profile = ?engine.profile(), "engine ready");

    if args.preimage {
        let image = engine.generate_preimage(&args.prompt, &args.model)?;
        image
            .save(&args.output)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        tracing::info!(output = %args.output.display(), "wrote preimage");
        return Ok(());
    }

    let Some(input) = args.input.clone() else {
        bail!("--input is required unless --preimage or --list-models is given");
    };
    // probe the file before spending time on weights
    ImageSource::Path(input.clone())
        .decode()
        .with_context(|| format!("failed to read {}", input.display()))?;

    engine.select_model(&args.model)?;
    if args.watch {
        watch(&mut engine, &args, &input).await
    } else {
        run_once(&mut engine, &args, &input)
    }
}
