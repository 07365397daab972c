use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{ReferenceImage, ScanMode, ScrfdDetector};
use facegate_engine::{
    spawn_engine, EngineConfig, EngineEvent, EngineHandle, EngineState, EngineView, ResultCause,
};
use facegate_hw::{CameraResourceManager, V4l2Backend};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate live face capture and verification")]
struct Cli {
    /// TOML configuration file (FACEGATE_* variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print every view update as a JSON line
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a reference face and save the normalized photo
    Enroll {
        /// Where to write the photo (format from extension, e.g. face.png)
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Verify the live face against a stored reference photo
    Verify {
        /// Reference photo (PNG or JPEG)
        #[arg(short, long)]
        reference: PathBuf,
        /// Give up after this many rejected attempts
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
    /// List V4L2 capture devices
    Devices,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = V4l2Backend::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Config => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Enroll { out } => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            enroll(&config, &out, cli.json).await?;
        }
        Commands::Verify {
            reference,
            attempts,
        } => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            let bytes = std::fs::read(&reference)
                .with_context(|| format!("failed to read reference {}", reference.display()))?;
            verify(&config, ReferenceImage::from_bytes(bytes), attempts, cli.json).await?;
        }
    }

    Ok(())
}

fn start(config: &EngineConfig, mode: ScanMode) -> EngineHandle {
    let camera = CameraResourceManager::new(V4l2Backend::new(
        config.camera_device.clone(),
        config.warmup_frames,
    ));
    let model_path = config.detector_model_path();
    spawn_engine(config, mode, camera, move || ScrfdDetector::load(&model_path))
}

/// Prints guidance whenever the state or status message changes.
struct Renderer {
    json: bool,
    last: Option<(EngineState, Option<String>, Option<String>)>,
}

impl Renderer {
    fn new(json: bool) -> Self {
        Self { json, last: None }
    }

    fn show(&mut self, view: &EngineView) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(view)?);
            return Ok(());
        }
        let key = (view.state, view.status.message.clone(), view.message.clone());
        if self.last.as_ref() == Some(&key) {
            return Ok(());
        }
        match (&view.message, &view.status.message) {
            (Some(message), _) => println!("[{:?}] {message}", view.state),
            (None, Some(guidance)) => println!("[{:?}] {guidance}", view.state),
            (None, None) => println!("[{:?}]", view.state),
        }
        self.last = Some(key);
        Ok(())
    }
}

async fn enroll(config: &EngineConfig, out: &Path, json: bool) -> Result<()> {
    let mut engine = start(config, ScanMode::Register);
    let mut views = engine.subscribe();
    let mut renderer = Renderer::new(json);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut saved = false;

    println!("Look at the camera and press Enter to take the photo.");
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                renderer.show(&view)?;
                match view.state {
                    EngineState::RegisterPreview => {
                        println!("Photo taken. Press Enter to keep it, or type r and Enter to retake.");
                    }
                    EngineState::Failed => {
                        engine.close()?;
                    }
                    _ => {}
                }
            }
            line = lines.next_line() => {
                let Some(input) = line? else {
                    engine.close()?;
                    continue;
                };
                let previewing = engine.view().state == EngineState::RegisterPreview;
                match (previewing, input.trim()) {
                    (true, "r") => engine.retake()?,
                    (true, _) => engine.confirm()?,
                    (false, _) => engine.capture()?,
                }
            }
            event = engine.next_event() => match event {
                Some(EngineEvent::Confirmed(image)) => {
                    image
                        .save(out)
                        .with_context(|| format!("failed to write {}", out.display()))?;
                    println!("Saved {}x{} photo to {}", image.width(), image.height(), out.display());
                    saved = true;
                }
                Some(EngineEvent::Result { .. }) => {}
                Some(EngineEvent::Closed) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                engine.close()?;
            }
        }
    }

    let last = engine.view();
    engine.join().await;
    if !saved {
        bail!(last.message.unwrap_or_else(|| "enrollment cancelled".to_string()));
    }
    Ok(())
}

async fn verify(config: &EngineConfig, reference: ReferenceImage, attempts: u32, json: bool) -> Result<()> {
    let mut engine = start(config, ScanMode::Verify(reference));
    let mut views = engine.subscribe();
    let mut renderer = Renderer::new(json);
    let mut rejected = 0u32;
    let mut matched = None;

    println!("Look at the camera and hold still.");
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                renderer.show(&view)?;
                if view.state == EngineState::Failed {
                    engine.close()?;
                }
            }
            event = engine.next_event() => match event {
                Some(EngineEvent::Result { success: true, score, .. }) => {
                    println!("Match (similarity {:.3})", score.unwrap_or_default());
                    matched = score;
                }
                Some(EngineEvent::Result { cause, score, .. }) => {
                    rejected += 1;
                    match cause {
                        ResultCause::Compared(diagnostic) => {
                            println!("No match: {diagnostic:?} (similarity {:.3})", score.unwrap_or_default());
                        }
                        ResultCause::ComparisonFailed(err) => println!("Comparison failed: {err}"),
                    }
                    if rejected >= attempts {
                        engine.close()?;
                    }
                }
                Some(EngineEvent::Confirmed(_)) => {}
                Some(EngineEvent::Closed) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                engine.close()?;
            }
        }
    }

    let last = engine.view();
    engine.join().await;
    match matched {
        Some(_) => Ok(()),
        None if rejected >= attempts => bail!("verification failed after {rejected} attempts"),
        None => bail!(last.message.unwrap_or_else(|| "verification cancelled".to_string())),
    }
}
