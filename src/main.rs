use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hearth_controller::daemon::build_speech_engine;
use hearth_controller::voice::MicCapture;
use hearth_controller::{Config, Daemon};

/// Hearth - home robot controller
#[derive(Parser)]
#[command(name = "hearth", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "HEARTH_PORT", default_value = "8778")]
    port: u16,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable voice input (for headless hosts without audio hardware)
    #[arg(long, env = "HEARTH_DISABLE_VOICE")]
    disable_voice: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speech output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,hearth_controller=info",
        1 => "info,hearth_controller=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestTts { text } => test_tts(text).await,
        };
    }

    tracing::info!(
        port = cli.port,
        disable_voice = cli.disable_voice,
        "starting hearth controller"
    );

    let mut config = Config::load_with_options(cli.disable_voice)?;
    config.api_server.port = cli.port;

    let daemon = Daemon::new(config)?;
    tracing::info!("hearth controller ready");
    daemon.run().await?;

    Ok(())
}

/// Test microphone input with a level meter
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut capture = MicCapture::new()?;
        capture.start()?;

        for i in 0..duration {
            std::thread::sleep(Duration::from_secs(1));
            let samples = capture.drain();
            let energy = rms(&samples);

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy * 100.0).min(50.0) as usize;
            let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
            println!("[{:2}s] RMS: {energy:.4} | [{meter}]", i + 1);
        }

        capture.stop();
        Ok(())
    })
    .await??;

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working.");
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Synthesize and play one utterance through the configured engine
async fn test_tts(text: String) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load()?;
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let engine = build_speech_engine(&config.speech);
        engine.speak(&text, &config.speech.default_voice)?;
        Ok(())
    })
    .await??;

    println!("\n---");
    println!("If you heard the speech, TTS is working.");
    Ok(())
}
