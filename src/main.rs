extern crate clap;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use fast_speed::display::{DisplayMode, StatusLine};
use fast_speed::errors::{exit_codes, SpeedTestError};
use fast_speed::fast::DEFAULT_URL_COUNT;
use fast_speed::results::{render_error, render_human, JsonReport};
use fast_speed::speedtest::bandwidth::DEFAULT_CONNECTIONS;
use fast_speed::speedtest::engine::{RunConfig, SpeedTestOutput, TestEngine};
use fast_speed::speedtest::latency::DEFAULT_TEST_COUNT;
use fast_speed::speedtest::{ProtocolPreference, StabilityCriteria};
use log::debug;
use std::io::IsTerminal;
use std::process::ExitCode;
use url::Url;

#[derive(Parser)]
#[command(
    author,
    version,
    long_version = env!("FASTSPEED_LONG_VERSION"),
    about,
    long_about = None
)]
struct Cli {
    /// IP protocol every connection must use: auto, 4 or 6
    #[arg(short, long, default_value = "auto")]
    protocol: ProtocolPreference,

    /// Also measure upload speed
    #[arg(short, long)]
    upload: bool,

    /// Ceiling for each bandwidth measurement, in seconds (never below 25)
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Print a single JSON record instead of the summary
    #[arg(long)]
    json: bool,

    /// Measure against these URLs instead of discovering servers
    #[arg(long = "url", value_name = "URL")]
    urls: Vec<Url>,

    /// How many servers to ask fast.com for
    #[arg(long, default_value_t = DEFAULT_URL_COUNT)]
    url_count: usize,

    /// Concurrent connections per bandwidth measurement
    #[arg(short, long, default_value_t = DEFAULT_CONNECTIONS)]
    connections: usize,

    /// Latency probes per server
    #[arg(long, default_value_t = DEFAULT_TEST_COUNT)]
    pings: usize,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

impl Cli {
    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig {
            protocol: self.protocol,
            urls: self.urls.clone(),
            url_count: self.url_count,
            run_upload: self.upload,
            ..RunConfig::default()
        };

        let floor = StabilityCriteria::default().max_duration_seconds;
        if let Some(seconds) = self.duration {
            config.criteria = config.criteria.with_max_duration_seconds(seconds.max(floor));
        }
        config.meter.connections = self.connections;
        config.latency.test_count = self.pings;

        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    // Another provider may already be installed; either one serves.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mode = DisplayMode::detect(cli.json, std::io::stdout().is_terminal());
    let config = cli.run_config();
    debug!("Run configuration: {:?}", config);

    let engine = TestEngine::new(config);
    let status = StatusLine::new(mode);

    let result = tokio::select! {
        result = engine.run_with_progress(&status) => result,
        _ = tokio::signal::ctrl_c() => Err(SpeedTestError::interrupted()),
    };

    if let Err(e) = status.clear() {
        debug!("Could not clear the status line: {}", e);
    }

    match result {
        Ok(output) => {
            if mode.is_json() {
                println!("{}", JsonReport::from_output(&output).to_json());
            } else {
                print!("{}", render_human(&output));
            }
            exit_code(&output)
        }
        Err(e) => {
            if mode.is_json() {
                println!("{}", JsonReport::from_error(&e).to_json());
            } else {
                eprintln!("{}", render_error(&e));
            }
            to_exit_code(e.exit_code())
        }
    }
}

/// Success only when every phase succeeded; a run whose phases all failed
/// reports the first failure's code.
fn exit_code(output: &SpeedTestOutput) -> ExitCode {
    let Some(error) = output.first_error() else {
        return to_exit_code(exit_codes::SUCCESS);
    };

    let any_success = output.latency.is_ok()
        || output.download.is_ok()
        || matches!(output.upload, Some(Ok(_)));

    if any_success {
        to_exit_code(exit_codes::PARTIAL_FAILURE)
    } else {
        to_exit_code(error.exit_code())
    }
}

fn to_exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
