use oblink_engine::converter::Quality;
use oblink_engine::devices;
use oblink_engine::jclient::{Config, JackBridge};
use oblink_engine::loopback::LoopbackTransport;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{Layer as FmtLayer, writer::MakeWriterExt},
    prelude::*,
};

fn usage() {
    eprintln!("Usage: oblink [options]");
    eprintln!("  -l, --list-devices        list supported devices and exit");
    eprintln!("  -d, --device NAME         device to bridge (default: Digitakt)");
    eprintln!("  -b, --blocks N            blocks per transfer (default: 24)");
    eprintln!("  -t, --timeout MS          transfer timeout in ms (default: 10)");
    eprintln!("  -q, --quality N           resampling quality 0 (best) to 4 (fastest)");
    eprintln!("  -p, --priority N          transport thread RT priority");
    eprintln!("  -v                        increase log verbosity (repeatable)");
    eprintln!("  -h, --help                show this help");
}

struct Options {
    list: bool,
    device: String,
    verbosity: u8,
    config: Config,
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        list: false,
        device: "Digitakt".to_string(),
        verbosity: 0,
        config: Config::default(),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("Missing value for {name}"))
        };
        match arg.as_str() {
            "-l" | "--list-devices" => options.list = true,
            "-d" | "--device" => options.device = value("--device")?,
            "-b" | "--blocks" => {
                options.config.blocks_per_transfer = value("--blocks")?
                    .parse()
                    .map_err(|e| format!("Invalid blocks per transfer: {e}"))?;
            }
            "-t" | "--timeout" => {
                options.config.xfr_timeout_ms = value("--timeout")?
                    .parse()
                    .map_err(|e| format!("Invalid timeout: {e}"))?;
            }
            "-q" | "--quality" => {
                let index: u8 = value("--quality")?
                    .parse()
                    .map_err(|e| format!("Invalid quality: {e}"))?;
                options.config.quality = Quality::from_index(index);
            }
            "-p" | "--priority" => {
                options.config.priority = value("--priority")?
                    .parse()
                    .map_err(|e| format!("Invalid priority: {e}"))?;
            }
            "-v" => options.verbosity += 1,
            "-vv" => options.verbosity += 2,
            "-h" | "--help" => {
                usage();
                std::process::exit(0);
            }
            other => return Err(format!("Unknown option '{other}'")),
        }
    }
    Ok(options)
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let stdout_layer = FmtLayer::new().with_writer(std::io::stdout.with_max_level(level));
    tracing_subscriber::registry().with(stdout_layer).init();
}

fn list_devices() -> Result<(), String> {
    for device in devices::all()? {
        println!(
            "{} ({:04x}:{:04x}): {} inputs, {} outputs",
            device.name,
            device.vendor_id,
            device.product_id,
            device.input_count(),
            device.output_count()
        );
    }
    Ok(())
}

async fn run() -> Result<(), String> {
    let options = parse_args()?;
    init_logging(options.verbosity);

    if options.list {
        return list_devices();
    }

    let desc = devices::by_name(&options.device)?;
    let bridge = Arc::new(JackBridge::new(desc, &options.config));

    let mut runner = {
        let bridge = bridge.clone();
        tokio::task::spawn_blocking(move || bridge.run(Box::new(LoopbackTransport::new())))
    };

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            bridge.stop();
            (&mut runner).await
        }
        result = &mut runner => result,
    };

    result.map_err(|e| format!("Bridge task failed: {e}"))?
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("oblink: {e}");
        std::process::exit(1);
    }
}
