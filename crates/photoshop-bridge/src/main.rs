use std::process;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use photoshop_bridge::{BRIDGE_VERSION, Bridge, BridgeConfig, Value};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let remote_port = match parse_args(&args) {
        Ok(port) => port,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: photoshop-bridge <remote-port>");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <remote-port>    Port the Photoshop host extension listens on");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  PHOTOSHOP_BRIDGE_LOG             debug|info|warn|error [default: info]");
            eprintln!("  PHOTOSHOP_BRIDGE_NETWORK_DEBUG   log every frame on the wire");
            eprintln!("  LOG_FORMAT=json                  JSON log lines on stderr");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(remote_port) {
        tracing::error!(error = %format!("{e:#}"), "Bridge exited with error");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<u16, String> {
    let mut port: Option<u16> = None;

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            value => {
                if port.is_some() {
                    return Err(format!("unexpected argument: {value}"));
                }
                port = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid port '{value}'"))?,
                );
            }
        }
    }

    port.ok_or_else(|| "missing required argument: <remote-port>".to_string())
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PHOTOSHOP_BRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "photoshop_bridge={level},photoshop_bridge::network=debug"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run(remote_port: u16) -> anyhow::Result<()> {
    let config = BridgeConfig::from_env();
    tracing::info!(version = BRIDGE_VERSION, remote_port, "Starting photoshop-bridge");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        let bridge = Bridge::start(remote_port, config)
            .await
            .with_context(|| format!("failed to register with host on port {remote_port}"))?;

        let app = bridge
            .application()
            .await
            .context("failed to resolve the host application object")?;
        match app.get("version").await {
            Ok(Value::String(version)) => tracing::info!(%version, "Connected to Photoshop"),
            Ok(other) => tracing::info!(version = ?other, "Connected to Photoshop"),
            Err(e) => tracing::warn!(error = %e, "Connected, but could not read host version"),
        }

        bridge.main_queue().run_until(bridge.shutdown_token()).await;
        bridge.join().await;
        tracing::info!("Bridge stopped");
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("photoshop-bridge")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_port() {
        assert_eq!(parse_args(&args(&["49494"])), Ok(49494));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&[])).unwrap_err().contains("missing"));
        assert!(parse_args(&args(&["http"])).unwrap_err().contains("invalid port"));
        assert!(parse_args(&args(&["1", "2"])).unwrap_err().contains("unexpected"));
        assert!(parse_args(&args(&["--verbose"])).unwrap_err().contains("unknown flag"));
        assert_eq!(parse_args(&args(&["-h"])), Err(String::new()));
    }
}
