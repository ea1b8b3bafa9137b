use std::process;

use anyhow::Context as _;
use hostbridge::{Bridge, BridgeConfig, FnObject, HandlerError, PropertyObject, Value};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_args(&args, BridgeConfig::from_env()) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: hostbridge [--url <ws-url>] [--cid <client-id>] [--feature <name>]...");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --url <url>        Backend WebSocket endpoint [env: HOSTBRIDGE_URL]");
            eprintln!("  --cid <id>         Client id [env: HOSTBRIDGE_CLIENT_ID, default: random]");
            eprintln!("  --feature <name>   Enable a feature flag, `-name` disables it");
            process::exit(2);
        }
    };

    hostbridge::init_tracing();

    if let Err(e) = run(config).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String], mut config: BridgeConfig) -> Result<BridgeConfig, String> {
    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--url" => {
                i += 1;
                config.url = args.get(i).ok_or("--url requires a value")?.clone();
            }
            "--cid" => {
                i += 1;
                config.client_id = args.get(i).ok_or("--cid requires a value")?.clone();
            }
            "--feature" => {
                i += 1;
                let name = args.get(i).ok_or("--feature requires a value")?;
                config = match name.strip_prefix('-') {
                    Some(disabled) => config.with_feature(disabled, false),
                    None => config.with_feature(name.as_str(), true),
                };
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(config)
}

/// Minimal host environment: a root object with a title and a `log` function.
fn demo_root() -> hostbridge::HostRef {
    let log = FnObject::new("log", |_this, args| {
        let line = args
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => format!("{:?}", other),
            })
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(target: "hostbridge::console", "{}", line);
        Ok(Value::Null)
    });
    let document = PropertyObject::new("document").with_property("title", "hostbridge");
    PropertyObject::new("window")
        .with_property(
            "console",
            PropertyObject::new("console")
                .with_property("log", log.into_ref())
                .into_ref(),
        )
        .with_property("document", document.into_ref())
        .into_ref()
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let url = config.connection_url();
    let bridge = Bridge::new(config, demo_root());

    bridge.commands().register_sync("title", |inv| {
        let root = inv.context.root();
        let document = root
            .get("document")
            .and_then(|d| d.as_host().cloned())
            .ok_or_else(|| HandlerError::msg("document missing"))?;
        if let Some(title) = inv.arg(0) {
            document.set("title", title.clone())?;
        }
        Ok(document.get("title").unwrap_or(Value::Null))
    });

    let state = bridge.context().subscribe_state();
    tracing::info!(%url, "Connecting to backend");
    bridge
        .connect()
        .await
        .with_context(|| format!("bridge to {url} failed"))?;
    tracing::info!(state = ?*state.borrow(), "Bridge finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("hostbridge")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_overrides_config() {
        let config = parse_args(
            &args(&["--url", "ws://h:1/ws", "--cid", "abc", "--feature", "friendly_obj_names"]),
            BridgeConfig::default(),
        )
        .unwrap();
        assert_eq!(config.url, "ws://h:1/ws");
        assert_eq!(config.client_id, "abc");
        assert_eq!(
            config.features.get("friendly_obj_names"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn parse_rejects_unknown_and_missing_values() {
        assert!(parse_args(&args(&["--bogus"]), BridgeConfig::default()).is_err());
        assert!(parse_args(&args(&["--url"]), BridgeConfig::default()).is_err());
        assert_eq!(
            parse_args(&args(&["-h"]), BridgeConfig::default()).unwrap_err(),
            ""
        );
    }

    #[test]
    fn demo_root_has_console_log() {
        let root = demo_root();
        let console = root.get("console").unwrap();
        let log = console.as_host().unwrap().get("log").unwrap();
        assert!(log.as_host().unwrap().is_invocable());
    }
}
