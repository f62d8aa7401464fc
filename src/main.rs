mod cli;

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use serde_json::{json, Map, Value};
use tracing::debug;

use storyforge_gateway::{
    extract_json_block, Gateway, GatewayConfig, GatewayError, ModelAllowlist, SamplingConfig,
};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(cli::Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<GatewayError>() {
                Some(gateway_err) => {
                    debug!("{err:#}");
                    eprintln!("error: {}", gateway_err.user_message());
                }
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: cli::Cli) -> anyhow::Result<()> {
    match cli.cmd {
        cli::Command::Models => {
            for allowlist in [ModelAllowlist::text(), ModelAllowlist::image()] {
                println!("{} models:", allowlist.modality());
                for (id, description) in allowlist.iter() {
                    println!("  {id:<32} {description}");
                }
            }
            Ok(())
        }
        cli::Command::Text {
            system,
            user,
            json,
            stream,
            model,
            fallback,
            timeout,
            temperature,
            top_p,
            top_k,
            max_output_tokens,
        } => {
            let cfg = GatewayConfig::load(cli.config.as_deref())?;
            let gateway = Gateway::new(cfg)?;

            let mut raw = Map::new();
            if let Some(v) = temperature {
                raw.insert("temperature".into(), json!(v));
            }
            if let Some(v) = top_p {
                raw.insert("topP".into(), json!(v));
            }
            if let Some(v) = top_k {
                raw.insert("topK".into(), json!(v));
            }
            if let Some(v) = max_output_tokens {
                raw.insert("maxOutputTokens".into(), json!(v));
            }

            let mut req = gateway
                .text_request(read_prompt(&system)?, read_prompt(&user)?)
                .json_mode(json)
                .timeout(parse_timeout(timeout)?)
                .sampling(SamplingConfig::sanitize(&Value::Object(raw)));
            if let Some(model) = model {
                req.primary_model = model;
            }
            if fallback.is_some() {
                req = req.fallback(fallback);
            }

            if stream {
                let chunks = gateway.generate_text_stream(&req)?;
                let mut stdout = io::stdout().lock();
                for chunk in chunks {
                    stdout.write_all(chunk?.as_bytes())?;
                    stdout.flush()?;
                }
                writeln!(stdout)?;
                return Ok(());
            }

            let text = gateway.generate_text(&req)?;
            if json {
                println!("{}", extract_json_block(&text));
            } else {
                println!("{text}");
            }
            Ok(())
        }
        cli::Command::Image {
            prompt,
            model,
            timeout,
            output,
        } => {
            let cfg = GatewayConfig::load(cli.config.as_deref())?;
            let gateway = Gateway::new(cfg)?;
            let data_url = gateway
                .generate_image(&prompt, parse_timeout(timeout)?, model.as_deref())?
                .ok_or_else(|| anyhow!("no image produced"))?;

            match output {
                Some(path) => write_data_url(&path, &data_url),
                None => {
                    println!("{data_url}");
                    Ok(())
                }
            }
        }
    }
}

fn read_prompt(arg: &str) -> anyhow::Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading prompt {path}")),
        None => Ok(arg.to_string()),
    }
}

fn parse_timeout(seconds: Option<f64>) -> anyhow::Result<Option<Duration>> {
    match seconds {
        None => Ok(None),
        Some(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
        Some(s) => bail!("--timeout must be a positive number of seconds, got {s}"),
    }
}

fn write_data_url(path: &Path, data_url: &str) -> anyhow::Result<()> {
    let (_, payload) = data_url
        .split_once(";base64,")
        .ok_or_else(|| anyhow!("provider returned a malformed data URL"))?;
    let bytes = BASE64
        .decode(payload)
        .context("decoding base64 image payload")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    eprintln!("wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
