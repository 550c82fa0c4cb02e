//! Manifest compiler (spec component L): parses a YAML device manifest,
//! validates it, and emits either its textual draft-CSV schema or the
//! full hashed/compressed wire envelope.
//!
//! C struct/header codegen from a compiled manifest is an explicit
//! non-goal here; `--codegen` only shells out to an external program with
//! the compiled bytes, it does not generate code itself.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use propcan::envelope::{add_envelope, DRAFT_CSV_ZLIB};
use propcan::manifest::{parse_manifest_yaml, serialize_manifest_draft_csv, validate_manifest};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(help = "Path to the YAML manifest source")]
    input: PathBuf,

    #[arg(short, long, value_enum, default_value = "envelope", help = "What to emit")]
    emit: EmitFormat,

    #[arg(short, long, help = "Write output here instead of stdout")]
    output: Option<PathBuf>,

    #[arg(
        long,
        help = "External program to invoke with the compiled draft-CSV schema on stdin (codegen hook, no codegen performed here)"
    )]
    codegen: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text", help = "Diagnostics format")]
    format: DiagnosticsFormat,

    #[arg(short, long, help = "Treat validation warnings as fatal")]
    strict: bool,

    #[arg(short, long, help = "Show debug messages")]
    debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmitFormat {
    /// Textual draft-CSV schema, uncompressed.
    Csv,
    /// The full hashed, length-prefixed, deflate-compressed envelope.
    Envelope,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DiagnosticsFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let source = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let manifest = parse_manifest_yaml(&source)
        .with_context(|| format!("failed to parse {} as a device manifest", args.input.display()))?;

    let problems = validate_manifest(&manifest);
    report_validation(&problems, args.format);
    if !problems.is_empty() && args.strict {
        bail!("{} validation issue(s) found, aborting (--strict)", problems.len());
    }

    let csv = serialize_manifest_draft_csv(&manifest);
    let bytes = match args.emit {
        EmitFormat::Csv => csv.clone(),
        EmitFormat::Envelope => add_envelope(&csv, DRAFT_CSV_ZLIB).context("failed to envelope manifest")?,
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
            info!("wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => {
            std::io::stdout()
                .write_all(&bytes)
                .context("failed to write to stdout")?;
        }
    }

    if let Some(codegen) = &args.codegen {
        run_codegen_hook(codegen, &csv)?;
    }

    Ok(())
}

fn report_validation(problems: &[propcan::manifest::ValidationError], format: DiagnosticsFormat) {
    match format {
        DiagnosticsFormat::Text => {
            for problem in problems {
                warn!("{problem}");
            }
            if problems.is_empty() {
                info!("manifest is valid");
            }
        }
        DiagnosticsFormat::Json => {
            let rendered: Vec<String> = problems.iter().map(|p| p.to_string()).collect();
            match serde_json::to_string_pretty(&rendered) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("failed to render validation diagnostics as json: {e}"),
            }
        }
    }
}

/// Dispatch the compiled draft-CSV schema to an external codegen tool over
/// stdin. We deliberately stop at "shell out with the bytes" — turning a
/// manifest into C structs/headers is a named non-goal of this crate.
fn run_codegen_hook(program: &std::path::Path, csv: &[u8]) -> Result<()> {
    info!("dispatching to external codegen hook {}", program.display());
    let mut child = Command::new(program)
        .stdin(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to launch codegen hook {}", program.display()))?;

    child
        .stdin
        .take()
        .expect("child stdin was requested as piped")
        .write_all(csv)
        .context("failed to write manifest to codegen hook's stdin")?;

    let status = child.wait().context("failed to wait on codegen hook")?;
    if !status.success() {
        bail!("codegen hook exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_format_parses_from_cli() {
        assert!(matches!(EmitFormat::from_str("csv", true), Ok(EmitFormat::Csv)));
        assert!(matches!(EmitFormat::from_str("envelope", true), Ok(EmitFormat::Envelope)));
    }
}
