//! Dumps the token service's OpenAPI document, for client generation and CI
//! diffing.

use anyhow::Context;
use clap::Parser;
use pivots_api::router::ApiDoc;
use std::path::PathBuf;
use utoipa::OpenApi;

#[derive(Parser, Debug)]
#[command(version, about = "Write the Deep Pivots API OpenAPI document")]
struct Args {
    /// Where to write the document. `-` prints it to stdout.
    #[arg(long, short, default_value = "openapi.json")]
    out: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let json = ApiDoc::openapi()
        .to_pretty_json()
        .context("Failed to serialise the OpenAPI document")?;

    if args.out.as_os_str() == "-" {
        println!("{}", json);
    } else {
        std::fs::write(&args.out, json)
            .with_context(|| format!("Failed to write {}", args.out.display()))?;
        eprintln!("wrote {}", args.out.display());
    }
    Ok(())
}
