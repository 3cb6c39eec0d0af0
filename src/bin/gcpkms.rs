//! gcpkms CLI - run a single engine operation against local storage.
//!
//! ```text
//! gcpkms --storage-dir ./data config/write credentials=@sa.json
//! gcpkms keys/register key=payments crypto_key=projects/p/.../cryptoKeys/payments
//! gcpkms encrypt key=payments plaintext=hello
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gcpkms::kms::ClientFactory;
use gcpkms::{Backend, BackendOptions, FieldMap, FileStorage};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gcpkms")]
#[command(about = "Google Cloud KMS secrets engine - run one operation")]
#[command(version)]
struct Cli {
    /// Directory holding configuration and key aliases
    #[arg(long, default_value = ".gcpkms", env = "GCPKMS_STORAGE_DIR")]
    storage_dir: String,

    /// Operation name, e.g. keys/rotate
    operation: String,

    /// Operation fields as name=value (value @path reads a file)
    fields: Vec<String>,
}

fn parse_fields(args: &[String]) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for arg in args {
        let Some((name, value)) = arg.split_once('=') else {
            bail!("expected name=value, got {:?}", arg);
        };
        let value = match value.strip_prefix('@') {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path))?,
            None => value.to_string(),
        };
        fields.insert(name.to_string(), Value::String(value));
    }
    Ok(fields)
}

#[cfg(feature = "gcp")]
fn client_factory() -> Arc<dyn ClientFactory> {
    Arc::new(gcpkms::backends::gcp::GcpClientFactory::new())
}

#[cfg(all(feature = "mock", not(feature = "gcp")))]
fn client_factory() -> Arc<dyn ClientFactory> {
    tracing::warn!("built without the gcp feature, using the in-memory KMS");
    Arc::new(gcpkms::backends::mock::MockClientFactory::new())
}

#[cfg(not(any(feature = "mock", feature = "gcp")))]
compile_error!("the gcpkms binary needs the `gcp` or `mock` feature");

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gcpkms=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let fields = parse_fields(&cli.fields)?;

    let storage = FileStorage::new(&cli.storage_dir)
        .await
        .with_context(|| format!("failed to open storage at {}", cli.storage_dir))?;
    let backend = Backend::with_options(client_factory(), BackendOptions::from_env());

    match backend.handle(&cli.operation, &storage, fields).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&Value::Object(response))?);
            Ok(())
        }
        Err(err) => {
            eprintln!(
                "{}",
                json!({"status": err.status_code(), "error": err.to_string()})
            );
            std::process::exit(1);
        }
    }
}
