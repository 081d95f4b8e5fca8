mod cli;

use crate::cli::{Command, CLI};
use anyhow::{bail, Context};
use clap::Parser;
use snip_core::{BatchInput, OwnerId, ShortCode, StorageError};
use snip_storage::StorageFactory;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CLI::parse();
    snip_telemetry::init(cli.log_format.into())?;

    let config = cli.storage_config();
    info!(
        backend = %config.backend_kind(),
        base_url = %config.base_url,
        owner = %cli.owner,
        "starting snip"
    );
    let storage = StorageFactory::open(&config).await?;
    let owner = OwnerId::new(cli.owner.as_str());

    match cli.command {
        Command::Shorten { url } => match storage.add_url(&owner, &url).await {
            Ok(code) => println!("{}", code.to_url(&config.base_url)),
            Err(StorageError::DuplicateContent { short_code }) => {
                println!("{}", short_code.to_url(&config.base_url));
                eprintln!("already shortened");
            }
            Err(e) => return Err(e.into()),
        },
        Command::Batch => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("failed to read batch from stdin")?;
            let items: Vec<BatchInput> =
                serde_json::from_str(&raw).context("batch must be a JSON array")?;
            let outputs = storage.add_batch(&owner, items).await?;
            println!("{}", serde_json::to_string_pretty(&outputs)?);
        }
        Command::Resolve { code } => {
            let resolved = storage.get_full_url(&ShortCode::new(code)?).await?;
            if resolved.deleted {
                println!("gone");
            } else {
                println!("{}", resolved.original_url);
            }
        }
        Command::List => {
            let urls = storage.get_user_urls(&owner).await?;
            println!("{}", serde_json::to_string_pretty(&urls)?);
        }
        Command::Delete { codes } => {
            let codes = codes
                .into_iter()
                .map(ShortCode::new)
                .collect::<Result<Vec<_>, _>>()?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling deletion");
                    on_interrupt.cancel();
                }
            });

            let report = storage.delete_urls(&owner, codes, cancel).wait().await?;
            println!(
                "requested={} resolved={} deleted={}",
                report.requested, report.resolved, report.deleted
            );
        }
        Command::Ping => {
            if !storage.ping().await {
                bail!("{} storage is unreachable", storage.backend());
            }
            println!("ok");
        }
    }

    Ok(())
}
