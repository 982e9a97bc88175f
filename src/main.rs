use clap::Parser;
use std::{process::ExitCode, sync::Arc};
use tf2maps_crawler::{
    config::{Cli, LogFormat},
    data::SqliteStore,
    tf2maps, CrawlBuilder, FetchLedger, FileSink, MaxPages, MultiSink, ReqwestFetcher, Sink,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
        "info,html5ever=error,selectors=error,hyper=warn,reqwest=info,sqlx=warn".into()
    });
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default());
    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let files: Arc<dyn Sink> = Arc::new(FileSink::new(&cli.output_dir));
    let store = match &cli.db {
        Some(path) => Some(Arc::new(SqliteStore::new(path, "tf2maps").await?)),
        None => None,
    };
    let (sink, ledger): (Arc<dyn Sink>, Option<Arc<dyn FetchLedger>>) = match &store {
        Some(store) => {
            let records: Arc<dyn Sink> = store.clone();
            let ledger: Arc<dyn FetchLedger> = store.clone();
            (Arc::new(MultiSink(vec![files, records])), Some(ledger))
        }
        None => (files, None),
    };

    let fetcher = Arc::new(ReqwestFetcher::new(cli.fetch())?);
    let mut builder = CrawlBuilder::new(cli.engine(), fetcher);
    tf2maps::register(&mut builder, &cli.site(), MaxPages(cli.max_pages), ledger)?;
    let crawl = builder.build(sink)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight tasks");
                cancel.cancel();
            }
        });
    }

    info!("Saving records under {}", cli.output_dir.display());
    let summary = crawl.run(cancel).await?;
    summary.log();

    if let Some(store) = store {
        store.close().await;
    }

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
