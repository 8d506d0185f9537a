use anyhow::Context;
use clap::Parser;
use tracing::info;

use mssqlutil::config::Config;
use mssqlutil::filebuf::FileBuf;
use mssqlutil::logrec::LogRecord;
use mssqlutil::recover::Reconstructor;
use mssqlutil::{carve, catalog, logrec, recover, vlf};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let ldf = FileBuf::open(&config.log_file)?;

    if config.with_schema() {
        let data_path = config
            .data_file
            .as_deref()
            .context("--data is required when mode bit 0 is set")?;
        let mdf = FileBuf::open(data_path)?;
        let catalog = catalog::bootstrap(&mdf, data_path).context("catalog bootstrap")?;

        let records = scan_log(&ldf, &config)?;

        let mut reconstructor = Reconstructor::new(&mdf, &catalog);
        reconstructor.recover(&records);
        reconstructor.export(&config.output)?;

        info!(
            statements = reconstructor.queries.len(),
            "complete, output at {}",
            config.output.display()
        );
    } else {
        // without an MDF the log is parsed for records only; there is no
        // schema to decode row images against
        let records = scan_log(&ldf, &config)?;
        info!(records = records.len(), "complete (no MDF schema, statements not reconstructed)");
    }

    Ok(())
}

fn scan_log(ldf: &FileBuf, config: &Config) -> anyhow::Result<Vec<LogRecord>> {
    if config.carving() {
        let hits = carve::scan_file(ldf, config.jobs);
        return Ok(carve::process_hits(ldf, &hits));
    }

    let mut vlfs = vlf::scan_vlfs(ldf);
    vlf::scan_segments(ldf, &mut vlfs);
    let records = logrec::parse_vlfs(ldf, &vlfs);
    info!(records = records.len(), "log parse complete");

    if config.extract_records {
        recover::extract_records(ldf, &vlfs, &records)?;
    }

    Ok(records)
}
