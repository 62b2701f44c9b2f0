#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::env;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use imageio_client::transfer::{DownloadCfg, Progress, UploadCfg};
use seahorse::{App, Command, Context, Flag, FlagType};
use tokio::runtime;
use url::Url;

fn main() {
    let args: Vec<String> = env::args().collect();

    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(format!("{} [upload|download|checksum]", env!("CARGO_PKG_NAME")))
        .command(upload_command())
        .command(download_command())
        .command(checksum_command());

    app.run(args);
}

fn setup_logger() -> anyhow::Result<()> {
    let filter = env::var("IMAGEIO_LOG").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn run<F: std::future::Future<Output = anyhow::Result<()>>>(f: F) -> anyhow::Result<()> {
    let rt = runtime::Builder::new_multi_thread().enable_all().build().context("runtime build failed")?;

    rt.block_on(async {
        tokio::select! {
            res = f => res,
            res = tokio::signal::ctrl_c() => res.context("ctrl-c event"),
        }
    })
}

fn exit(res: anyhow::Result<()>) -> ! {
    match res {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("{error:?}");
            std::process::exit(1);
        }
    }
}

fn common_flags(cmd: Command) -> Command {
    cmd.flag(Flag::new("workers", FlagType::Uint).description("number of concurrent connections (default 8)"))
        .flag(Flag::new("ca-cert", FlagType::String).description("trust this PEM certificate in addition to the system roots"))
}

#[expect(deprecated, reason = "seahorse uses description() for the human readable description")]
fn opt_string_flag(context: &Context, name: &str) -> anyhow::Result<Option<String>> {
    use std::error::Error as _;
    match context.string_flag(name) {
        Ok(value) => Ok(Some(value)),
        Err(seahorse::error::FlagError::NotFound) => Ok(None),
        Err(error) => Err(anyhow::Error::msg(error.description().to_owned()).context(format!("invalid '{name}'"))),
    }
}

#[expect(deprecated, reason = "seahorse uses description() for the human readable description")]
fn opt_uint_flag(context: &Context, name: &str) -> anyhow::Result<Option<usize>> {
    use std::error::Error as _;
    match context.uint_flag(name) {
        Ok(value) => Ok(Some(value)),
        Err(seahorse::error::FlagError::NotFound) => Ok(None),
        Err(error) => Err(anyhow::Error::msg(error.description().to_owned()).context(format!("invalid '{name}'"))),
    }
}

fn progress_reporter() -> imageio_client::transfer::ProgressFn {
    Arc::new(|progress: Progress| {
        if progress.bytes_total > 0 {
            let pct = (progress.bytes_done as f64 / progress.bytes_total as f64) * 100.0;
            eprint!("\r{:>6.2}% ({}/{} bytes)", pct, progress.bytes_done, progress.bytes_total);
        }
    })
}

// upload

fn upload_command() -> Command {
    common_flags(
        Command::new("upload")
            .description("Upload a local disk image to a ticket")
            .usage(format!("{} upload <FILE> <TICKET_URL>", env!("CARGO_PKG_NAME")))
            .action(upload_action),
    )
}

fn upload_action(c: &Context) {
    let res = (|| -> anyhow::Result<()> {
        setup_logger()?;
        let file = Utf8PathBuf::from(c.args.first().context("missing FILE argument")?);
        let ticket_url = Url::parse(c.args.get(1).context("missing TICKET_URL argument")?)?;

        let mut cfg = UploadCfg::new(file, ticket_url);
        cfg.workers = opt_uint_flag(c, "workers")?.unwrap_or(8).max(1);
        cfg.ca_cert = opt_string_flag(c, "ca-cert")?.map(Utf8PathBuf::from);
        cfg.progress = progress_reporter();

        let result = run(imageio_client::upload(cfg));
        eprintln!();
        result
    })();
    exit(res);
}

// download

fn download_command() -> Command {
    common_flags(
        Command::new("download")
            .description("Download a ticket's image to a local file")
            .usage(format!("{} download <TICKET_URL> <FILE>", env!("CARGO_PKG_NAME")))
            .action(download_action),
    )
}

fn download_action(c: &Context) {
    let res = (|| -> anyhow::Result<()> {
        setup_logger()?;
        let ticket_url = Url::parse(c.args.first().context("missing TICKET_URL argument")?)?;
        let file = Utf8PathBuf::from(c.args.get(1).context("missing FILE argument")?);

        let mut cfg = DownloadCfg::new(ticket_url, file);
        cfg.workers = opt_uint_flag(c, "workers")?.unwrap_or(8).max(1);
        cfg.ca_cert = opt_string_flag(c, "ca-cert")?.map(Utf8PathBuf::from);
        cfg.progress = progress_reporter();

        let result = run(imageio_client::download(cfg));
        eprintln!();
        result
    })();
    exit(res);
}

// checksum

fn checksum_command() -> Command {
    Command::new("checksum")
        .description("Print the BLAKE2b checksum of a local disk image")
        .usage(format!("{} checksum <FILE>", env!("CARGO_PKG_NAME")))
        .action(checksum_action)
}

fn checksum_action(c: &Context) {
    let res = (|| -> anyhow::Result<()> {
        let file = Utf8PathBuf::from(c.args.first().context("missing FILE argument")?);
        let digest = run(imageio_client::checksum(&file))?;
        println!("{digest}  {file}");
        Ok(())
    })();
    exit(res);
}
