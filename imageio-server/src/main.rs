use anyhow::Context as _;
use camino::Utf8PathBuf;
use imageio_server::config::load_conf_file_or_generate_new;
use imageio_server::service::ImageioService;
use imageio_task::ShutdownHandle;
use tracing::info;

fn default_config_path() -> Utf8PathBuf {
    Utf8PathBuf::from("/etc/imageio/imageio.json")
}

struct Args {
    config_path: Utf8PathBuf,
    config_init_only: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = default_config_path();
    let mut config_init_only = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-path" => {
                let value = args.next().context("--config-path requires a value")?;
                config_path = Utf8PathBuf::from(value);
            }
            "--config-init-only" => config_init_only = true,
            "--help" | "-h" => {
                println!("imageio-server [--config-path PATH] [--config-init-only]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }

    Ok(Args { config_path, config_init_only })
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let conf_handle = load_conf_file_or_generate_new(&args.config_path)?;

    if args.config_init_only {
        println!("wrote configuration to {}", args.config_path);
        return Ok(());
    }

    let conf = conf_handle.get_conf();
    let log_path = conf.data_dir.join("imageio.log");
    let debug_directives = std::env::var("IMAGEIO_LOG").ok();
    let _logger_guard = imageio_server::log::init(&log_path, &conf.log_filter, debug_directives.as_deref())
        .context("couldn't initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("couldn't build the tokio runtime")?;

    runtime.block_on(run(conf_handle))
}

async fn run(conf_handle: imageio_server::config::ConfHandle) -> anyhow::Result<()> {
    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let service = ImageioService::new(conf_handle);

    let service_fut = service.run(shutdown_signal);
    tokio::pin!(service_fut);

    tokio::select! {
        result = &mut service_fut => result,
        () = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            shutdown_handle.signal();
            service_fut.await
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
