#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::env;
use std::io::Read as _;

use anyhow::Context as _;
use imageio_client::control::{ControlClient, ControlTarget};
use seahorse::{App, Command, Context, Flag, FlagType};
use tokio::runtime;

fn main() {
    let args: Vec<String> = env::args().collect();

    if let Err(error) = setup_logger() {
        eprintln!("{error:?}");
        std::process::exit(1);
    }

    let app = App::new(env!("CARGO_PKG_NAME"))
        .description("Control-plane administration client for imageio-server")
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(format!("{} [add-ticket|show-ticket|mod-ticket|del-ticket|list-tickets]", "imageioctl"))
        .command(common_flags(
            Command::new("add-ticket")
                .description("Install a ticket from a JSON file (use '-' for stdin)")
                .usage("imageioctl add-ticket <FILE>")
                .action(add_ticket_action),
        ))
        .command(common_flags(
            Command::new("show-ticket")
                .description("Print a ticket's current status")
                .usage("imageioctl show-ticket <ID>")
                .action(show_ticket_action),
        ))
        .command(common_flags(
            Command::new("mod-ticket")
                .description("Extend a ticket's timeout")
                .usage("imageioctl mod-ticket <ID> --timeout <SECONDS>")
                .flag(Flag::new("timeout", FlagType::Uint).description("new timeout in seconds"))
                .action(mod_ticket_action),
        ))
        .command(common_flags(
            Command::new("del-ticket")
                .description("Remove a ticket, optionally after a grace period")
                .usage("imageioctl del-ticket <ID> [--timeout <SECONDS>]")
                .flag(Flag::new("timeout", FlagType::Uint).description("grace period in seconds before removal"))
                .action(del_ticket_action),
        ))
        .command(common_flags(
            Command::new("list-tickets")
                .description("List every ticket currently held by the server")
                .usage("imageioctl list-tickets")
                .action(list_tickets_action),
        ));

    app.run(args);
}

fn common_flags(cmd: Command) -> Command {
    cmd.flag(
        Flag::new("control", FlagType::String)
            .description("control listener address: a unix socket path, 'unix:<path>', or a TCP host:port (default /run/imageio/control.sock)"),
    )
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

fn setup_logger() -> anyhow::Result<()> {
    let filter = env::var("IMAGEIO_LOG").unwrap_or_else(|_| "warn".to_owned());
    tracing_subscriber::fmt().with_env_filter(filter).without_time().init();
    Ok(())
}

fn control_client(c: &Context) -> anyhow::Result<ControlClient> {
    let raw = opt_string_flag(c, "control")?.unwrap_or_else(|| "/run/imageio/control.sock".to_owned());
    let target = ControlTarget::parse(&raw)?;
    Ok(ControlClient::new(target))
}

fn run<F: std::future::Future<Output = anyhow::Result<()>>>(f: F) -> anyhow::Result<()> {
    let rt = runtime::Builder::new_multi_thread().enable_all().build().context("runtime build failed")?;
    rt.block_on(f)
}

/// Exit codes follow the convention the control-plane CLI documents: 0 on success, 2 on a usage
/// error (missing argument, bad flag), 1 on anything that failed while talking to the server.
fn exit(res: anyhow::Result<()>, usage_error: bool) -> ! {
    match res {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("{error:?}");
            std::process::exit(if usage_error { 2 } else { 1 });
        }
    }
}

fn required_arg(c: &Context, index: usize, name: &str) -> anyhow::Result<String> {
    c.args.get(index).cloned().with_context(|| format!("missing {name} argument"))
}

// add-ticket

fn add_ticket_action(c: &Context) {
    let mut usage_error = false;
    let res = (|| -> anyhow::Result<()> {
        let file = required_arg(c, 0, "FILE").inspect_err(|_| usage_error = true)?;

        let raw = if file == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading ticket JSON from stdin")?;
            buf
        } else {
            std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?
        };
        let spec: serde_json::Value = serde_json::from_str(&raw).context("ticket document is not valid JSON")?;
        let ticket_id = spec
            .get("uuid")
            .and_then(serde_json::Value::as_str)
            .with_context(|| {
                usage_error = true;
                "ticket document is missing a string 'uuid' field"
            })?
            .to_owned();

        let client = control_client(c)?;
        run(client.add_ticket(&ticket_id, spec))?;
        println!("{ticket_id}");
        Ok(())
    })();
    exit(res, usage_error);
}

// show-ticket

fn show_ticket_action(c: &Context) {
    let mut usage_error = false;
    let res = (|| -> anyhow::Result<()> {
        let ticket_id = required_arg(c, 0, "ID").inspect_err(|_| usage_error = true)?;
        let client = control_client(c)?;
        let status = run(client.show_ticket(&ticket_id))?;
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    })();
    exit(res, usage_error);
}

// mod-ticket

fn mod_ticket_action(c: &Context) {
    let mut usage_error = false;
    let res = (|| -> anyhow::Result<()> {
        let ticket_id = required_arg(c, 0, "ID").inspect_err(|_| usage_error = true)?;
        let timeout = opt_uint_flag(c, "timeout")?.with_context(|| {
            usage_error = true;
            "missing --timeout"
        })?;

        let client = control_client(c)?;
        run(client.mod_ticket(&ticket_id, timeout as u64))?;
        Ok(())
    })();
    exit(res, usage_error);
}

// del-ticket

fn del_ticket_action(c: &Context) {
    let mut usage_error = false;
    let res = (|| -> anyhow::Result<()> {
        let ticket_id = required_arg(c, 0, "ID").inspect_err(|_| usage_error = true)?;
        let timeout = opt_uint_flag(c, "timeout")?.map(|t| t as u64);

        let client = control_client(c)?;
        run(client.del_ticket(&ticket_id, timeout))?;
        Ok(())
    })();
    exit(res, usage_error);
}

// list-tickets

fn list_tickets_action(c: &Context) {
    let res = (|| -> anyhow::Result<()> {
        let client = control_client(c)?;
        let tickets = run(client.list_tickets())?;
        println!("{}", serde_json::to_string_pretty(&tickets)?);
        Ok(())
    })();
    exit(res, false);
}
