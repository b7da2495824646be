use clap::{Parser, Subcommand};

use common::telemetry::init_telemetry;

use control::command::serve::{serve, ServeArgs};
use control::command::status::{status, StatusArgs};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Run the control-plane HTTP server
    Serve(ServeArgs),
    /// Print cluster capacity and node status
    Status(StatusArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry("control");

    let args = Args::parse();

    match args.cmd {
        Cmd::Serve(serve_args) => {
            serve(serve_args).await?;
        }
        Cmd::Status(status_args) => {
            status(status_args).await?;
        }
    }

    Ok(())
}
