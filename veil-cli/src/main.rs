// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use veil::util::validators::{
  parse_destination, parse_secret_id, parse_socketaddr, validate_destination,
  validate_existing_file, validate_secret_id, validate_socketaddr,
};

mod client;
mod config;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Accept authenticated sessions and relay them to their destinations")
        .arg(
          Arg::new("config")
            .long("config")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("port")
            .help("Overrides the port of the configured listen address")
            .long("port")
            .short('p')
            .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|e| e.to_string()))
            .takes_value(true),
        )
        .arg(
          Arg::new("test")
            .help("Validate the configuration and exit")
            .long("test")
            .short('t'),
        ),
    )
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Forward a local port to a target through a remote server")
        .arg(
          Arg::new("server")
            .long("server")
            .short('s')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("id")
            .long("id")
            .short('i')
            .validator(validate_secret_id)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("alter-id")
            .long("alter-id")
            .short('a')
            .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|e| e.to_string()))
            .default_value("0")
            .takes_value(true),
        )
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:1080")
            .takes_value(true),
        )
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .validator(validate_destination)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    server: parse_socketaddr(args.value_of("server").unwrap())?,
    id: parse_secret_id(args.value_of("id").unwrap())?,
    alter_id: args.value_of("alter-id").unwrap().parse()?,
    listen: parse_socketaddr(args.value_of("listen").unwrap())?,
    target: parse_destination(args.value_of("target").unwrap())?,
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    config: PathBuf::from(args.value_of("config").unwrap()),
    port: args.value_of("port").map(str::parse::<u16>).transpose()?,
    test_only: args.is_present("test"),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("server", opts) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    ("client", opts) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
