//! `ninecat` — a small `d9c`-style reference client: connect to a 9P
//! server at `proto!addr!port` and run one of six operations against a
//! single path.
//!
//! ```text
//! ninecat -s <socket> (read|cat|write|create|ls|lsd) <path> [<file>]
//! ```
//!
//! Exit codes: 0 success, 1 help shown, 3 connection error, 5 remote
//! closed unexpectedly, 10-15 a malformed invocation of one of the six
//! operations (unknown op, or the wrong number of arguments for the op
//! named), else the numeric `.u` errno reported by the server.

use clap::Parser;
use ninep::client::Client;
use ninep::error::Error;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

/// clap exits the process on `--help` before `run()` ever sees the
/// arguments; this documents which code that path corresponds to.
#[allow(dead_code)]
const EXIT_HELP: i32 = 1;
const EXIT_CONN: i32 = 3;
const EXIT_CLOSED: i32 = 5;
const EXIT_UNKNOWN_OP: i32 = 10;
const EXIT_BAD_ARGS_READ: i32 = 11;
const EXIT_BAD_ARGS_WRITE: i32 = 12;
const EXIT_BAD_ARGS_CREATE: i32 = 13;
const EXIT_BAD_ARGS_LS: i32 = 14;
const EXIT_BAD_ARGS_LSD: i32 = 15;

#[derive(Debug, clap::Parser)]
#[command(author, version, about = "d9c-style reference 9P client")]
struct Cli {
    /// proto!address!port of the server to dial, e.g. tcp!127.0.0.1!564
    #[arg(short = 's', long = "socket")]
    socket: String,

    /// read | cat | write | create | ls | lsd
    op: String,

    /// remote path the operation targets
    path: String,

    /// local file read from (write) or written to (read/cat), as needed
    file: Option<PathBuf>,
}

async fn dial(socket: &str) -> ninep::Result<Client<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>> {
    let (proto, host, port) = ninep::utils::parse_proto(socket)
        .ok_or_else(|| ninep::io_err!(InvalidInput, "invalid protocol or address"))?;

    match proto {
        "tcp" => {
            let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
            let (read, write) = stream.into_split();
            let write: Box<dyn tokio::io::AsyncWrite + Send + Unpin> = Box::new(write);
            Client::connect(read, write, "ninecat", "").await
        }
        "unix" => {
            let stream = UnixStream::connect(host).await?;
            let (read, write) = stream.into_split();
            let write: Box<dyn tokio::io::AsyncWrite + Send + Unpin> = Box::new(write);
            Client::connect(read, write, "ninecat", "").await
        }
        _ => Err(ninep::io_err!(InvalidInput, "protocol not supported").into()),
    }
}

/// Run the requested operation. Returns `Ok(0)` on success, or an
/// already-resolved exit code (bad invocation / connection failure).
async fn run(cli: &Cli) -> Result<i32, i32> {
    match cli.op.as_str() {
        "read" | "cat" => do_read(cli).await,
        "write" => {
            if cli.file.is_none() {
                return Err(EXIT_BAD_ARGS_WRITE);
            }
            do_write(cli).await
        }
        "create" => {
            if cli.file.is_none() {
                return Err(EXIT_BAD_ARGS_CREATE);
            }
            do_create(cli).await
        }
        "ls" => do_ls(cli, false).await,
        "lsd" => do_ls(cli, true).await,
        _ => Err(EXIT_UNKNOWN_OP),
    }
}

fn client_error_code(e: Error) -> i32 {
    match e {
        Error::Proto(_, errno) if errno != 0 => errno as i32,
        _ => EXIT_CLOSED,
    }
}

async fn do_read(cli: &Cli) -> Result<i32, i32> {
    let connect_err = EXIT_CONN;
    let client = dial(&cli.socket).await.map_err(|_| connect_err)?;
    let mut reader = client.open_read(&cli.path).await.map_err(client_error_code)?;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|_| EXIT_BAD_ARGS_READ)?;

    match &cli.file {
        Some(path) => tokio::fs::write(path, &buf).await.map_err(|_| EXIT_BAD_ARGS_READ)?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&buf).await.map_err(|_| EXIT_BAD_ARGS_READ)?;
        }
    }
    Ok(0)
}

async fn do_write(cli: &Cli) -> Result<i32, i32> {
    let file = cli.file.as_ref().ok_or(EXIT_BAD_ARGS_WRITE)?;
    let data = tokio::fs::read(file).await.map_err(|_| EXIT_BAD_ARGS_WRITE)?;

    let client = dial(&cli.socket).await.map_err(|_| EXIT_CONN)?;
    let mut writer = client.open_write(&cli.path).await.map_err(client_error_code)?;
    writer.write_all(&data).await.map_err(|_| EXIT_CLOSED)?;
    writer.shutdown().await.map_err(|_| EXIT_CLOSED)?;
    Ok(0)
}

async fn do_create(cli: &Cli) -> Result<i32, i32> {
    let file = cli.file.as_ref().ok_or(EXIT_BAD_ARGS_CREATE)?;
    let data = tokio::fs::read(file).await.map_err(|_| EXIT_BAD_ARGS_CREATE)?;

    let (dir, name) = split_parent(&cli.path);
    let client = dial(&cli.socket).await.map_err(|_| EXIT_CONN)?;
    let mut writer = client
        .open_create(&dir, &name, 0o644)
        .await
        .map_err(client_error_code)?;
    writer.write_all(&data).await.map_err(|_| EXIT_CLOSED)?;
    writer.shutdown().await.map_err(|_| EXIT_CLOSED)?;
    Ok(0)
}

async fn do_ls(cli: &Cli, long: bool) -> Result<i32, i32> {
    if cli.file.is_some() {
        return Err(if long { EXIT_BAD_ARGS_LSD } else { EXIT_BAD_ARGS_LS });
    }
    let client = dial(&cli.socket).await.map_err(|_| EXIT_CONN)?;
    let entries = client.list_dir(&cli.path).await.map_err(client_error_code)?;
    for stat in entries {
        if long {
            println!(
                "{:>6o} {:>8} {:>8} {:>10} {}",
                stat.mode, stat.uid, stat.gid, stat.length, stat.name
            );
        } else {
            println!("{}", stat.name);
        }
    }
    Ok(0)
}

fn split_parent(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir.to_owned(), name.to_owned()),
        None => (String::new(), path.to_owned()),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let exit_code = match run(&cli).await {
        Ok(code) => code,
        Err(code) => code,
    };
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_parent_and_name() {
        assert_eq!(split_parent("a/b/c"), ("a/b".to_owned(), "c".to_owned()));
        assert_eq!(split_parent("motd"), (String::new(), "motd".to_owned()));
    }

    #[tokio::test]
    async fn unknown_op_is_rejected() {
        let cli = Cli {
            socket: "tcp!127.0.0.1!1".to_owned(),
            op: "frobnicate".to_owned(),
            path: "/".to_owned(),
            file: None,
        };
        assert_eq!(run(&cli).await, Err(EXIT_UNKNOWN_OP));
    }

    #[tokio::test]
    async fn write_without_file_is_rejected_before_dialing() {
        let cli = Cli {
            socket: "tcp!127.0.0.1!1".to_owned(),
            op: "write".to_owned(),
            path: "/motd".to_owned(),
            file: None,
        };
        assert_eq!(run(&cli).await, Err(EXIT_BAD_ARGS_WRITE));
    }
}
