//! Client for the in-guest file-transfer server.
//!
//! A two-channel protocol: each operation opens a short-lived TCP
//! **control** connection carrying `\n`-delimited ASCII command lines,
//! and data-bearing operations open an ephemeral **data** connection on
//! a second port advertised by the server. The handshake is strict:
//! welcome, command, parameter reply, acknowledgement, transfer,
//! acknowledgement, result.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{Error, Result};

/// Delimiter between fields on the control channel.
const DELIMITER: u8 = b'\n';

/// Acknowledgement sent by the client.
pub const ACKNOW: &[u8] = b"100 ACK";

/// Success sentinel sent by the server.
pub const RES_OK: &str = "200 AIGT";

const CONTROL_RETRIES: usize = 5;
const CONTROL_RETRY_WAIT: Duration = Duration::from_secs(5);
const DATA_RETRIES: usize = 5;
const DATA_RETRY_WAIT: Duration = Duration::from_millis(500);
const OP_TIMEOUT: Duration = Duration::from_secs(120);
const BYE_TIMEOUT: Duration = Duration::from_secs(5);

/// Data-channel block size for a transfer of `size` bytes.
pub fn block_size(size: u64) -> usize {
    if size < 4096 {
        1024
    } else if size < 8192 {
        2048
    } else if size < 16384 {
        4096
    } else {
        8192
    }
}

/// Per-connection state announced by the server on connect.
#[derive(Debug, Clone)]
pub struct Welcome {
    pub version: String,
    pub cwd: String,
    pub user: String,
    pub euid: u32,
}

fn server_error(reply: &str) -> Error {
    let (code, message): (u16, &'static str) = match reply.get(0..3) {
        Some("301") => (301, "Permission denied"),
        Some("302") => (302, "No such file or directory"),
        Some("303") => (303, "Not a directory"),
        Some("304") => (304, "File is currently in use"),
        Some("305") => (305, "Unsupported command"),
        Some("306") => (306, "Invalid arguments specified"),
        Some("307") => (307, "File already exists on server"),
        Some("308") => (308, "Unknown error"),
        Some("309") => (309, "Is a directory"),
        _ => {
            return Error::TransferProtocol(format!("unknown server response: {reply:?}"));
        }
    };
    Error::TransferServer { code, message }
}

/// Client half of the transfer protocol, bound to the in-guest server's
/// address.
pub struct TransferClient {
    host: String,
    port: u16,
}

impl TransferClient {
    /// Build a client. Only byte-transparent encodings are supported on
    /// the wire; anything else is refused up front.
    pub fn new(host: impl Into<String>, port: u16, encoding: &str) -> Result<Self> {
        match encoding.to_ascii_lowercase().as_str() {
            "ascii" | "utf-8" | "utf8" => Ok(Self {
                host: host.into(),
                port,
            }),
            other => Err(Error::Config(format!(
                "unsupported transfer encoding '{other}'"
            ))),
        }
    }

    /// Download `filename` from the server into the current directory.
    ///
    /// Refuses to overwrite a local file that already exists.
    pub async fn get(&self, filename: &str) -> Result<()> {
        let path = Path::new(filename);
        if path.exists() {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("refusing to overwrite {filename}"),
            )));
        }

        let (mut control, _welcome) = self.open_control().await?;

        control
            .write_all(&join_fields(&["GET", filename]))
            .await
            .map_err(reset)?;

        let params = read_reply(&mut control, 64).await?;
        if !params.starts_with(RES_OK) {
            control.write_all(ACKNOW).await.map_err(reset)?;
            return Err(server_error(&params));
        }

        let (port, size) = parse_get_params(&params)?;
        debug!(filename, port, size, "reading file from data channel");
        control.write_all(ACKNOW).await.map_err(reset)?;

        let mut data =
            connect_with_retries(&self.host, port, DATA_RETRIES, DATA_RETRY_WAIT).await?;

        let mut file = fs::File::create(path).await?;
        let mut buf = vec![0u8; block_size(size)];
        let mut received: u64 = 0;
        while received < size {
            let n = timeout(OP_TIMEOUT, data.read(&mut buf))
                .await
                .map_err(|_| Error::TransferProtocol("data channel read timed out".into()))?
                .map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::TransferProtocol(format!(
                    "data channel closed after {received} of {size} bytes"
                )));
            }
            file.write_all(&buf[..n]).await?;
            received += n as u64;
        }
        file.flush().await?;
        drop(data);

        control.write_all(ACKNOW).await.map_err(reset)?;
        let result = read_reply(&mut control, 16).await?;
        self.eval_result(&result, filename, received)
    }

    /// Upload `filename` to the server.
    ///
    /// The declared size is taken from the local file, which must exist.
    pub async fn put(&self, filename: &str) -> Result<()> {
        let path = Path::new(filename);
        let size = match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("no local file {filename}"),
                )));
            }
        };

        let (mut control, _welcome) = self.open_control().await?;

        control
            .write_all(&join_fields(&["PUT", filename, &size.to_string()]))
            .await
            .map_err(reset)?;

        let params = read_reply(&mut control, 64).await?;
        if !params.starts_with(RES_OK) {
            control.write_all(ACKNOW).await.map_err(reset)?;
            return Err(server_error(&params));
        }

        let port = parse_put_params(&params)?;
        debug!(filename, port, size, "sending file on data channel");
        control.write_all(ACKNOW).await.map_err(reset)?;

        let mut data =
            connect_with_retries(&self.host, port, DATA_RETRIES, DATA_RETRY_WAIT).await?;

        let mut file = fs::File::open(path).await?;
        let mut buf = vec![0u8; block_size(size)];
        let mut sent: u64 = 0;
        while sent < size {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            timeout(OP_TIMEOUT, data.write_all(&buf[..n]))
                .await
                .map_err(|_| Error::TransferProtocol("data channel write timed out".into()))?
                .map_err(Error::Io)?;
            sent += n as u64;
        }
        data.shutdown().await.ok();
        drop(data);

        let result = read_reply(&mut control, 16).await?;
        self.eval_result(&result, filename, sent)
    }

    /// Delete `filename` on the server.
    pub async fn delete(&self, filename: &str) -> Result<()> {
        let (mut control, _welcome) = self.open_control().await?;
        control
            .write_all(&join_fields(&["DEL", filename]))
            .await
            .map_err(reset)?;
        let result = read_reply(&mut control, 16).await?;
        self.eval_result(&result, filename, 0)
    }

    /// Terminate the in-guest server.
    ///
    /// Opens a fresh control connection; the server expects `BYE` on its
    /// own connection rather than reusing the one from a prior transfer.
    pub async fn bye(&self) -> Result<()> {
        let (mut control, _welcome) = self.open_control().await?;
        control.write_all(b"BYE").await.map_err(reset)?;

        let reply = timeout(BYE_TIMEOUT, async {
            let mut buf = [0u8; 16];
            let n = control.read(&mut buf).await.map_err(Error::Io)?;
            Ok::<String, Error>(String::from_utf8_lossy(&buf[..n]).into_owned())
        })
        .await
        .map_err(|_| Error::TransferProtocol("no reply to BYE".into()))??;

        self.eval_result(&reply, "BYE", 0)
    }

    async fn open_control(&self) -> Result<(TcpStream, Welcome)> {
        let mut control =
            connect_with_retries(&self.host, self.port, CONTROL_RETRIES, CONTROL_RETRY_WAIT)
                .await?;
        let welcome = read_welcome(&mut control).await?;
        debug!(?welcome, "transfer server welcome");
        Ok((control, welcome))
    }

    fn eval_result(&self, reply: &str, what: &str, bytes: u64) -> Result<()> {
        let trimmed = reply.trim();
        if trimmed.starts_with(RES_OK) {
            debug!(what, bytes, "transfer command successful");
            Ok(())
        } else if trimmed.starts_with('3') {
            Err(server_error(trimmed))
        } else {
            Err(Error::TransferProtocol(format!(
                "unknown server response: {trimmed:?}"
            )))
        }
    }
}

fn reset(e: std::io::Error) -> Error {
    Error::TransferProtocol(format!("control connection reset: {e}"))
}

fn join_fields(fields: &[&str]) -> Vec<u8> {
    fields.join("\n").into_bytes()
}

async fn connect_with_retries(
    host: &str,
    port: u16,
    tries: usize,
    wait: Duration,
) -> Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..tries {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(host, port, attempt, "connect attempt failed: {e}");
                last_err = Some(e);
                if attempt + 1 < tries {
                    sleep(wait).await;
                }
            }
        }
    }
    Err(Error::TransferProtocol(format!(
        "could not connect to {host}:{port}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn read_reply(stream: &mut TcpStream, max: usize) -> Result<String> {
    let mut buf = vec![0u8; max];
    let n = timeout(OP_TIMEOUT, stream.read(&mut buf))
        .await
        .map_err(|_| Error::TransferProtocol("control channel read timed out".into()))?
        .map_err(Error::Io)?;
    if n == 0 {
        return Err(Error::TransferProtocol("connection reset by server".into()));
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

async fn read_welcome(stream: &mut TcpStream) -> Result<Welcome> {
    let raw = read_reply(stream, 512).await?;
    let fields: Vec<&str> = raw.split(DELIMITER as char).collect();
    if fields.len() < 5 || fields[0] != "HI" {
        return Err(Error::TransferProtocol(format!(
            "malformed welcome message: {raw:?}"
        )));
    }
    let euid = fields[4]
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::TransferProtocol(format!("malformed euid in welcome: {raw:?}")))?;
    Ok(Welcome {
        version: fields[1].to_string(),
        cwd: fields[2].to_string(),
        user: fields[3].to_string(),
        euid,
    })
}

fn parse_get_params(params: &str) -> Result<(u16, u64)> {
    let fields: Vec<&str> = params.split('\n').collect();
    if fields.len() < 3 {
        return Err(Error::TransferProtocol(format!(
            "malformed GET parameters: {params:?}"
        )));
    }
    let port = fields[1].trim().parse::<u16>();
    let size = fields[2].trim().parse::<u64>();
    match (port, size) {
        (Ok(p), Ok(s)) => Ok((p, s)),
        _ => Err(Error::TransferProtocol(format!(
            "malformed GET parameters: {params:?}"
        ))),
    }
}

fn parse_put_params(params: &str) -> Result<u16> {
    let fields: Vec<&str> = params.split('\n').collect();
    if fields.len() < 2 {
        return Err(Error::TransferProtocol(format!(
            "malformed PUT parameters: {params:?}"
        )));
    }
    fields[1]
        .trim()
        .parse::<u16>()
        .map_err(|_| Error::TransferProtocol(format!("malformed PUT parameters: {params:?}")))
}
