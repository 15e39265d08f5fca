//! Replication-mode PostgreSQL connection.
//!
//! tokio-postgres cannot open a `replication=database` session, so this
//! connection speaks the wire protocol directly: startup handshake,
//! password authentication, replication commands over the simple-query
//! protocol, and the CopyBoth subprotocol for the WAL stream itself.
//! Cleartext and MD5 authentication are supported; SCRAM is not.

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::PostgresConfig;
use crate::postgres::protocol::{standby_status_update, Frame};
use crate::{Error, Result};

/// SQLSTATE for "duplicate object", raised when a persistent slot already
/// exists.
const DUPLICATE_OBJECT: &str = "42710";

pub struct ReplicationConnection {
    stream: BufReader<TcpStream>,
}

impl ReplicationConnection {
    /// Connect and authenticate a replication session.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "opening replication connection"
        );

        let connect = TcpStream::connect((config.host.as_str(), config.port));
        let stream = timeout(Duration::from_secs(config.connect_timeout_secs), connect)
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "timed out connecting to {}:{} after {}s",
                    config.host, config.port, config.connect_timeout_secs
                ))
            })??;
        let mut stream = BufReader::new(stream);

        let params = vec![
            ("user", config.username.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", "pg-watch"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)
            .map_err(|e| Error::Protocol(format!("startup message: {e}")))?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        authenticate(&mut stream, &config.username, &config.password).await?;

        // Drain parameter status messages until ReadyForQuery.
        loop {
            let (tag, _body) = read_message(&mut stream).await?;
            match tag {
                b'Z' => break,
                b'E' => {
                    return Err(Error::Connection(
                        "server rejected replication session".to_string(),
                    ))
                }
                _ => {}
            }
        }

        debug!("replication connection ready");
        Ok(Self { stream })
    }

    /// Create the logical slot, absorbing "already exists" for persistent
    /// slots. Returns the consistent point reported for a new slot.
    pub async fn create_slot(&mut self, slot_name: &str, temporary: bool) -> Result<Option<String>> {
        let temporary_clause = if temporary { " TEMPORARY" } else { "" };
        let command = format!(
            "CREATE_REPLICATION_SLOT {slot_name}{temporary_clause} LOGICAL pgoutput NOEXPORT_SNAPSHOT"
        );

        match self.simple_query(&command).await {
            Ok(rows) => {
                let consistent_point = rows
                    .first()
                    .and_then(|row| row.get(1).cloned().flatten());
                info!(
                    slot = slot_name,
                    consistent_point = consistent_point.as_deref().unwrap_or("unknown"),
                    "created replication slot"
                );
                Ok(consistent_point)
            }
            Err(Error::Replication { message }) if message.contains(DUPLICATE_OBJECT) => {
                debug!(slot = slot_name, "replication slot already exists");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the slot, ignoring "does not exist".
    pub async fn drop_slot(&mut self, slot_name: &str) -> Result<()> {
        match self
            .simple_query(&format!("DROP_REPLICATION_SLOT {slot_name} WAIT"))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Replication { message }) if message.contains("42704") => {
                warn!(slot = slot_name, "replication slot does not exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Enter the CopyBoth subprotocol for the given slot and publications.
    ///
    /// An LSN of `0/0` resumes from the slot's confirmed position.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        publications: &[String],
        start_lsn: crate::lsn::Lsn,
    ) -> Result<ReplicationStream> {
        let publication_names = publications.join(",");
        let command = format!(
            "START_REPLICATION SLOT {slot_name} LOGICAL {start_lsn} \
             (proto_version '1', publication_names '{publication_names}', messages 'true')"
        );
        info!(slot = slot_name, publications = %publication_names, %start_lsn, "starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&command, &mut buf)
            .map_err(|e| Error::Protocol(format!("query message: {e}")))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        loop {
            let (tag, body) = read_message(&mut self.stream).await?;
            match tag {
                b'W' => {
                    debug!("entered CopyBoth mode");
                    return Ok(ReplicationStream {
                        stream: self.stream,
                    });
                }
                b'E' => {
                    let (code, message) = parse_error_response(&body);
                    return Err(Error::Replication {
                        message: format!(
                            "START_REPLICATION failed: {} ({})",
                            message.unwrap_or_else(|| "unknown error".to_string()),
                            code.unwrap_or_default()
                        ),
                    });
                }
                _ => {}
            }
        }
    }

    /// Run a replication command over the simple-query protocol, returning
    /// any data rows as column value vectors.
    async fn simple_query(&mut self, command: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(command, &mut buf)
            .map_err(|e| Error::Protocol(format!("query message: {e}")))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let mut rows = Vec::new();
        let mut error: Option<Error> = None;
        loop {
            let (tag, body) = read_message(&mut self.stream).await?;
            match tag {
                b'D' => rows.push(parse_data_row(&body)?),
                b'E' => {
                    let (code, message) = parse_error_response(&body);
                    error = Some(Error::Replication {
                        message: format!(
                            "{} ({})",
                            message.unwrap_or_else(|| "command failed".to_string()),
                            code.unwrap_or_default()
                        ),
                    });
                }
                b'Z' => break,
                _ => {}
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }
}

/// The CopyBoth WAL stream.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Read the next replication frame.
    ///
    /// Returns `None` on a clean CopyDone from the server (temporary slot
    /// teardown or server shutdown).
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let (tag, body) = read_message(&mut self.stream).await?;
            match tag {
                b'd' => return Ok(Some(Frame::parse(Bytes::from(body))?)),
                b'c' => {
                    debug!("server finished the copy stream");
                    return Ok(None);
                }
                b'E' => {
                    let (code, message) = parse_error_response(&body);
                    return Err(Error::Replication {
                        message: format!(
                            "stream error: {} ({})",
                            message.unwrap_or_else(|| "unknown".to_string()),
                            code.unwrap_or_default()
                        ),
                    });
                }
                // CommandComplete / ReadyForQuery after CopyDone.
                b'C' | b'Z' => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during replication: '{}'",
                        other as char
                    )))
                }
            }
        }
    }

    /// Acknowledge `lsn` to the server with a standby status update.
    pub async fn ack(&mut self, lsn: crate::lsn::Lsn) -> Result<()> {
        let payload = standby_status_update(lsn.as_u64());
        let mut frame = BytesMut::with_capacity(payload.len() + 5);
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Tear the stream down, dropping the socket.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

async fn authenticate(
    stream: &mut BufReader<TcpStream>,
    user: &str,
    password: &str,
) -> Result<()> {
    loop {
        let (tag, body) = read_message(stream).await?;

        let mut raw = BytesMut::with_capacity(body.len() + 5);
        raw.put_u8(tag);
        raw.put_i32((body.len() + 4) as i32);
        raw.put_slice(&body);
        let message = backend::Message::parse(&mut raw)
            .map_err(|e| Error::Protocol(format!("parse auth message: {e}")))?
            .ok_or_else(|| Error::Protocol("incomplete auth message".to_string()))?;

        match message {
            backend::Message::AuthenticationOk => {
                debug!("authentication succeeded");
                return Ok(());
            }
            backend::Message::AuthenticationCleartextPassword => {
                let mut buf = BytesMut::new();
                frontend::password_message(password.as_bytes(), &mut buf)
                    .map_err(|e| Error::Protocol(format!("password message: {e}")))?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }
            backend::Message::AuthenticationMd5Password(body) => {
                let hash = md5_password(user, password, &body.salt());
                let mut buf = BytesMut::new();
                frontend::password_message(hash.as_bytes(), &mut buf)
                    .map_err(|e| Error::Protocol(format!("password message: {e}")))?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }
            backend::Message::AuthenticationSasl(_) => {
                return Err(Error::Authentication(
                    "server requires SCRAM authentication, which the replication \
                     connection does not support; configure md5 or password auth \
                     for the replication role"
                        .to_string(),
                ));
            }
            backend::Message::ErrorResponse(_) => {
                return Err(Error::Authentication(
                    "server rejected credentials".to_string(),
                ));
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "unexpected message during authentication: '{}'",
                    tag as char
                )))
            }
        }
    }
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let tag = stream.read_u8().await?;
    let len = stream.read_i32().await?;
    if len < 4 {
        return Err(Error::Protocol(format!("invalid message length: {len}")));
    }
    let mut body = vec![0u8; len as usize - 4];
    stream.read_exact(&mut body).await?;
    Ok((tag, body))
}

/// Parse a DataRow body: column count then (length, bytes) pairs.
fn parse_data_row(body: &[u8]) -> Result<Vec<Option<String>>> {
    use bytes::Buf;
    let mut cursor = body;
    if cursor.remaining() < 2 {
        return Err(Error::Protocol("truncated data row".to_string()));
    }
    let columns = cursor.get_u16();
    let mut values = Vec::with_capacity(columns as usize);
    for _ in 0..columns {
        if cursor.remaining() < 4 {
            return Err(Error::Protocol("truncated data row".to_string()));
        }
        let len = cursor.get_i32();
        if len < 0 {
            values.push(None);
        } else {
            let len = len as usize;
            if cursor.remaining() < len {
                return Err(Error::Protocol("truncated data row".to_string()));
            }
            values.push(Some(
                String::from_utf8_lossy(&cursor[..len]).into_owned(),
            ));
            cursor.advance(len);
        }
    }
    Ok(values)
}

/// Pull the SQLSTATE code ('C') and message ('M') out of an ErrorResponse
/// body: a sequence of (tag, cstring) fields terminated by a zero byte.
fn parse_error_response(body: &[u8]) -> (Option<String>, Option<String>) {
    let mut code = None;
    let mut message = None;
    let mut rest = body;
    while let Some((&tag, after)) = rest.split_first() {
        if tag == 0 {
            break;
        }
        let end = match after.iter().position(|&b| b == 0) {
            Some(end) => end,
            None => break,
        };
        let value = String::from_utf8_lossy(&after[..end]).into_owned();
        match tag {
            b'C' => code = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
        rest = &after[end + 1..];
    }
    (code, message)
}

fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}
