use bytes::{Buf, BytesMut};
use chrono::Utc;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::protocol::{standby_status_update, CopyBothMessage};
use crate::config::PostgresConfig;
use crate::lsn::Lsn;
use crate::{Error, Result};

const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// One backend message as read off the socket.
///
/// `postgres-protocol` does not know CopyBothResponse, so it is split off by
/// its tag before the rest of the buffer reaches [`backend::Message::parse`].
pub(crate) enum BackendFrame {
    CopyBothResponse,
    Message(backend::Message),
}

/// Takes the next complete frame off the front of `buf`, or `None` when more
/// bytes are needed.
pub(crate) fn parse_frame(buf: &mut BytesMut) -> Result<Option<BackendFrame>> {
    if buf.first() != Some(&COPY_BOTH_RESPONSE_TAG) {
        return backend::Message::parse(buf)
            .map(|message| message.map(BackendFrame::Message))
            .map_err(Error::protocol);
    }

    if buf.len() < 5 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len < 4 {
        return Err(Error::Protocol(format!(
            "Invalid CopyBothResponse length: {}",
            len
        )));
    }
    if buf.len() < len + 1 {
        buf.reserve(len + 1 - buf.len());
        return Ok(None);
    }

    buf.advance(len + 1);
    Ok(Some(BackendFrame::CopyBothResponse))
}

/// A connection opened with `replication=database`, speaking the walsender
/// command set (CREATE_REPLICATION_SLOT, START_REPLICATION, ...).
///
/// tokio-postgres 0.7 cannot enter CopyBoth mode, so the connection drives
/// the frontend/backend protocol directly through `postgres-protocol`.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    copy_both: bool,
    closed: bool,
}

impl ReplicationConnection {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        debug!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Opening replication connection"
        );

        let stream = timeout(
            config.connect_timeout(),
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "Timed out connecting to {}:{}",
                config.host, config.port
            ))
        })?
        .map_err(|e| {
            Error::Connection(format!(
                "Failed to connect to {}:{}: {}",
                config.host, config.port, e
            ))
        })?;
        stream.set_nodelay(true).map_err(Error::connection)?;

        let mut connection = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(1024),
            copy_both: false,
            closed: false,
        };

        let params = [
            ("user", config.username.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", config.application_name.as_str()),
            ("client_encoding", "UTF8"),
        ];
        frontend::startup_message(params.iter().copied(), &mut connection.write_buf)
            .map_err(Error::protocol)?;
        connection.send().await?;
        connection.authenticate(config).await?;

        debug!("Replication connection ready");
        Ok(connection)
    }

    async fn authenticate(&mut self, config: &PostgresConfig) -> Result<()> {
        let user = config.username.as_bytes();
        let password = config.password.as_bytes();

        loop {
            match self.read_message().await? {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                }
                backend::Message::AuthenticationCleartextPassword => {
                    frontend::password_message(password, &mut self.write_buf)
                        .map_err(Error::protocol)?;
                    self.send().await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let hash = authentication::md5_hash(user, password, body.salt());
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)
                        .map_err(Error::protocol)?;
                    self.send().await?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut scram_offered = false;
                    while let Some(mechanism) = mechanisms.next().map_err(Error::protocol)? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            scram_offered = true;
                        }
                    }
                    if !scram_offered {
                        return Err(Error::Authentication(
                            "Server does not offer SCRAM-SHA-256".to_string(),
                        ));
                    }
                    self.authenticate_scram(password).await?;
                }
                backend::Message::ErrorResponse(body) => {
                    let (_, message) = parse_error(&body)?;
                    return Err(Error::Authentication(message));
                }
                backend::Message::ParameterStatus(_)
                | backend::Message::BackendKeyData(_)
                | backend::Message::NoticeResponse(_) => {}
                backend::Message::ReadyForQuery(_) => return Ok(()),
                _ => {
                    return Err(Error::Protocol(
                        "Unexpected message during authentication".to_string(),
                    ))
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, password: &[u8]) -> Result<()> {
        let mut scram = sasl::ScramSha256::new(password, sasl::ChannelBinding::unsupported());

        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)
            .map_err(Error::protocol)?;
        self.send().await?;

        match self.read_message().await? {
            backend::Message::AuthenticationSaslContinue(body) => {
                scram
                    .update(body.data())
                    .map_err(|e| Error::Authentication(e.to_string()))?;
            }
            backend::Message::ErrorResponse(body) => {
                let (_, message) = parse_error(&body)?;
                return Err(Error::Authentication(message));
            }
            _ => {
                return Err(Error::Protocol(
                    "Expected SASL continue message".to_string(),
                ))
            }
        }

        frontend::sasl_response(scram.message(), &mut self.write_buf).map_err(Error::protocol)?;
        self.send().await?;

        match self.read_message().await? {
            backend::Message::AuthenticationSaslFinal(body) => scram
                .finish(body.data())
                .map_err(|e| Error::Authentication(e.to_string())),
            backend::Message::ErrorResponse(body) => {
                let (_, message) = parse_error(&body)?;
                Err(Error::Authentication(message))
            }
            _ => Err(Error::Protocol("Expected SASL final message".to_string())),
        }
    }

    /// Runs a replication command or SQL statement with the simple query
    /// protocol and collects its rows as text.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<QueryRow>> {
        debug!(query = %query, "Sending replication command");

        frontend::query(query, &mut self.write_buf).map_err(Error::protocol)?;
        self.send().await?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        let mut error = None;

        loop {
            match self.read_message().await? {
                backend::Message::RowDescription(body) => {
                    columns = body
                        .fields()
                        .map(|field| Ok(field.name().to_string()))
                        .collect()
                        .map_err(Error::protocol)?;
                }
                backend::Message::DataRow(body) => {
                    let buffer = body.buffer();
                    let values: Vec<Option<String>> = body
                        .ranges()
                        .map(|range| {
                            Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                        })
                        .collect()
                        .map_err(Error::protocol)?;
                    rows.push(QueryRow {
                        columns: columns.clone(),
                        values,
                    });
                }
                backend::Message::ErrorResponse(body) => {
                    let (code, message) = parse_error(&body)?;
                    error = Some(Error::Server { code, message });
                }
                backend::Message::CommandComplete(_)
                | backend::Message::EmptyQueryResponse
                | backend::Message::NoticeResponse(_)
                | backend::Message::ParameterStatus(_) => {}
                backend::Message::ReadyForQuery(_) => break,
                _ => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message in response to '{}'",
                        query
                    )))
                }
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Sends START_REPLICATION and waits for the server to enter CopyBoth mode.
    pub async fn start_replication(&mut self, command: &str) -> Result<()> {
        info!(command = %command, "Starting replication stream");

        frontend::query(command, &mut self.write_buf).map_err(Error::protocol)?;
        self.send().await?;

        loop {
            let message = match self.read_frame().await? {
                BackendFrame::CopyBothResponse => {
                    self.copy_both = true;
                    debug!("Entered CopyBoth mode");
                    return Ok(());
                }
                BackendFrame::Message(message) => message,
            };

            match message {
                backend::Message::ErrorResponse(body) => {
                    let (code, message) = parse_error(&body)?;
                    return Err(Error::Server { code, message });
                }
                backend::Message::NoticeResponse(_) | backend::Message::ParameterStatus(_) => {}
                _ => {
                    return Err(Error::Protocol(
                        "Unexpected response to START_REPLICATION".to_string(),
                    ))
                }
            }
        }
    }

    /// Reads the next replication message.
    ///
    /// Returns `Ok(None)` once the server has ended the stream. Cancel safe:
    /// partially received frames stay buffered for the next call.
    pub async fn recv(&mut self) -> Result<Option<CopyBothMessage>> {
        if !self.copy_both {
            return Err(Error::Protocol("No active replication stream".to_string()));
        }

        loop {
            match self.read_message().await? {
                backend::Message::CopyData(body) => {
                    return CopyBothMessage::parse(body.into_bytes()).map(Some);
                }
                backend::Message::CopyDone
                | backend::Message::CommandComplete(_)
                | backend::Message::ReadyForQuery(_) => {
                    debug!("Server ended the replication stream");
                    self.copy_both = false;
                    return Ok(None);
                }
                backend::Message::ErrorResponse(body) => {
                    let (code, message) = parse_error(&body)?;
                    self.copy_both = false;
                    return Err(Error::Server { code, message });
                }
                backend::Message::NoticeResponse(_) | backend::Message::ParameterStatus(_) => {}
                _ => {
                    return Err(Error::Protocol(
                        "Unexpected message in replication stream".to_string(),
                    ))
                }
            }
        }
    }

    /// Reports `lsn` as written, flushed and applied.
    pub async fn send_status_update(&mut self, lsn: Lsn, reply: bool) -> Result<()> {
        if !self.copy_both {
            return Err(Error::Protocol("No active replication stream".to_string()));
        }

        let payload = standby_status_update(lsn, Utc::now(), reply);
        frontend::CopyData::new(payload)
            .map_err(Error::protocol)?
            .write(&mut self.write_buf);
        self.send().await
    }

    /// Leaves CopyBoth mode if needed and terminates the session.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.copy_both {
            frontend::copy_done(&mut self.write_buf);
            self.copy_both = false;
        }
        frontend::terminate(&mut self.write_buf);

        let sent = self.send().await;
        if let Err(e) = self.stream.shutdown().await {
            warn!(error = %e, "Failed to shut down replication socket");
        }
        sent
    }

    async fn send(&mut self) -> Result<()> {
        self.stream
            .write_all(&self.write_buf)
            .await
            .map_err(Error::connection)?;
        self.stream.flush().await.map_err(Error::connection)?;
        self.write_buf.clear();
        Ok(())
    }

    async fn read_message(&mut self) -> Result<backend::Message> {
        match self.read_frame().await? {
            BackendFrame::Message(message) => Ok(message),
            BackendFrame::CopyBothResponse => Err(Error::Protocol(
                "Unexpected CopyBothResponse".to_string(),
            )),
        }
    }

    async fn read_frame(&mut self) -> Result<BackendFrame> {
        loop {
            if let Some(frame) = parse_frame(&mut self.read_buf)? {
                return Ok(frame);
            }

            let read = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(Error::connection)?;
            if read == 0 {
                self.copy_both = false;
                return Err(Error::Connection(
                    "Server closed the connection unexpectedly".to_string(),
                ));
            }
        }
    }
}

/// A row returned by [`ReplicationConnection::simple_query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl QueryRow {
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Value of the named column; `None` when absent or NULL.
    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.get_index(index)
    }

    pub fn get_index(&self, index: usize) -> Option<&str> {
        self.values.get(index)?.as_deref()
    }
}

fn parse_error(body: &backend::ErrorResponseBody) -> Result<(String, String)> {
    let mut code = String::new();
    let mut message = String::new();

    let mut fields = body.fields();
    while let Some(field) = fields.next().map_err(Error::protocol)? {
        match field.type_() {
            b'C' => code = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            b'M' => message = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            _ => {}
        }
    }

    Ok((code, message))
}
