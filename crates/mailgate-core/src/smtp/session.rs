//! SMTP session engine
//!
//! Explicit state machine over one connection. The engine owns no
//! business logic; every accept/reject decision is delegated to the
//! ingestion coordinator at the connect, MAIL, RCPT, and DATA
//! transitions. A rejected command keeps the session open unless the
//! deployment is configured to cut the connection off.

use crate::ingest::IngestCoordinator;
use mailgate_common::config::SmtpConfig;
use mailgate_common::types::{EmailAddress, Envelope};
use mailgate_common::{Error, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Command lines are short; anything longer is a protocol violation
const COMMAND_LINE_MAX: usize = 2048;
/// Data lines may carry long encoded content
const DATA_LINE_MAX: usize = 8192;

/// Session states. Transitions happen only at successful commands; a
/// rejected command leaves the state unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    SenderDeclared,
    RecipientsAccepted,
    Receiving,
    Closed,
}

impl SessionState {
    fn accepts_mail(self) -> bool {
        self == SessionState::Connected
    }

    fn accepts_rcpt(self) -> bool {
        matches!(
            self,
            SessionState::SenderDeclared | SessionState::RecipientsAccepted
        )
    }

    fn accepts_data(self) -> bool {
        self == SessionState::RecipientsAccepted
    }
}

/// One parsed command line
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Helo(String),
    Ehlo(String),
    Mail {
        sender: Option<EmailAddress>,
        size: Option<u64>,
    },
    MailSyntax,
    Rcpt(EmailAddress),
    RcptSyntax,
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Auth,
    Unknown,
}

/// One SMTP session over an accepted connection
pub struct SmtpSession<S> {
    stream: S,
    config: SmtpConfig,
    coordinator: Arc<IngestCoordinator>,
    remote_ip: IpAddr,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpSession<S> {
    pub fn new(
        config: SmtpConfig,
        coordinator: Arc<IngestCoordinator>,
        remote_ip: IpAddr,
        stream: S,
    ) -> Self {
        Self {
            stream,
            config,
            coordinator,
            remote_ip,
        }
    }

    /// Drive the session to completion
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let SmtpSession {
            stream,
            config,
            coordinator,
            remote_ip,
        } = self;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);
        let idle = Duration::from_secs(config.connection_timeout_secs);

        if let Err(e) = coordinator.check_connect(remote_ip).await {
            debug!(%remote_ip, error = %e, "Connection rejected at connect");
            // 421 either way since the connection closes; infrastructure
            // trouble must not read as a rate-limit claim
            let text = match &e {
                Error::RateLimited => "4.7.0 Too many connections, try again later".to_string(),
                _ => e.smtp_reply().1,
            };
            send_reply(&mut writer, 421, &text).await?;
            return Ok(());
        }

        send_reply(
            &mut writer,
            220,
            &format!("{} ESMTP Mailgate", config.hostname),
        )
        .await?;

        let mut envelope = Envelope::new(remote_ip);
        let mut state = SessionState::Connected;
        let mut greeted = false;

        while state != SessionState::Closed {
            let line = tokio::select! {
                _ = shutdown.cancelled() => {
                    send_reply(&mut writer, 421, "4.3.2 Service shutting down").await?;
                    break;
                }
                read = timeout(idle, read_line_capped(&mut reader, COMMAND_LINE_MAX)) => match read {
                    Err(_) => {
                        send_reply(&mut writer, 421, "4.4.2 Idle timeout, closing connection").await?;
                        break;
                    }
                    Ok(line) => line?,
                },
            };

            let line = match line {
                Line::Eof => break,
                Line::TooLong => {
                    send_reply(&mut writer, 500, "5.5.2 Line too long").await?;
                    continue;
                }
                Line::Complete(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            };

            debug!(%remote_ip, command = %line, "SMTP command");

            match parse_command(&line) {
                Command::Helo(name) => {
                    envelope.helo = Some(name.clone());
                    envelope.reset();
                    greeted = true;
                    state = SessionState::Connected;
                    send_reply(
                        &mut writer,
                        250,
                        &format!("{} Hello {}", config.hostname, name),
                    )
                    .await?;
                }

                Command::Ehlo(name) => {
                    envelope.helo = Some(name.clone());
                    envelope.reset();
                    greeted = true;
                    state = SessionState::Connected;
                    let lines = [
                        format!("{} Hello {}", config.hostname, name),
                        format!("SIZE {}", config.max_message_size),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];
                    send_reply_lines(&mut writer, 250, &lines).await?;
                }

                Command::Mail { sender, size } => {
                    if !greeted || !state.accepts_mail() {
                        send_reply(&mut writer, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    if matches!(size, Some(declared) if declared > config.max_message_size) {
                        send_reply(
                            &mut writer,
                            552,
                            &format!(
                                "5.3.4 Message exceeds maximum size of {} bytes",
                                config.max_message_size
                            ),
                        )
                        .await?;
                        continue;
                    }

                    envelope.sender = sender;
                    match coordinator.check_sender(&envelope).await {
                        Ok(()) => {
                            state = SessionState::SenderDeclared;
                            send_reply(&mut writer, 250, "2.1.0 OK").await?;
                        }
                        Err(e) => {
                            envelope.sender = None;
                            if reject(&mut writer, &config, &e).await? {
                                state = SessionState::Closed;
                            }
                        }
                    }
                }

                Command::Rcpt(address) => {
                    if !state.accepts_rcpt() {
                        send_reply(&mut writer, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    if envelope.recipients.len() >= config.max_recipients {
                        send_reply(&mut writer, 452, "4.5.3 Too many recipients").await?;
                        continue;
                    }

                    match coordinator.check_recipient(&address) {
                        Ok(()) => {
                            envelope.recipients.push(address);
                            state = SessionState::RecipientsAccepted;
                            send_reply(&mut writer, 250, "2.1.5 OK").await?;
                        }
                        Err(e) => {
                            if reject(&mut writer, &config, &e).await? {
                                state = SessionState::Closed;
                            }
                        }
                    }
                }

                Command::Data => {
                    if !state.accepts_data() || envelope.recipients.is_empty() {
                        send_reply(&mut writer, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }

                    receive_message(
                        &mut reader,
                        &mut writer,
                        &coordinator,
                        &envelope,
                        &mut state,
                        idle,
                    )
                    .await?;

                    // Ready for the next message on this connection
                    envelope.reset();
                }

                Command::Rset => {
                    envelope.reset();
                    state = SessionState::Connected;
                    send_reply(&mut writer, 250, "2.0.0 OK").await?;
                }

                Command::Noop => {
                    send_reply(&mut writer, 250, "2.0.0 OK").await?;
                }

                Command::Quit => {
                    send_reply(&mut writer, 221, "2.0.0 Bye").await?;
                    state = SessionState::Closed;
                }

                Command::Vrfy => {
                    send_reply(&mut writer, 252, "2.5.2 Cannot VRFY user").await?;
                }

                Command::Auth => {
                    send_reply(&mut writer, 502, "5.5.1 Authentication not supported").await?;
                }

                Command::MailSyntax => {
                    send_reply(&mut writer, 501, "5.1.7 Bad sender address syntax").await?;
                }

                Command::RcptSyntax => {
                    send_reply(&mut writer, 501, "5.1.3 Bad recipient address syntax").await?;
                }

                Command::Unknown => {
                    send_reply(&mut writer, 500, "5.5.2 Command not recognized").await?;
                }
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| Error::Smtp(format!("flush failed: {}", e)))?;
        Ok(())
    }
}

/// Receive the DATA phase into the spool and hand the finished artifact
/// to the coordinator. Command-level failures (size, policy, queue) are
/// answered on the wire and leave the session usable; only transport
/// errors propagate.
async fn receive_message<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut BufWriter<W>,
    coordinator: &IngestCoordinator,
    envelope: &Envelope,
    state: &mut SessionState,
    idle: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    *state = SessionState::Receiving;
    let mut spool = match coordinator.begin_message().await {
        Ok(writer) => Some(writer),
        Err(e) => {
            let (code, text) = e.smtp_reply();
            send_reply(writer, code, &text).await?;
            *state = SessionState::Connected;
            return Ok(());
        }
    };

    send_reply(writer, 354, "Start mail input; end with <CRLF>.<CRLF>").await?;

    let mut failure: Option<Error> = None;
    loop {
        let line = timeout(idle, read_line_capped(reader, DATA_LINE_MAX))
            .await
            .map_err(|_| Error::Smtp("idle timeout during DATA".to_string()))??;

        let bytes = match line {
            Line::Eof => return Err(Error::Smtp("connection closed during DATA".to_string())),
            Line::TooLong => {
                if failure.is_none() {
                    if let Some(w) = spool.take() {
                        w.abort().await;
                    }
                    failure = Some(Error::Smtp("Data line too long".to_string()));
                }
                continue;
            }
            Line::Complete(bytes) => bytes,
        };

        if bytes == b"." {
            break;
        }

        // Dot-unstuffing: a leading dot was doubled by the sender
        let unstuffed = if bytes.first() == Some(&b'.') {
            &bytes[1..]
        } else {
            &bytes[..]
        };

        if let Some(w) = spool.as_mut() {
            let wrote = match w.write(unstuffed).await {
                Ok(()) => w.write(b"\r\n").await,
                Err(e) => Err(e),
            };
            if let Err(e) = wrote {
                // The writer already deleted its partial file; keep
                // consuming input until the terminating dot
                spool = None;
                failure = Some(e);
            }
        }
    }

    // The data phase is over; whatever happens next answers one command
    *state = SessionState::Connected;

    if let Some(e) = failure {
        let (code, text) = e.smtp_reply();
        send_reply(writer, code, &text).await?;
        return Ok(());
    }

    let Some(spool) = spool.take() else {
        return Ok(());
    };
    let entry = match spool.finish().await {
        Ok(entry) => entry,
        Err(e) => {
            let (code, text) = e.smtp_reply();
            send_reply(writer, code, &text).await?;
            return Ok(());
        }
    };

    let short_hash = entry.sha256[..12].to_string();
    match coordinator.finish_message(envelope, entry).await {
        Ok(_) => {
            // A duplicate is an acceptance too; the message is already queued
            send_reply(
                writer,
                250,
                &format!("2.0.0 OK: message queued as {}", short_hash),
            )
            .await?;
        }
        Err(e) => {
            let (code, text) = e.smtp_reply();
            send_reply(writer, code, &text).await?;
        }
    }
    Ok(())
}

/// Answer a gatekeeper rejection. Returns whether the session should be
/// closed afterwards.
async fn reject<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    config: &SmtpConfig,
    error: &Error,
) -> Result<bool> {
    let (code, text) = error.smtp_reply();
    send_reply(writer, code, &text).await?;
    Ok(config.close_on_rejection && matches!(error, Error::PolicyRejected(_)))
}

async fn send_reply<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    code: u16,
    text: &str,
) -> Result<()> {
    let reply = format!("{} {}\r\n", code, text);
    writer
        .write_all(reply.as_bytes())
        .await
        .map_err(|e| Error::Smtp(format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Smtp(format!("flush failed: {}", e)))?;
    Ok(())
}

async fn send_reply_lines<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    code: u16,
    lines: &[String],
) -> Result<()> {
    let mut reply = String::new();
    for (i, line) in lines.iter().enumerate() {
        let sep = if i + 1 == lines.len() { ' ' } else { '-' };
        reply.push_str(&format!("{}{}{}\r\n", code, sep, line));
    }
    writer
        .write_all(reply.as_bytes())
        .await
        .map_err(|e| Error::Smtp(format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Smtp(format!("flush failed: {}", e)))?;
    Ok(())
}

enum Line {
    Complete(Vec<u8>),
    TooLong,
    Eof,
}

/// Read one CRLF-terminated line with a byte cap. An over-long line is
/// drained to its newline and reported as `TooLong`, so one abusive line
/// cannot grow the session's memory.
async fn read_line_capped<R: AsyncBufRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Line> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let remaining = (max_len + 2).saturating_sub(buf.len());
        if remaining == 0 {
            drain_to_newline(reader).await?;
            return Ok(Line::TooLong);
        }

        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| Error::Smtp(format!("read failed: {}", e)))?;

        if n == 0 {
            return Ok(if buf.is_empty() {
                Line::Eof
            } else {
                Line::Complete(buf)
            });
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok(Line::Complete(buf));
        }
    }
}

async fn drain_to_newline<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut scratch: Vec<u8> = Vec::new();
    loop {
        scratch.clear();
        let n = (&mut *reader)
            .take(4096)
            .read_until(b'\n', &mut scratch)
            .await
            .map_err(|e| Error::Smtp(format!("read failed: {}", e)))?;
        if n == 0 || scratch.last() == Some(&b'\n') {
            return Ok(());
        }
    }
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let (verb, args) = match line.split_once(' ') {
        Some((verb, args)) => (verb, args),
        None => (line, ""),
    };

    match verb.to_ascii_uppercase().as_str() {
        "HELO" => Command::Helo(args.trim().to_string()),
        "EHLO" => Command::Ehlo(args.trim().to_string()),
        "MAIL" => parse_mail_args(args),
        "RCPT" => parse_rcpt_args(args),
        "DATA" => Command::Data,
        "RSET" => Command::Rset,
        "NOOP" => Command::Noop,
        "QUIT" => Command::Quit,
        "VRFY" => Command::Vrfy,
        "AUTH" => Command::Auth,
        _ => Command::Unknown,
    }
}

/// Parse `FROM:<address> [SIZE=n ...]`
fn parse_mail_args(args: &str) -> Command {
    let args = args.trim();
    let Some(rest) = strip_prefix_ignore_case(args, "FROM:") else {
        return Command::MailSyntax;
    };
    let rest = rest.trim_start();

    let (addr_part, params) = match split_angle_addr(rest) {
        Some(parts) => parts,
        None => return Command::MailSyntax,
    };

    let sender = if addr_part.is_empty() {
        None
    } else {
        match EmailAddress::parse(addr_part) {
            Some(addr) => Some(addr),
            None => return Command::MailSyntax,
        }
    };

    let mut size = None;
    for param in params.split_whitespace() {
        if let Some(value) = strip_prefix_ignore_case(param, "SIZE=") {
            match value.parse::<u64>() {
                Ok(v) => size = Some(v),
                Err(_) => return Command::MailSyntax,
            }
        }
        // Other ESMTP params (BODY=8BITMIME etc.) are accepted and ignored
    }

    Command::Mail { sender, size }
}

/// Parse `TO:<address>`
fn parse_rcpt_args(args: &str) -> Command {
    let args = args.trim();
    let Some(rest) = strip_prefix_ignore_case(args, "TO:") else {
        return Command::RcptSyntax;
    };
    let rest = rest.trim_start();

    let (addr_part, _) = match split_angle_addr(rest) {
        Some(parts) => parts,
        None => return Command::RcptSyntax,
    };

    match EmailAddress::parse(addr_part) {
        Some(addr) => Command::Rcpt(addr),
        None => Command::RcptSyntax,
    }
}

/// Split `<address> rest...` into the address and trailing parameters;
/// also tolerates a bare address without angle brackets
fn split_angle_addr(s: &str) -> Option<(&str, &str)> {
    if let Some(stripped) = s.strip_prefix('<') {
        let end = stripped.find('>')?;
        Some((&stripped[..end], &stripped[end + 1..]))
    } else if s.is_empty() {
        None
    } else {
        match s.split_once(' ') {
            Some((addr, rest)) => Some((addr, rest)),
            None => Some((s, "")),
        }
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
