//! Per-connection handler.
//!
//! Each accepted connection gets two tasks: the read loop below, which
//! parses slash commands and turns plain lines into broadcasts, and a
//! writer task that drains the participant's outbound queue onto the
//! transport. The handler is generic over the stream so tests can drive
//! it with in-memory duplex pipes; the server passes TLS streams.
//!
//! Wire protocol: the client's first line is its requested display name
//! (the registry may rewrite it); every later line is either a `/command`
//! or a chat message. Lines are UTF-8, `\r\n` or `\n` terminated.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::participant::{OUTBOUND_QUEUE, Participant};
use crate::registry::Registry;

/// Cap on a single inbound line; longer input is dropped.
const MAX_LINE_LEN: usize = 8192;

/// Drive one authenticated connection to completion.
pub async fn handle_io<S>(
    stream: S,
    fingerprint: String,
    registry: Arc<Registry>,
    motd: Option<String>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    // First line is the requested display name.
    let mut name_line = String::new();
    if reader.read_line(&mut name_line).await? == 0 {
        return Ok(()); // closed before introducing itself
    }
    if name_line.len() > MAX_LINE_LEN {
        return Ok(());
    }
    let requested = name_line.trim().to_string();

    let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let participant = Arc::new(Participant::new(requested, fingerprint, tx));

    // The writer must not hold a participant handle: it exits when every
    // queue sender is gone, and the participant owns one.
    let session = participant.fingerprint().to_string();
    tokio::spawn(write_loop(writer, rx, session));

    if let Some(ref motd) = motd {
        for line in motd.lines() {
            participant.send(format!("-> {line}"));
        }
    }

    registry.add(Arc::clone(&participant));

    let result = read_loop(&mut reader, &participant, &registry).await;

    registry.remove(&participant);
    result
}

/// Drain the outbound queue onto the transport, batching queued lines
/// between flushes. Ends when the queue closes or a write fails.
async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<String>, session: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        if write_line(&mut writer, &line).await.is_err() {
            tracing::warn!(%session, "Write error, stopping writer");
            return;
        }
        // Drain queued lines and batch-write them before flushing.
        let mut batched = 0;
        while let Ok(queued) = rx.try_recv() {
            if write_line(&mut writer, &queued).await.is_err() {
                return;
            }
            batched += 1;
            if batched >= 64 {
                break;
            }
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(%session, "Flush error: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await
}

async fn read_loop<R>(
    reader: &mut BufReader<R>,
    participant: &Arc<Participant>,
    registry: &Arc<Registry>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        if participant.is_unhealthy() {
            tracing::info!(name = %participant.name(), "Outbound queue stalled, disconnecting");
            return Ok(());
        }

        line.clear();
        let n = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = participant.closed() => return Ok(()),
        };
        if n == 0 {
            return Ok(()); // EOF
        }
        if line.len() > MAX_LINE_LEN {
            participant.send("-> Line too long, dropped.");
            continue;
        }

        let input = line.trim_end_matches(['\r', '\n']);
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            if dispatch(command, participant, registry) == Flow::Quit {
                return Ok(());
            }
        } else {
            registry.broadcast(
                &format!("{}: {input}", participant.name()),
                Some(participant),
            );
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Map one slash command onto the registry's public contract. Operator
/// commands are refused privately for non-operators.
fn dispatch(command: &str, participant: &Arc<Participant>, registry: &Arc<Registry>) -> Flow {
    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or("");
    match verb {
        "help" => {
            participant.send(
                "-> Commands: /nick <name>, /names [prefix], /whois <name>, \
                 /op <name>, /ban <name> [duration], /unban <fingerprint>, /quit",
            );
        }
        "nick" => match parts.next() {
            Some(name) => registry.rename(participant, name),
            None => participant.send("-> Usage: /nick <name>"),
        },
        "names" => {
            let mut names = registry.list(parts.next());
            names.sort();
            participant.send(format!("-> Connected: {}", names.join(", ")));
        }
        "whois" => match parts.next().and_then(|name| registry.who(name)) {
            Some(target) => {
                participant.send(format!("-> {} is {}", target.name(), target.fingerprint()));
            }
            None => participant.send("-> No such name."),
        },
        "op" => {
            if !registry.is_op(participant) {
                participant.send("-> You are not an operator.");
                return Flow::Continue;
            }
            match parts.next().and_then(|name| registry.who(name)) {
                Some(target) => {
                    registry.op(target.fingerprint());
                    target.send("-> You are now an operator.");
                    participant.send(format!("-> Opped {}.", target.name()));
                }
                None => participant.send("-> No such name."),
            }
        }
        "ban" => {
            if !registry.is_op(participant) {
                participant.send("-> You are not an operator.");
                return Flow::Continue;
            }
            let Some(name) = parts.next() else {
                let banned = registry.banned();
                if banned.is_empty() {
                    participant.send("-> No active bans.");
                } else {
                    for fingerprint in banned {
                        participant.send(format!("-> banned: {fingerprint}"));
                    }
                }
                return Flow::Continue;
            };
            let duration = match parts.next() {
                None => None,
                Some(arg) => match parse_duration(arg) {
                    Some(d) => Some(d),
                    None => {
                        participant.send("-> Bad duration. Use seconds or <n>{s,m,h,d}.");
                        return Flow::Continue;
                    }
                },
            };
            match registry.who(name) {
                Some(target) => {
                    registry.ban(target.fingerprint(), duration);
                    registry.broadcast(
                        &format!("* {} was banned by {}.", target.name(), participant.name()),
                        None,
                    );
                    target.close();
                }
                None => participant.send("-> No such name."),
            }
        }
        "unban" => {
            if !registry.is_op(participant) {
                participant.send("-> You are not an operator.");
                return Flow::Continue;
            }
            match parts.next() {
                Some(fingerprint) => {
                    registry.unban(fingerprint);
                    participant.send("-> Unbanned.");
                }
                None => participant.send("-> Usage: /unban <fingerprint>"),
            }
        }
        "quit" => {
            participant.send("-> Goodbye.");
            return Flow::Quit;
        }
        _ => participant.send(format!("-> Unknown command: /{verb}")),
    }
    Flow::Continue
}

/// Parse a ban duration: bare seconds or a number with an s/m/h/d suffix.
fn parse_duration(arg: &str) -> Option<Duration> {
    if !arg.is_ascii() {
        return None;
    }
    if let Ok(secs) = arg.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (number, unit) = arg.split_at(arg.len().checked_sub(1)?);
    let value: u64 = number.parse().ok()?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}
