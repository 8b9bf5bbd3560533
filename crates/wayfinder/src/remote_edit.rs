//! Remote viewing and editing over MPI.
//!
//! A `V` block pages its payload; an `E` block opens the framed body in an
//! editor and replies upstream with the edited text, or cancels the session
//! when the file was left untouched. Each block runs on its own short-lived
//! thread so a subprocess never stalls the session; the threads are joined
//! at shutdown.

use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::SystemTime;

use anyhow::{bail, Context};
use tracing::warn;
use wayfinder_protocol::telnet::escape_iac;
use wayfinder_protocol::{MpiMessage, OutputFormat, MPI_INIT};

use crate::mapper::WriteMessage;

static WORKERS: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

/// Runs one MPI block on its own worker thread.
pub fn spawn(
    message: MpiMessage,
    format: OutputFormat,
    game_tx: flume::Sender<WriteMessage>,
    player_tx: flume::Sender<WriteMessage>,
) {
    let handle = std::thread::spawn(move || {
        if let Err(error) = handle_message(&message, format, &game_tx, &player_tx) {
            warn!(%error, command = message.command, "remote editing failed");
        }
    });
    WORKERS.lock().expect("worker registry").push(handle);
}

/// Waits for every outstanding editor and pager to finish.
pub fn join_workers() {
    let handles = std::mem::take(&mut *WORKERS.lock().expect("worker registry"));
    for handle in handles {
        let _ = handle.join();
    }
}

fn handle_message(
    message: &MpiMessage,
    format: OutputFormat,
    game_tx: &flume::Sender<WriteMessage>,
    player_tx: &flume::Sender<WriteMessage>,
) -> anyhow::Result<()> {
    match message.command {
        b'V' => view(&message.payload, format, player_tx),
        b'E' => edit(&message.payload, format, game_tx, player_tx),
        other => bail!("unsupported MPI command {other:#x}"),
    }
}

fn view(
    payload: &[u8],
    format: OutputFormat,
    player_tx: &flume::Sender<WriteMessage>,
) -> anyhow::Result<()> {
    let file = scratch_file("wayfinder_viewing_", payload)?;
    if format == OutputFormat::Tintin {
        // The client drives the pager; leave the file in place for it.
        let path = file.into_temp_path().keep().context("keeping view file")?;
        announce_command(player_tx, &pager(), &path);
        return Ok(());
    }
    run_tool(&pager(), file.path())?;
    Ok(())
}

fn edit(
    payload: &[u8],
    format: OutputFormat,
    game_tx: &flume::Sender<WriteMessage>,
    player_tx: &flume::Sender<WriteMessage>,
) -> anyhow::Result<()> {
    let mut parts = payload.splitn(3, |&byte| byte == b'\n');
    let session = parts.next().context("missing session")?.to_vec();
    let _description = parts.next().context("missing description")?;
    let body = parts.next().unwrap_or_default();

    let file = scratch_file("wayfinder_editing_", body)?;
    let before = modified_time(file.path())?;
    if format == OutputFormat::Tintin {
        announce_command(player_tx, &editor(), file.path());
        // The client signals completion over stdin, like a pager prompt.
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    } else {
        run_tool(&editor(), file.path())?;
    }
    let after = modified_time(file.path())?;

    let mut response = if before == after {
        // Closed without saving: cancel the editing session.
        let mut response = b"C".to_vec();
        response.extend_from_slice(&session);
        response
    } else {
        let mut response = b"E".to_vec();
        response.extend_from_slice(&session);
        response.push(b'\n');
        response.extend_from_slice(&std::fs::read(file.path())?);
        response
    };
    response.retain(|&byte| byte != b'\r');
    let mut response = escape_iac(&response).trim_ascii().to_vec();
    response.push(b'\n');

    let mut framed = MPI_INIT.to_vec();
    framed.push(b'E');
    framed.extend_from_slice(response.len().to_string().as_bytes());
    framed.push(b'\n');
    framed.extend_from_slice(&response);
    let _ = game_tx.send(WriteMessage::Raw(framed));
    Ok(())
}

fn scratch_file(prefix: &str, contents: &[u8]) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".txt")
        .tempfile()
        .context("creating scratch file")?;
    let mut cleaned = contents.to_vec();
    cleaned.retain(|&byte| byte != b'\r');
    file.write_all(&cleaned)?;
    file.flush()?;
    Ok(file)
}

fn run_tool(command_line: &str, path: &Path) -> anyhow::Result<()> {
    let mut words = command_line.split_whitespace();
    let program = words.next().context("empty tool command")?;
    let status = Command::new(program)
        .args(words)
        .arg(path)
        .status()
        .with_context(|| format!("running '{command_line}'"))?;
    if !status.success() {
        warn!(%command_line, %status, "tool exited unsuccessfully");
    }
    Ok(())
}

fn announce_command(player_tx: &flume::Sender<WriteMessage>, tool: &str, path: &Path) {
    let _ = player_tx.send(WriteMessage::Data {
        bytes: format!("MPICOMMAND:{tool} {}:MPICOMMAND\n", path.display()).into_bytes(),
        prompt: false,
    });
}

fn editor() -> String {
    std::env::var("WAYFINDER_EDITOR")
        .or_else(|_| std::env::var("TINTINEDITOR"))
        .unwrap_or_else(|_| default_editor().to_owned())
}

fn pager() -> String {
    std::env::var("WAYFINDER_PAGER")
        .or_else(|_| std::env::var("TINTINPAGER"))
        .unwrap_or_else(|_| default_pager().to_owned())
}

fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "nano -w"
    }
}

fn default_pager() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "less"
    }
}

fn modified_time(path: &Path) -> anyhow::Result<SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uses `true` as the editor so no interactive program runs; the file
    /// is untouched, so the edit session must be canceled.
    #[test]
    fn untouched_edit_session_is_canceled() {
        let (game_tx, game_rx) = flume::unbounded();
        let (player_tx, _player_rx) = flume::unbounded();
        std::env::set_var("WAYFINDER_EDITOR", "true");
        let payload = b"M12345\nA description\nSome body text\n".to_vec();
        edit(&payload, OutputFormat::Normal, &game_tx, &player_tx).unwrap();
        let reply = game_rx.recv().unwrap();
        let WriteMessage::Raw(bytes) = reply else {
            panic!("edit replies are raw wire bytes");
        };
        // The length field counts the reply body including its newline.
        assert_eq!(&bytes[..], b"~$#EE8\nCM12345\n");
    }

    #[test]
    fn reply_length_counts_the_body_exactly() {
        let body = b"CM9\n";
        let mut framed = MPI_INIT.to_vec();
        framed.push(b'E');
        framed.extend_from_slice(body.len().to_string().as_bytes());
        framed.push(b'\n');
        framed.extend_from_slice(body);
        assert_eq!(&framed[..], b"~$#EE4\nCM9\n");
    }
}
