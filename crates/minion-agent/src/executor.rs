use chrono::Utc;
use minion_core::protocol::{encode_frame, ACTION_UPDATE_COMMAND};
use minion_core::{Command, CommandOutput, OutputStream};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

/// Run one command to completion, streaming a full-snapshot `update_command`
/// frame to the outbound writer for every captured line.
///
/// This task is the sole writer to the Command record: both capture tasks
/// funnel their records through one channel, so a serialized snapshot can
/// never observe a half-appended state.
pub(crate) async fn execute(mut command: Command, outbound: mpsc::Sender<String>) {
    command.started_at = Utc::now().timestamp();

    let argv: Vec<String> = command.argv().into_iter().map(str::to_string).collect();
    if argv.is_empty() {
        warn!(id = %command.id, "empty command line, nothing to execute");
        return finish(command, &outbound).await;
    }

    let mut child = match tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(id = %command.id, command = %command.command, "spawn_failed: {err}");
            return finish(command, &outbound).await;
        }
    };

    let (record_tx, mut record_rx) = mpsc::channel::<(OutputStream, CommandOutput)>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(capture_lines(stdout, OutputStream::Stdout, record_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(capture_lines(stderr, OutputStream::Stderr, record_tx.clone()));
    }
    drop(record_tx);

    // Drains until both capture tasks hit end-of-stream.
    while let Some((stream, record)) = record_rx.recv().await {
        command.append_output(stream, record);
        command.action = ACTION_UPDATE_COMMAND.to_string();
        send_update(&command, &outbound).await;
    }

    if let Err(err) = child.wait().await {
        warn!(id = %command.id, "wait_failed: {err}");
    }
    finish(command, &outbound).await;
}

/// Read one subprocess stream line by line, stamping each line as it arrives.
async fn capture_lines<R>(
    reader: R,
    stream: OutputStream,
    records: mpsc::Sender<(OutputStream, CommandOutput)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let record = CommandOutput {
            output: line,
            at: Utc::now().timestamp(),
        };
        if records.send((stream, record)).await.is_err() {
            break;
        }
    }
}

async fn finish(mut command: Command, outbound: &mpsc::Sender<String>) {
    command.completed_at = Utc::now().timestamp();
    command.action = ACTION_UPDATE_COMMAND.to_string();
    send_update(&command, outbound).await;
}

async fn send_update(command: &Command, outbound: &mpsc::Sender<String>) {
    match encode_frame(command) {
        Ok(payload) => {
            // The session may already be gone; nothing to do about it here.
            let _ = outbound.send(payload).await;
        }
        Err(err) => warn!(id = %command.id, "encode_failed: {err}"),
    }
}
