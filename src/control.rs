use crate::dispatcher::DryRun;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Operator commands forwarded from the chat bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    SetDryRun(bool),
}

impl ControlCommand {
    /// `!status` or `!dryrun 0|1`. Anything else is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let command = match (words.next()?, words.next()) {
            ("!status", None) => Self::Status,
            ("!dryrun", Some("0")) => Self::SetDryRun(false),
            ("!dryrun", Some("1")) => Self::SetDryRun(true),
            _ => return None,
        };
        if words.next().is_some() {
            return None;
        }
        Some(command)
    }
}

pub fn handle(command: ControlCommand, dry_run: &DryRun) -> String {
    match command {
        ControlCommand::Status => format!("is_dry_run={}", dry_run.is_enabled()),
        ControlCommand::SetDryRun(enabled) => {
            let previous = dry_run.set(enabled);
            log::info!("Dry run changed from {previous} to {enabled} by operator");
            format!("Set is_dry_run={enabled}")
        }
    }
}

/// Accept operator connections on a Unix socket until the task is dropped.
/// Each line is one command; each command gets one reply line.
pub async fn serve(socket_path: &str, dry_run: DryRun) -> anyhow::Result<()> {
    log::info!("Starting control socket on: {}", socket_path);
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;

    loop {
        let (stream, _) = listener.accept().await?;
        let dry_run = dry_run.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, dry_run).await {
                log::warn!("Control connection failed: {e}");
            }
        });
    }
}

async fn serve_connection(stream: UnixStream, dry_run: DryRun) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = match ControlCommand::parse(&line) {
            Some(command) => handle(command, &dry_run),
            None => {
                log::debug!("Ignoring control input: {line}");
                continue;
            }
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ControlCommand::parse("!status"), Some(ControlCommand::Status));
        assert_eq!(
            ControlCommand::parse("  !dryrun 1 "),
            Some(ControlCommand::SetDryRun(true))
        );
        assert_eq!(
            ControlCommand::parse("!dryrun 0"),
            Some(ControlCommand::SetDryRun(false))
        );
        assert_eq!(ControlCommand::parse("!dryrun"), None);
        assert_eq!(ControlCommand::parse("!dryrun yes"), None);
        assert_eq!(ControlCommand::parse("!status now"), None);
        assert_eq!(ControlCommand::parse("hello"), None);
        assert_eq!(ControlCommand::parse(""), None);
    }

    #[test]
    fn test_handle_toggles_shared_flag() {
        let dry_run = DryRun::new(false);
        let shared = dry_run.clone();

        assert_eq!(handle(ControlCommand::Status, &dry_run), "is_dry_run=false");
        assert_eq!(
            handle(ControlCommand::SetDryRun(true), &dry_run),
            "Set is_dry_run=true"
        );
        assert!(shared.is_enabled());
    }

    #[tokio::test]
    async fn test_serves_commands_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let path = path.to_string_lossy().to_string();
        let dry_run = DryRun::new(false);

        let server = tokio::spawn({
            let path = path.clone();
            let dry_run = dry_run.clone();
            async move { serve(&path, dry_run).await }
        });

        let mut stream = None;
        for _ in 0..100 {
            if let Ok(connected) = UnixStream::connect(&path).await {
                stream = Some(connected);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let (reader, mut writer) = stream.expect("control socket never came up").into_split();
        let mut replies = BufReader::new(reader).lines();

        writer.write_all(b"!dryrun 1\nnonsense\n!status\n").await.unwrap();
        assert_eq!(replies.next_line().await.unwrap().unwrap(), "Set is_dry_run=true");
        assert_eq!(replies.next_line().await.unwrap().unwrap(), "is_dry_run=true");
        assert!(dry_run.is_enabled());

        server.abort();
    }
}
