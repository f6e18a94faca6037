use crate::fix::mem::MsgBuf;
use crate::fix::SessionError;
use crate::SessionSettings;

use chrono::offset::Utc;
use chrono::{DateTime, Duration};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use std::time::Instant;

use anyhow::Result;

const FIX_MESSAGE_LOG_SUFFIX: &str = "fixMessages.log";
const SESSION_LOG_SUFFIX: &str = "session.log";
const TIME_FORMAT: &str = "%Y%m%d-%H:%M:%S%.3f";

enum LoggerRequest {
    Message(String, Instant),
    Session(String, Instant),
    Disconnect(oneshot::Sender<Result<(), SessionError>>),
}

pub(super) struct FileLogger {
    sender: mpsc::UnboundedSender<LoggerRequest>,
}

pub(super) trait Logger {
    fn log_message(&mut self, msg: &MsgBuf) -> Result<(), SessionError>;
    fn log_session_event(&mut self, text: &str) -> Result<(), SessionError>;
}

impl Logger for FileLogger {
    fn log_message(&mut self, buf: &MsgBuf) -> Result<(), SessionError> {
        let req = LoggerRequest::Message(format!("{:?}", buf), Instant::now());
        self.sender.send(req).map_err(to_io_err)?;
        Ok(())
    }

    fn log_session_event(&mut self, text: &str) -> Result<(), SessionError> {
        let req = LoggerRequest::Session(text.to_string(), Instant::now());
        self.sender.send(req).map_err(to_io_err)?;
        Ok(())
    }
}

impl FileLogger {
    pub(super) async fn build(settings: &SessionSettings) -> Result<FileLogger> {
        let log_path = &settings.log_dir;
        let sendercompid = settings.expected_sender_comp_id();
        std::fs::create_dir_all(log_path)?;

        let mut fix_messages_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path.join(format!("{}-{}", sendercompid, FIX_MESSAGE_LOG_SUFFIX)))
            .await?;

        let mut session_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path.join(format!("{}-{}", sendercompid, SESSION_LOG_SUFFIX)))
            .await?;

        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let begin_time = Utc::now();
            let begin_instant = Instant::now();
            while let Some(req) = receiver.recv().await {
                match req {
                    LoggerRequest::Message(msg, instant) => {
                        let send_time = to_send_time(begin_time, begin_instant, instant);
                        if let Err(e) = write_line(&mut fix_messages_log, &msg, send_time).await {
                            tracing::error!(error = %e, "failed to write fix message log");
                        }
                    }
                    LoggerRequest::Session(msg, instant) => {
                        let send_time = to_send_time(begin_time, begin_instant, instant);
                        if let Err(e) = write_line(&mut session_log, &msg, send_time).await {
                            tracing::error!(error = %e, "failed to write session log");
                        }
                    }
                    LoggerRequest::Disconnect(sender) => {
                        let resp = disconnect(&mut fix_messages_log, &mut session_log).await;
                        let _ = sender.send(resp);
                    }
                }
            }
        });

        Ok(FileLogger { sender })
    }

    pub(super) async fn disconnect(&mut self) -> Result<(), SessionError> {
        let (sender, receiver) = oneshot::channel();
        let req = LoggerRequest::Disconnect(sender);
        self.sender.send(req).map_err(to_io_err)?;
        receiver.await.map_err(to_io_err)?
    }
}

fn to_send_time(
    begin_time: DateTime<Utc>,
    begin_instant: Instant,
    instant: Instant,
) -> DateTime<Utc> {
    match Duration::from_std(instant.duration_since(begin_instant)) {
        Ok(d) => begin_time + d,
        Err(_) => Utc::now(),
    }
}

async fn write_line(file: &mut File, line: &str, time: DateTime<Utc>) -> Result<(), SessionError> {
    file.write_all(format!("{} : {}\n", message_stamp(time), line).as_bytes())
        .await?;
    file.flush().await?;
    Ok(())
}

async fn disconnect(fix_messages_log: &mut File, session_log: &mut File) -> Result<(), SessionError> {
    fix_messages_log.flush().await?;
    session_log.flush().await?;
    Ok(())
}

fn message_stamp(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn to_io_err<E>(e: E) -> std::io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    std::io::Error::new(std::io::ErrorKind::Other, e)
}
