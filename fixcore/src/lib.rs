//! An opinionated FIX 4.4 client-side session engine for the buy-side.
//!
//! `fixcore` owns the session layer of the FIX protocol: framing, the logon/heartbeat/resend
//! state machine, and sequence-number bookkeeping, so that callers can focus on building and
//! consuming business messages rather than the wire protocol underneath them.
//!
//! ## Terminology
//! * `FIX Connection` -- A single connection to a FIX Session. A network connection is made over TCP,
//! then a FIX logon handshake is performed to establish the FIX connection. The FIX connection
//! ends properly with a FIX logout, but is considered ended if the TCP connection breaks.
//!     * Note, the term 'connection' is overloaded and can also mean TCP connection. When unclear, a
//! 'connection' will be specified as TCP or FIX.
//!
//! * `FIX Session` -- A conceptual construct that represents the bidirectional stream of ordered
//! messages between two peers. A FIX Session can live across multiple instances of a FIX
//! connection.
//!
//! * `FIX Engine` -- A sub-process running in the background that manages a single FIX connection
//! to a FIX Session. The engine starts, runs, and ends the FIX connection as defined by the FIX
//! protocol, and manages all resources that support the connection.
//!
//! ## Examples
//!
//! ### Asynchronous API
//! ```no_run
//! use fixcore::{
//!     SessionSettings, FixApplicationHandle, FixApplicationInitiator, ApplicationError,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ApplicationError> {
//!     
//!     // build session settings
//!     let settings = SessionSettings::builder()
//!         .with_sender_comp_id("my_id")
//!         .with_target_comp_id("peer_id")
//!         .with_store_path("./store".into())
//!         .with_log_dir("./log".into())
//!         .with_socket_addr("127.0.0.1:0".parse().unwrap())
//!         .build()?;
//!
//!     // create a FIX engine and intiate TCP connection
//!     let (fix_handle, mut event_receiver) = FixApplicationInitiator::build(settings)?
//!         .initiate()
//!         .await?;
//!
//!     // handle incoming messages in the background...
//!     tokio::spawn(async move {
//!         while let Some(msg) = event_receiver.recv().await {
//!             println!("got an application message: {}", msg);
//!         }
//!     });
//!
//!     // start the FIX connection
//!     fix_handle.start_async().await?;
//!
//!     // send messages here...
//!
//!     // end the FIX connection
//!     fix_handle.end_async().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Synchronous API*
//! ```no_run
//! use fixcore::{
//!     SessionSettings, FixApplicationHandle, FixApplicationInitiator, ApplicationError,
//! };
//!
//! fn main() -> Result<(), ApplicationError> {
//!
//!     let settings = SessionSettings::builder()
//!         .with_sender_comp_id("my_id")
//!         .with_target_comp_id("peer_id")
//!         .with_store_path("./store".into())
//!         .with_log_dir("./log".into())
//!         .with_socket_addr("127.0.0.1:0".parse().unwrap())
//!         .build()?;
//!
//!     let (fix_handle, mut event_receiver) = FixApplicationInitiator::build(settings)?
//!         .initiate_sync()?;
//!
//!     std::thread::spawn(move || {
//!         while let Some(msg) = event_receiver.blocking_recv() {
//!             println!("got an application message: {}", msg);
//!         }
//!     });
//!
//!     fix_handle.start_sync()?;
//!
//!     // send messages here...
//!
//!     fix_handle.end_sync()?;
//!     
//!     Ok(())
//! }
//! ```
//! *When using synchronous API, a tokio runtime is still created internally (see
//! [`FixApplicationInitiator`])

pub mod config;
pub mod fix;
use fix::encode::MessageBuilder;
use fix::mem::MsgBuf;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};

use chrono::naive::NaiveTime;

enum Request {
    Logon {
        resp_sender: oneshot::Sender<bool>,
    },
    SendMessage {
        resp_sender: oneshot::Sender<bool>,
        builder: MessageBuilder,
    },
    Logout {
        resp_sender: oneshot::Sender<bool>,
    },
}

/// Errors that can occur while running a FIX session.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("An I/O error occured: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Session ended unexpectedly")]
    SessionEnded,
    #[error("Logon has failed")]
    LogonFailed,
    #[error("Logout has failed")]
    LogoutFailed,
    #[error("MessageSend has failed")]
    SendMessageFailed,
    #[error("setting `{0}` is required")]
    SettingRequired(String),
    #[error("failed to read config file: {0}")]
    ConfigError(String),
}

/// A collection of settings used to configurate a FIX session.
///
/// `SessionSettings` can be constructed using the [`SessionSettingsBuilder`], or can be constructed explicitly.
#[derive(Clone)]
pub struct SessionSettings {
    begin_string: Arc<String>,
    sender_comp_id: String,
    target_comp_id: String,
    addr: SocketAddr,
    epoch: Arc<String>,
    store_path: PathBuf,
    log_dir: PathBuf,
    heartbeat_timeout: Duration,
    start_time: NaiveTime,
    password: Option<String>,
    reset_seq_num: bool,
    max_reconnect_attempts: u32,
    reconnect_interval: Duration,
    max_missed_heartbeats: u32,
    logon_timeout: Duration,
    replay_window: Option<u32>,
    app_channel_capacity: usize,
}

/// A builder for easily configuring all the fields of a [`SessionSettings`]
///
/// The following settings are required to be set:
/// * sender comp id
/// * target comp id
/// * addr
/// * store path
/// * log dir
#[derive(Default)]
pub struct SessionSettingsBuilder {
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    addr: Option<SocketAddr>,
    begin_string: Option<String>,
    epoch: Option<String>,
    store_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    heartbeat_timeout: Option<Duration>,
    start_time: Option<NaiveTime>,
    password: Option<String>,
    reset_seq_num: Option<bool>,
    max_reconnect_attempts: Option<u32>,
    reconnect_interval: Option<Duration>,
    max_missed_heartbeats: Option<u32>,
    logon_timeout: Option<Duration>,
    replay_window: Option<u32>,
    app_channel_capacity: Option<usize>,
}

impl SessionSettingsBuilder {
    pub fn new() -> SessionSettingsBuilder {
        Default::default()
    }

    /// The time the FIX session starts each day.
    pub fn with_start_time(mut self, start_time: NaiveTime) -> Self {
        self.set_start_time(start_time);
        self
    }
    pub fn set_start_time(&mut self, start_time: NaiveTime) {
        self.start_time = Some(start_time);
    }

    /// The `SenderCompID(49)` that will be included in each message.
    pub fn with_sender_comp_id(mut self, sender_comp_id: &str) -> Self {
        self.set_sender_comp_id(sender_comp_id);
        self
    }
    pub fn set_sender_comp_id(&mut self, sender_comp_id: &str) {
        self.sender_comp_id = Some(sender_comp_id.to_string());
    }

    /// The `TargetCompID(56)` that will be included in each message.
    pub fn with_target_comp_id(mut self, target_comp_id: &str) -> Self {
        self.set_target_comp_id(target_comp_id);
        self
    }
    pub fn set_target_comp_id(&mut self, target_comp_id: &str) {
        self.target_comp_id = Some(target_comp_id.to_string());
    }

    /// The address to initiate a connection to, or accept connections on.
    pub fn with_socket_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }
    pub fn set_socket_addr(&mut self, addr: SocketAddr) {
        self.addr = Some(addr);
    }

    /// The `BeginString(8)` that will be included in each message.
    pub fn with_begin_string(mut self, begin_string: &str) -> Self {
        self.set_begin_string(begin_string);
        self
    }
    pub fn set_begin_string(&mut self, begin_string: &str) {
        self.begin_string = Some(begin_string.to_string());
    }

    /// A local unique identifier for this FIX session.
    pub fn with_epoch(mut self, epoch: &str) -> Self {
        self.set_epoch(epoch);
        self
    }
    pub fn set_epoch(&mut self, epoch: &str) {
        self.epoch = Some(epoch.to_string());
    }

    /// The file that should be used as the sqlite database file.
    pub fn with_store_path(mut self, store_path: PathBuf) -> Self {
        self.set_store_path(store_path);
        self
    }
    pub fn set_store_path(&mut self, store_path: PathBuf) {
        self.store_path = Some(store_path);
    }

    /// The directory that should be used to create log files.
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.set_log_dir(log_dir);
        self
    }
    pub fn set_log_dir(&mut self, log_dir: PathBuf) {
        self.log_dir = Some(log_dir);
    }

    /// The timeout length used for sending `Heartbeat<0>` messages.
    pub fn with_heartbeat_timeout(mut self, hb_timeout: Duration) -> Self {
        self.set_heartbeat_timeout(hb_timeout);
        self
    }
    pub fn set_heartbeat_timeout(&mut self, hb_timeout: Duration) {
        self.heartbeat_timeout = Some(hb_timeout);
    }

    /// The `Password(554)` to include on the `Logon<A>` message, if the peer requires one.
    pub fn with_password(mut self, password: &str) -> Self {
        self.set_password(password);
        self
    }
    pub fn set_password(&mut self, password: &str) {
        self.password = Some(password.to_string());
    }

    /// Whether the `Logon<A>` should carry `ResetSeqNumFlag(141)=Y`, resetting both sides'
    /// sequence numbers to 1 instead of resuming from the persisted store.
    pub fn with_reset_seq_num(mut self, reset_seq_num: bool) -> Self {
        self.set_reset_seq_num(reset_seq_num);
        self
    }
    pub fn set_reset_seq_num(&mut self, reset_seq_num: bool) {
        self.reset_seq_num = Some(reset_seq_num);
    }

    /// The number of consecutive reconnect attempts to make after a recoverable disconnect
    /// before giving up. Defaults to `0` (no automatic reconnect).
    pub fn with_max_reconnect_attempts(mut self, max_reconnect_attempts: u32) -> Self {
        self.set_max_reconnect_attempts(max_reconnect_attempts);
        self
    }
    pub fn set_max_reconnect_attempts(&mut self, max_reconnect_attempts: u32) {
        self.max_reconnect_attempts = Some(max_reconnect_attempts);
    }

    /// The delay between reconnect attempts.
    pub fn with_reconnect_interval(mut self, reconnect_interval: Duration) -> Self {
        self.set_reconnect_interval(reconnect_interval);
        self
    }
    pub fn set_reconnect_interval(&mut self, reconnect_interval: Duration) {
        self.reconnect_interval = Some(reconnect_interval);
    }

    /// The number of consecutive `TestRequest<1>` messages that can go unanswered before the
    /// connection is considered dead.
    pub fn with_max_missed_heartbeats(mut self, max_missed_heartbeats: u32) -> Self {
        self.set_max_missed_heartbeats(max_missed_heartbeats);
        self
    }
    pub fn set_max_missed_heartbeats(&mut self, max_missed_heartbeats: u32) {
        self.max_missed_heartbeats = Some(max_missed_heartbeats);
    }

    /// The time to wait for the peer's `Logon<A>` response before giving up on the connection.
    pub fn with_logon_timeout(mut self, logon_timeout: Duration) -> Self {
        self.set_logon_timeout(logon_timeout);
        self
    }
    pub fn set_logon_timeout(&mut self, logon_timeout: Duration) {
        self.logon_timeout = Some(logon_timeout);
    }

    /// The maximum number of messages back the engine will serve from the persisted store when
    /// honoring a `ResendRequest<2>`. Requests reaching further back are satisfied with a single
    /// gap fill instead of a full replay. `None` means no bound is applied.
    pub fn with_replay_window(mut self, replay_window: u32) -> Self {
        self.set_replay_window(replay_window);
        self
    }
    pub fn set_replay_window(&mut self, replay_window: u32) {
        self.replay_window = Some(replay_window);
    }

    /// The capacity of the channel used to deliver accepted application messages to the caller.
    /// Once full, the engine logs the overflow at `error` level and drops the message rather than
    /// applying backpressure to the socket reader. Defaults to `1000`.
    pub fn with_app_channel_capacity(mut self, app_channel_capacity: usize) -> Self {
        self.set_app_channel_capacity(app_channel_capacity);
        self
    }
    pub fn set_app_channel_capacity(&mut self, app_channel_capacity: usize) {
        self.app_channel_capacity = Some(app_channel_capacity);
    }

    /// Build the [`SessionSettings`] struct.
    ///
    /// Returns an `Err(ApplicationError::SettingRequired)` if not all of the required fields
    /// were set.
    pub fn build(self) -> Result<SessionSettings, ApplicationError> {
        let sender_comp_id = self
            .sender_comp_id
            .ok_or(ApplicationError::SettingRequired(
                "sender_comp_id".to_string(),
            ))?;
        let target_comp_id = self
            .target_comp_id
            .ok_or(ApplicationError::SettingRequired(
                "target_comp_id".to_string(),
            ))?;
        let addr = self
            .addr
            .ok_or(ApplicationError::SettingRequired("addr".to_string()))?;
        let store_path = self
            .store_path
            .ok_or(ApplicationError::SettingRequired("store_path".to_string()))?;
        let log_dir = self
            .log_dir
            .ok_or(ApplicationError::SettingRequired("log_dir".to_string()))?;

        Ok(SessionSettings {
            begin_string: Arc::new(self.begin_string.unwrap_or(String::from("FIX.4.4"))),
            epoch: Arc::new(
                self.epoch
                    .unwrap_or(format!("{}_{}", &sender_comp_id, &target_comp_id)),
            ),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(Duration::from_secs(30)),
            start_time: self.start_time.unwrap_or_default(),
            password: self.password,
            reset_seq_num: self.reset_seq_num.unwrap_or(false),
            max_reconnect_attempts: self.max_reconnect_attempts.unwrap_or(0),
            reconnect_interval: self
                .reconnect_interval
                .unwrap_or(Duration::from_secs(5)),
            max_missed_heartbeats: self.max_missed_heartbeats.unwrap_or(1),
            logon_timeout: self.logon_timeout.unwrap_or(Duration::from_secs(10)),
            replay_window: self.replay_window,
            sender_comp_id,
            target_comp_id,
            addr,
            store_path,
            log_dir,
        })
    }
}

impl SessionSettings {
    /// Creates a new [`SessionSettingsBuilder`]
    pub fn builder() -> SessionSettingsBuilder {
        SessionSettingsBuilder::new()
    }

    /// Load [`SessionSettings`] from a TOML configuration file.
    ///
    /// See [`config`] for the recognized keys.
    pub fn from_config_file(path: impl AsRef<std::path::Path>) -> Result<Self, ApplicationError> {
        config::from_path(path.as_ref())
    }

    fn expected_sender_comp_id(&self) -> &str {
        &self.target_comp_id
    }

    fn expected_target_comp_id(&self) -> &str {
        &self.sender_comp_id
    }
}

/// A handle on a FIX engine instance.
///
/// The [`FixApplicationHandle`] allows for requesting the basic operations of starting the FIX connection, sending
/// a message to the peer, and ending the connection.
///
/// The handle offers asynchronous and synchronous APIs for these operations. As well as functions
/// that return immedietly with a [`oneshot::Receiver`] that will eventually return the result of the
/// operation.
///
/// The underlying engine could stop running at any moment for a variety of reasons. Only until you
/// attempt an operation, will you learn the engine has stopped by receiving an
/// [`ApplicationError::SessionEnded`].
///
/// [`FixApplicationHandle`] `impl`'s [`Clone`], [`Send`] and [`Sync`] and therefore multiple
/// copies of the handle can be made and passed to different threads that can all request messages
/// to be sent. Only one thread has to call [`end`] for the engine to terminate the connection.
///
/// [`oneshot::Receiver`]: https://docs.rs/tokio/latest/tokio/sync/oneshot/struct.Receiver.html
/// [`end`]: FixApplicationHandle::end
///
/// # Example - Multiple Threads
///
///```no_run
/// use fixcore::{
///     SessionSettings, FixApplicationInitiator, ApplicationError
/// };
/// use fixcore::fix::{encode::MessageBuilder, generated::MsgType};
/// # use anyhow::Result;
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// #    let settings = SessionSettings::builder()
/// #        .with_sender_comp_id("my_id")
/// #        .with_target_comp_id("peer_id")
/// #        .with_store_path("./store".into())
/// #        .with_log_dir("./log".into())
/// #        .with_socket_addr("127.0.0.1:0".parse().unwrap())
/// #        .build()?;
///
/// let (handle, mut receiver) = FixApplicationInitiator::build(settings)?
///     .initiate()
///     .await?;
/// receiver.close();
///
/// // FixApplicationHandle can be cloned
/// let handle1 = handle.clone();
/// let handle2 = handle.clone();
///
/// // FixApplicationHandle clones can be sent across threads and tasks
/// let h1 = tokio::spawn(async move {
///
///     // thread logic here...
///
///     let builder = MessageBuilder::new(
///         &handle1.begin_string(),
///         MsgType::ORDER_SINGLE.into()
///     );
///     handle1.send_message_async(builder).await
///
///     // ...
/// });
///
/// // send to multiple tasks...
/// let h2 = tokio::spawn(async move {
///     let builder = MessageBuilder::new(
///         &handle2.begin_string(),
///         MsgType::ORDER_SINGLE.into()
///     );
///     handle2.send_message_async(builder).await
/// });
///
/// // wait for all threads to finish...
/// let (res1, res2) = tokio::join!(h1, h2);
/// res1??;
/// res2??;
///     
/// // end the FIX connection
/// handle.end_async().await?;
///  #   Ok(())
/// # }
///
///```
#[derive(Clone)]
pub struct FixApplicationHandle {
    request_sender: mpsc::UnboundedSender<Request>,
    begin_string: Arc<String>,
}

impl FixApplicationHandle {
    /// Send a request to the engine to start the connection and return immediately.
    ///
    /// The receiver will eventually yield `true` if a connection was successfully established, or
    /// `false` othersize.
    pub fn start(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let logon_request = Request::Logon { resp_sender };
        let _ = self.request_sender.send(logon_request);
        Ok(resp_receiver)
    }
    /// Send a request to the engine to start the connection and await asynchronously.
    pub async fn start_async(&self) -> Result<(), ApplicationError> {
        let resp_sender = self.start()?;
        if Ok(true) != resp_sender.await {
            return Err(ApplicationError::LogonFailed);
        }
        Ok(())
    }
    /// Send a request to the engine to start a connection, and block until a result is returned.
    pub fn start_sync(&self) -> Result<(), ApplicationError> {
        let resp_receiver = self.start()?;
        if Ok(true) != resp_receiver.blocking_recv() {
            return Err(ApplicationError::LogonFailed);
        }
        Ok(())
    }

    /// Send a request to the engine to send the message in the [`MessageBuilder`] to the peer, and return immediately.
    ///
    /// If the request was successfully sent to the engine, a [`oneshot::Receiver`] will be
    /// returned.
    ///
    /// The receiver will yield `true` once the message has successfully sent over the TCP
    /// connection. It will yeild `false` if a message cannot be sent.
    ///
    /// [`oneshot::Receiver`]: https://docs.rs/tokio/latest/tokio/sync/oneshot/struct.Receiver.html
    pub fn send_message(
        &self,
        builder: MessageBuilder,
    ) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let send_message_request = Request::SendMessage {
            resp_sender,
            builder,
        };
        let _ = self.request_sender.send(send_message_request);
        Ok(resp_receiver)
    }
    /// Send a request to the engine to send the message in `builder` and await asynchronously.
    pub async fn send_message_async(
        &self,
        builder: MessageBuilder,
    ) -> Result<(), ApplicationError> {
        let resp_sender = self.send_message(builder)?;
        if Ok(true) != resp_sender.await {
            return Err(ApplicationError::SendMessageFailed);
        }
        Ok(())
    }
    /// Send a request to the engine to send the message in `builder` and block until a result is
    /// returned.
    pub fn send_message_sync(&self, builder: MessageBuilder) -> Result<(), ApplicationError> {
        let resp_receiver = self.send_message(builder)?;
        if Ok(true) != resp_receiver.blocking_recv() {
            return Err(ApplicationError::SendMessageFailed);
        }
        Ok(())
    }

    /// Send a request to the engine to end the FIX connection, and return immediately.
    ///
    /// If the request was successfully send to the engine, a [`oneshot::Receiver`] will be
    /// returned.
    ///
    /// The receiver will yield `true` is the FIX connection is over, and ended without any issues.
    /// Otherwise it will be `false`.
    ///
    /// [`oneshot::Receiver`]: https://docs.rs/tokio/latest/tokio/sync/oneshot/struct.Receiver.html
    pub fn end(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        let (resp_sender, resp_receiver) = oneshot::channel();
        let logout_request = Request::Logout { resp_sender };
        let _ = self.request_sender.send(logout_request);
        Ok(resp_receiver)
    }
    /// Send a request to the engine to end the FIX connection, and await asynchronously.
    pub async fn end_async(&self) -> Result<(), ApplicationError> {
        let resp_sender = self.end()?;
        if Ok(true) != resp_sender.await {
            return Err(ApplicationError::LogoutFailed);
        }
        Ok(())
    }
    /// Send a request to the engine to end the FIX connection, and block until a result is
    /// returned.
    pub fn end_sync(&self) -> Result<(), ApplicationError> {
        let resp_receiver = self.end()?;
        if Ok(true) != resp_receiver.blocking_recv() {
            return Err(ApplicationError::LogoutFailed);
        }
        Ok(())
    }

    /// Get the `BeginString(8)` of this FIX Session. Should generally be `"FIX.4.4"`.
    pub fn begin_string(&self) -> Arc<String> {
        Arc::clone(&self.begin_string)
    }
}

/// A struct that can initiate the TCP connection to the peer and create a FIX engine instance.
pub struct FixApplicationInitiator {
    settings: SessionSettings,
    stream_factory: StreamFactory,
}

impl FixApplicationInitiator {
    /// Build a `FixApplicationInitiator` that will create a FIX engine using `settings`.
    pub fn build(settings: SessionSettings) -> Result<FixApplicationInitiator, ApplicationError> {
        let stream_factory = StreamFactory::build(&settings);
        let fix_app_client = FixApplicationInitiator {
            settings,
            stream_factory,
        };
        Ok(fix_app_client)
    }

    /// Initiate a TCP connection and start the FIX engine with the current asynchronous runtime.
    ///
    /// If the connection is successfully made, a [`FixApplicationHandle`] will be returned, and an
    /// `UnboundedReceiver<Arc<MsgBuf>>` will be returned.
    ///
    /// The application handle can be used to start the FIX connection, send messages and end the
    /// connection.
    ///
    /// The receiver is a channel where all incoming, valid application messages can be received.
    /// If you do not want to use the channel, it is recommended you call [`close`].
    ///
    /// If the connection drops for a recoverable reason (a transport error or a missed-heartbeat
    /// timeout) the engine will reconnect according to `max_reconnect_attempts` and
    /// `reconnect_interval`; a terminal protocol or persistence error ends the task for good.
    ///
    /// [`close`]: tokio::sync::mpsc::Receiver::close
    pub async fn initiate(
        self,
    ) -> Result<(FixApplicationHandle, mpsc::Receiver<Arc<MsgBuf>>), ApplicationError> {
        let stream = self.stream_factory.stream().await?;
        let (request_sender, request_receiver) = mpsc::unbounded_channel::<Request>();
        let begin_string = Arc::clone(&self.settings.begin_string);

        let (app_message_event_sender, app_message_event_receiver) =
            mpsc::channel(self.settings.app_channel_capacity);

        tokio::spawn(run_with_reconnect(
            self.settings,
            self.stream_factory,
            Some(stream),
            request_receiver,
            app_message_event_sender,
        ));

        let handle = FixApplicationHandle {
            request_sender,
            begin_string,
        };

        Ok((handle, app_message_event_receiver))
    }

    /// Initiate a TCP connection and start the FIX engine that will be driven by `runtime`.
    pub fn initiate_with_runtime(
        self,
        runtime: tokio::runtime::Runtime,
    ) -> Result<(FixApplicationHandle, mpsc::Receiver<Arc<MsgBuf>>), ApplicationError> {
        let (request_sender, request_receiver) = mpsc::unbounded_channel::<Request>();
        let (app_message_event_sender, app_message_event_receiver) =
            mpsc::channel(self.settings.app_channel_capacity);
        let begin_string = Arc::clone(&self.settings.begin_string);
        let stream = runtime.block_on(self.stream_factory.stream())?;

        std::thread::spawn(move || {
            runtime.block_on(run_with_reconnect(
                self.settings,
                self.stream_factory,
                Some(stream),
                request_receiver,
                app_message_event_sender,
            ));
        });
        let handle = FixApplicationHandle {
            request_sender,
            begin_string,
        };

        Ok((handle, app_message_event_receiver))
    }

    /// Initiate a TCP connection, and a runtime will be created internally to drive the engine.
    pub fn initiate_sync(
        self,
    ) -> Result<(FixApplicationHandle, mpsc::Receiver<Arc<MsgBuf>>), ApplicationError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        self.initiate_with_runtime(runtime)
    }
}

/// Drives the session engine to completion, reconnecting on recoverable failures until
/// `settings.max_reconnect_attempts` is exhausted or a terminal error is hit.
async fn run_with_reconnect(
    settings: SessionSettings,
    stream_factory: StreamFactory,
    mut existing_stream: Option<TcpStream>,
    mut request_receiver: mpsc::UnboundedReceiver<Request>,
    mut app_message_event_sender: mpsc::Sender<Arc<MsgBuf>>,
) {
    let mut attempts = 0;
    loop {
        let stream = match existing_stream.take() {
            Some(s) => s,
            None => match stream_factory.stream().await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to reconnect");
                    return;
                }
            },
        };

        let result = fix::spin_session(
            stream,
            &mut request_receiver,
            &mut app_message_event_sender,
            settings.clone(),
        )
        .await;

        match result {
            Ok(()) => return,
            Err(e) => {
                let recoverable = e
                    .downcast_ref::<fix::SessionError>()
                    .map(|se| se.is_recoverable())
                    .unwrap_or(true);
                if !recoverable || attempts >= settings.max_reconnect_attempts {
                    tracing::error!(error = %e, attempts, "session ended, not reconnecting");
                    return;
                }
                attempts += 1;
                tracing::warn!(error = %e, attempts, "session dropped, reconnecting");
                tokio::time::sleep(settings.reconnect_interval).await;
            }
        }
    }
}

enum StreamFactory {
    Client(std::net::SocketAddr),
}

impl StreamFactory {
    fn build(settings: &SessionSettings) -> Self {
        StreamFactory::Client(settings.addr)
    }
    async fn stream(&self) -> Result<TcpStream, std::io::Error> {
        match self {
            StreamFactory::Client(addr) => {
                let socket = TcpSocket::new_v4()?;
                let mut stream = socket.connect(*addr).await?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
        }
    }
}
