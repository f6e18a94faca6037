use clap::{Parser, ValueHint};
use fixcore::{
    fix,
    fix::decode::parse_field,
    fix::generated::{MsgType, Tags},
    ApplicationError, FixApplicationHandle, FixApplicationInitiator, SessionSettings,
};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::naive::NaiveTime;

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = s.parse()?;
    Ok(std::time::Duration::from_secs(seconds))
}

fn parse_time(s: &str) -> Result<NaiveTime, chrono::format::ParseError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
}

const ID_SOURCE: &str = "A";

/// Connect a single FIX 4.4 client session and place a couple of test orders.
///
/// Settings can be supplied either as a `--config` TOML file (see [`fixcore::config`]) or as
/// individual flags; flags always take precedence over a loaded config file.
#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
struct Opts {
    /// Path to a TOML settings file (see the `config` module docs for recognized keys).
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// SenderCompID
    #[arg(short, long, required_unless_present = "config")]
    sender_comp_id: Option<String>,

    /// TargetCompID
    #[arg(short, long, required_unless_present = "config")]
    target_comp_id: Option<String>,

    /// Address to connect to
    #[arg(short, long, required_unless_present = "config")]
    addr: Option<SocketAddr>,

    /// Location of the sequence/replay store
    #[arg(short = 'r', long, value_hint = ValueHint::FilePath, required_unless_present = "config")]
    store: Option<PathBuf>,

    /// Location of log files
    #[arg(short = 'o', long, value_hint = ValueHint::FilePath, required_unless_present = "config")]
    log: Option<PathBuf>,

    /// Password to send on Logon<A>, tag 554
    #[arg(long)]
    password: Option<String>,

    /// Request both sides reset their sequence numbers on Logon<A>, tag 141
    #[arg(long)]
    reset_seq_num: bool,

    /// Unique identifier of FIX session
    #[arg(short, long, default_value = "999")]
    epoch: Arc<String>,

    /// Heartbeat interval in seconds, tag 108
    #[arg(long, default_value = "30", value_parser = parse_duration)]
    heartbeat_timeout: Duration,

    /// Time session should start each day in format HH:MM:SS
    #[arg(long, default_value = "23:59:59", value_parser = parse_time)]
    start: NaiveTime,

    /// Number of reconnect attempts after a recoverable disconnect
    #[arg(long, default_value = "0")]
    max_reconnect_attempts: u32,

    /// Delay between reconnect attempts, in seconds
    #[arg(long, default_value = "5", value_parser = parse_duration)]
    reconnect_interval: Duration,

    /// Number of consecutive unanswered TestRequests tolerated before disconnecting
    #[arg(long, default_value = "1")]
    max_missed_heartbeats: u32,

    /// Seconds to wait for the peer's Logon<A> before giving up
    #[arg(long, default_value = "10", value_parser = parse_duration)]
    logon_timeout: Duration,

    /// Cap on how many messages back a ResendRequest<2> will be served from the store before
    /// falling back to a gap fill
    #[arg(long)]
    replay_window: Option<u32>,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

#[derive(Default)]
struct ApplicationParserCallback<'a> {
    _msg_type: char,
    msg_seq_num: u32,
    cl_order_id: Option<&'a [u8]>,
}

impl<'a> fix::decode::ParserCallback<'a> for ApplicationParserCallback<'a> {
    fn header(&mut self, key: u32, value: &'a [u8]) -> Result<bool, fix::SessionError> {
        if let Ok(fix::generated::Tags::MsgSeqNum) = key.try_into() {
            self.msg_seq_num =
                parse_field::<u32>(value).or(Err(fix::SessionError::MissingMsgSeqNum {
                    text: String::from("Missing MsgSeqNum"),
                }))?;
        }
        Ok(true)
    }
    fn body(&mut self, key: u32, value: &'a [u8]) -> Result<bool, fix::SessionError> {
        if let Ok(fix::generated::Tags::ClOrdID) = key.try_into() {
            self.cl_order_id = Some(value);
        }
        Ok(true)
    }
    fn trailer(&mut self, _key: u32, _value: &'a [u8]) -> Result<bool, fix::SessionError> {
        Ok(false)
    }
    fn sequence_num(&self) -> u32 {
        self.msg_seq_num
    }
}

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let settings = if let Some(config_path) = &opts.config {
        SessionSettings::from_config_file(config_path)?
    } else {
        let mut builder = SessionSettings::builder()
            .with_sender_comp_id(opts.sender_comp_id.as_deref().expect("required"))
            .with_target_comp_id(opts.target_comp_id.as_deref().expect("required"))
            .with_socket_addr(opts.addr.expect("required"))
            .with_epoch(&opts.epoch)
            .with_store_path(opts.store.clone().expect("required"))
            .with_log_dir(opts.log.clone().expect("required"))
            .with_heartbeat_timeout(opts.heartbeat_timeout)
            .with_start_time(opts.start)
            .with_reset_seq_num(opts.reset_seq_num)
            .with_max_reconnect_attempts(opts.max_reconnect_attempts)
            .with_reconnect_interval(opts.reconnect_interval)
            .with_max_missed_heartbeats(opts.max_missed_heartbeats)
            .with_logon_timeout(opts.logon_timeout);
        if let Some(password) = &opts.password {
            builder = builder.with_password(password);
        }
        if let Some(replay_window) = opts.replay_window {
            builder = builder.with_replay_window(replay_window);
        }
        builder.build()?
    };

    let (fix_handle, mut event_receiver) = FixApplicationInitiator::build(settings)?
        .initiate()
        .await?;

    tokio::spawn(async move {
        while let Some(msg) = event_receiver.recv().await {
            println!("got an application message: {}", msg);
        }
    });

    fix_handle.start_async().await?;

    let _ = send_order(
        &fix_handle,
        "ID1",
        1,
        "AAPL  230803P00100000",
        "2.31",
        true,
        "ELMD",
        "ABCD1234",
    )
    .await;
    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    let _ = send_order(
        &fix_handle,
        "ID2",
        1,
        "AAPL  230803P00100000",
        "2.31",
        true,
        "ELMD",
        "ABCD1234",
    )
    .await;
    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    fix_handle.end_async().await?;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn send_order(
    fix_app_client: &FixApplicationHandle,
    sguid: &str,
    qty: u32,
    symbol: &str,
    price: &str,
    is_buy: bool,
    exchange: &str,
    account: &str,
) -> Result<(), ApplicationError> {
    let msg_type = MsgType::ORDER_SINGLE;

    let side = if is_buy {
        fix::generated::Side::BUY
    } else {
        fix::generated::Side::SELL
    };
    let qty = fix::encode::SerializedInt::from(qty);
    let transact_time = fix::encode::formatted_time();

    let builder = fix::encode::MessageBuilder::new(&fix_app_client.begin_string(), msg_type.into())
        .push(Tags::Account, account.as_bytes())
        .push(Tags::ClOrdID, sguid.as_bytes())
        .push(Tags::IDSource, ID_SOURCE.as_bytes())
        .push(Tags::OrderQty, qty.as_bytes())
        .push(Tags::OrdType, fix::generated::OrdType::LIMIT.into())
        .push(Tags::Price, price.as_bytes())
        .push(Tags::SecurityID, symbol.as_bytes())
        .push(Tags::Side, side.into())
        .push(
            Tags::TimeInForce,
            fix::generated::TimeInForce::IMMEDIATE_OR_CANCEL.into(),
        )
        .push(Tags::TransactTime, transact_time.as_bytes())
        .push(Tags::OpenClose, fix::generated::OpenClose::OPEN.into())
        .push(Tags::ExDestination, exchange.as_bytes());

    fix_app_client.send_message_async(builder).await
}

#[allow(dead_code)]
fn confirm_order(msg: Option<Arc<fix::mem::MsgBuf>>, id: &str) -> Result<(), Box<dyn Error>> {
    match msg {
        Some(msg) => {
            let mut cb: ApplicationParserCallback = Default::default();
            let msg = Arc::new(&msg);

            fix::decode::parse(&msg.as_ref()[..], &mut cb)?;

            if cb.cl_order_id == Some(id.as_bytes()) {
                Ok(())
            } else {
                Err(Box::<dyn Error>::from("ClOrdID did not match!"))
            }
        }
        None => Err(Box::<dyn Error>::from("No message received")),
    }
}
